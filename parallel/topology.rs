use crate::config::ProcessLayout;
use std::ops::Range;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while deriving or provisioning the parallel decomposition.
/// All of them are fatal and surface before the first collective call.
#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("Process layout is invalid: {0}")]
    InvalidLayout(String),
    #[error("Cannot split {points} rows across {units} worker units without leaving a unit empty.")]
    EmptyPartition { points: usize, units: usize },
    #[error(
        "Communicating group scratch at '{}' needs {required} bytes but only {available} are available.",
        .path.display()
    )]
    ScratchCapacity {
        path: PathBuf,
        required: u64,
        available: u64,
    },
    #[error("Communicating group scratch file '{}' could not be prepared: {source}", .path.display())]
    Scratch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Splits `total` items into `parts` contiguous ranges whose lengths differ by
/// at most one. The first `total % parts` ranges receive the extra item.
pub fn partition(total: usize, parts: usize) -> Vec<Range<usize>> {
    if parts == 0 {
        return Vec::new();
    }
    let base = total / parts;
    let rem = total % parts;
    let mut out = Vec::with_capacity(parts);
    let mut cursor = 0usize;
    for part in 0..parts {
        let len = base + usize::from(part < rem);
        out.push(cursor..cursor + len);
        cursor += len;
    }
    out
}

/// Deterministic ownership map for the rows of the N x N distance matrix.
///
/// Every process owns one contiguous row block and every worker thread inside a
/// process owns one contiguous sub-block of it. Processes are also grouped into
/// communicating groups: `groups_per_node` groups per node, each made of
/// consecutive ranks, whose first member is the group leader.
#[derive(Debug, Clone)]
pub struct Topology {
    points: usize,
    processes_per_node: usize,
    group_size: usize,
    process_rows: Vec<Range<usize>>,
    thread_rows: Vec<Vec<Range<usize>>>,
}

impl Topology {
    pub fn new(points: usize, layout: &ProcessLayout) -> Result<Self, TopologyError> {
        let processes = layout.process_count;
        let threads = layout.threads_per_process;
        if processes == 0 || threads == 0 {
            return Err(TopologyError::InvalidLayout(format!(
                "process count ({processes}) and threads per process ({threads}) must be positive"
            )));
        }
        let per_node = layout.processes_per_node;
        if per_node == 0 || processes % per_node != 0 {
            return Err(TopologyError::InvalidLayout(format!(
                "{processes} processes cannot be spread evenly with {per_node} processes per node"
            )));
        }
        let groups = layout.groups_per_node;
        if groups == 0 || per_node % groups != 0 {
            return Err(TopologyError::InvalidLayout(format!(
                "{per_node} processes per node cannot form {groups} equally sized communicating groups"
            )));
        }
        let units = processes * threads;
        if units > points {
            return Err(TopologyError::EmptyPartition { points, units });
        }

        let process_rows = partition(points, processes);
        let thread_rows = process_rows
            .iter()
            .map(|rows| {
                partition(rows.len(), threads)
                    .into_iter()
                    .map(|r| rows.start + r.start..rows.start + r.end)
                    .collect()
            })
            .collect();

        Ok(Self {
            points,
            processes_per_node: per_node,
            group_size: per_node / groups,
            process_rows,
            thread_rows,
        })
    }

    pub fn points(&self) -> usize {
        self.points
    }

    pub fn process_count(&self) -> usize {
        self.process_rows.len()
    }

    pub fn threads_per_process(&self) -> usize {
        self.thread_rows.first().map_or(0, Vec::len)
    }

    /// Global row range owned by `rank`.
    pub fn process_rows(&self, rank: usize) -> Range<usize> {
        self.process_rows[rank].clone()
    }

    /// Global row ranges of every thread of `rank`, in thread-id order.
    pub fn thread_rows(&self, rank: usize) -> &[Range<usize>] {
        &self.thread_rows[rank]
    }

    pub fn node_of(&self, rank: usize) -> usize {
        rank / self.processes_per_node
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn group_count(&self) -> usize {
        self.process_count() / self.group_size
    }

    pub fn group_of(&self, rank: usize) -> usize {
        rank / self.group_size
    }

    /// Ranks belonging to `group`, leader first.
    pub fn group_members(&self, group: usize) -> Range<usize> {
        let start = group * self.group_size;
        start..start + self.group_size
    }

    pub fn member_index(&self, rank: usize) -> usize {
        rank % self.group_size
    }

    pub fn is_group_leader(&self, rank: usize) -> bool {
        self.member_index(rank) == 0
    }
}

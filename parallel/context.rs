use super::comm::{Communicator, ReduceOp};
use super::group::GroupExchange;
use super::topology::{Topology, TopologyError};
use crate::config::ProcessLayout;
use crate::types::DamdsError;
use rayon::prelude::*;
use std::ops::Range;

/// The share of work handed to one worker thread: its id inside the process
/// and the global rows it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadUnit {
    pub index: usize,
    pub rows: Range<usize>,
}

/// Everything one process needs to take part in the run: its communicator, the
/// shared decomposition, its worker pool and, optionally, the communicating
/// group it reduces through. One context is owned per process and passed to
/// every component explicitly.
pub struct ParallelContext {
    comm: Box<dyn Communicator>,
    topology: Topology,
    pool: rayon::ThreadPool,
    exchange: Option<GroupExchange>,
}

impl ParallelContext {
    pub fn new(comm: Box<dyn Communicator>, topology: Topology) -> Result<Self, DamdsError> {
        if comm.size() != topology.process_count() {
            return Err(TopologyError::InvalidLayout(format!(
                "communicator has {} ranks but the decomposition expects {}",
                comm.size(),
                topology.process_count()
            ))
            .into());
        }
        let rank = comm.rank();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(topology.threads_per_process())
            .thread_name(move |i| format!("damds-r{rank}-t{i}"))
            .build()?;
        Ok(Self {
            comm,
            topology,
            pool,
            exchange: None,
        })
    }

    /// Builds the context of one rank from a resolved process layout. When the
    /// layout names a scratch directory, reductions go through a communicating
    /// group whose slots hold `max_reduce_len` values. Collective over `comm`.
    pub fn from_layout(
        comm: Box<dyn Communicator>,
        points: usize,
        max_reduce_len: usize,
        layout: &ProcessLayout,
        tag: &str,
    ) -> Result<Self, DamdsError> {
        let topology = Topology::new(points, layout)?;
        let mut ctx = Self::new(comm, topology)?;
        if let Some(dir) = &layout.scratch_dir {
            let exchange = GroupExchange::establish(
                ctx.comm.as_ref(),
                &ctx.topology,
                dir,
                tag,
                max_reduce_len,
                layout.scratch_limit_bytes,
            )?;
            ctx.exchange = Some(exchange);
        }
        Ok(ctx)
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn is_root(&self) -> bool {
        self.comm.is_root()
    }

    pub fn process_count(&self) -> usize {
        self.topology.process_count()
    }

    pub fn thread_count(&self) -> usize {
        self.topology.threads_per_process()
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn uses_group_exchange(&self) -> bool {
        self.exchange.is_some()
    }

    /// Global rows owned by this process.
    pub fn process_rows(&self) -> Range<usize> {
        self.topology.process_rows(self.rank())
    }

    pub fn thread_units(&self) -> Vec<ThreadUnit> {
        self.topology
            .thread_rows(self.rank())
            .iter()
            .cloned()
            .enumerate()
            .map(|(index, rows)| ThreadUnit { index, rows })
            .collect()
    }

    /// Fork-join over the worker threads. The returned vector holds one slot per
    /// thread in thread-id order, so merging it is deterministic.
    pub fn for_each_thread<R, F>(&self, work: F) -> Vec<R>
    where
        F: Fn(ThreadUnit) -> R + Sync + Send,
        R: Send,
    {
        let units = self.thread_units();
        self.pool
            .install(|| units.into_par_iter().map(&work).collect())
    }

    /// Fork-join over the worker threads, handing each one the rows it owns of
    /// `block`, a row-major buffer of `width` columns covering this process's
    /// rows.
    pub fn for_each_thread_rows<F>(&self, block: &mut [f64], width: usize, work: F)
    where
        F: Fn(ThreadUnit, &mut [f64]) + Sync + Send,
    {
        debug_assert_eq!(block.len(), self.process_rows().len() * width);
        let mut rest = block;
        let mut chunks = Vec::with_capacity(self.thread_count());
        for unit in self.thread_units() {
            let (chunk, tail) = std::mem::take(&mut rest).split_at_mut(unit.rows.len() * width);
            chunks.push((unit, chunk));
            rest = tail;
        }
        self.pool.install(|| {
            chunks
                .into_par_iter()
                .for_each(|(unit, chunk)| work(unit, chunk))
        });
    }

    /// Sums `buf` over every process and replicates the result, through the
    /// communicating group when one is attached.
    pub fn all_reduce_sum(&self, buf: &mut [f64]) -> Result<(), DamdsError> {
        match &self.exchange {
            Some(exchange) => exchange.all_reduce_sum(buf),
            None => Ok(self.comm.all_reduce(buf, ReduceOp::Sum)?),
        }
    }

    pub fn all_reduce(&self, buf: &mut [f64], op: ReduceOp) -> Result<(), DamdsError> {
        match op {
            ReduceOp::Sum => self.all_reduce_sum(buf),
            other => Ok(self.comm.all_reduce(buf, other)?),
        }
    }

    /// Sums one scalar over every process.
    pub fn all_reduce_scalar(&self, value: f64) -> Result<f64, DamdsError> {
        let mut buf = [value];
        self.all_reduce_sum(&mut buf)?;
        Ok(buf[0])
    }

    pub fn barrier(&self) -> Result<(), DamdsError> {
        Ok(self.comm.barrier()?)
    }
}

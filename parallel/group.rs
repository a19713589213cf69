// ========================================================================================
//
//                   SHARED-MEMORY COMMUNICATING GROUPS (MEMORY-MAPPED)
//
// ========================================================================================
//
// Processes on the same node reduce through a memory-mapped scratch file instead
// of the network. File layout:
//
//   [0, 64)                       header: barrier arrival counter, barrier generation
//   [64, 64 + m * slot)           one slot per group member, written only by its owner
//   [64 + m * slot, .. + slot)    result region, written only by the group leader
//
// A reduction is: write own slot -> barrier -> leader sums the slots in member
// order and all-reduces with the other leaders -> leader writes the result ->
// barrier -> members copy the result out. Nobody writes another member's slot
// and nobody reads before the barrier has fired.

use super::comm::{Communicator, ReduceOp};
use super::topology::{Topology, TopologyError};
use crate::types::DamdsError;
use memmap2::MmapRaw;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use sysinfo::Disks;

const HEADER_BYTES: usize = 64;
const F64_BYTES: usize = std::mem::size_of::<f64>();
const SPINS_BEFORE_YIELD: u32 = 128;

/// Bytes a group scratch file needs for `members` slots of `slot_len` values.
pub fn scratch_bytes(members: usize, slot_len: usize) -> u64 {
    (HEADER_BYTES + (members + 1) * slot_len * F64_BYTES) as u64
}

pub struct GroupExchange {
    path: PathBuf,
    map: MmapRaw,
    member: usize,
    members: usize,
    slot_len: usize,
    leaders: Option<Box<dyn Communicator>>,
}

impl GroupExchange {
    /// Creates and maps the scratch file of the caller's group.
    ///
    /// This is a collective over `world`: every rank must call it with the same
    /// arguments. Capacity problems are agreed on by all ranks and reported
    /// before anything is written to the scratch region.
    pub fn establish(
        world: &dyn Communicator,
        topology: &Topology,
        scratch_dir: &Path,
        tag: &str,
        slot_len: usize,
        limit_bytes: Option<u64>,
    ) -> Result<Self, DamdsError> {
        let rank = world.rank();
        let group = topology.group_of(rank);
        let members = topology.group_size();
        let member = topology.member_index(rank);
        let is_leader = topology.is_group_leader(rank);
        let required = scratch_bytes(members, slot_len);
        let path = scratch_dir.join(format!("{tag}-group{group}.bin"));

        agree(world, check_capacity(scratch_dir, required, limit_bytes))?;

        let created = if is_leader {
            create_scratch(&path, required)
        } else {
            Ok(())
        };
        // Also the point after which members may open the file.
        agree(world, created)?;

        let mapped = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .and_then(|file| MmapRaw::map_raw(&file))
            .map_err(|source| TopologyError::Scratch {
                path: path.clone(),
                source,
            });
        let map = agree(world, mapped)?;

        let leaders = world.split(if is_leader { 0 } else { 1 })?;
        log::debug!(
            "Rank {rank} joined communicating group {group} as member {member}/{members} ({required} bytes at {})",
            path.display()
        );

        Ok(Self {
            path,
            map,
            member,
            members,
            slot_len,
            leaders: is_leader.then_some(leaders),
        })
    }

    pub fn is_leader(&self) -> bool {
        self.leaders.is_some()
    }

    pub fn slot_len(&self) -> usize {
        self.slot_len
    }

    /// Sums `buf` across every process of the run, replicating the result.
    pub fn all_reduce_sum(&self, buf: &mut [f64]) -> Result<(), DamdsError> {
        if buf.len() > self.slot_len {
            return Err(TopologyError::ScratchCapacity {
                path: self.path.clone(),
                required: (buf.len() * F64_BYTES) as u64,
                available: (self.slot_len * F64_BYTES) as u64,
            }
            .into());
        }

        self.write_region(self.member, buf);
        self.barrier();

        if let Some(leaders) = &self.leaders {
            for member in 1..self.members {
                let slot = self.read_region(member, buf.len());
                ReduceOp::Sum.combine(buf, slot);
            }
            leaders.all_reduce(buf, ReduceOp::Sum)?;
            self.write_region(self.members, buf);
        }

        self.barrier();

        if self.leaders.is_none() {
            buf.copy_from_slice(self.read_region(self.members, buf.len()));
        }
        Ok(())
    }

    fn region_offset(&self, region: usize) -> usize {
        HEADER_BYTES + region * self.slot_len * F64_BYTES
    }

    fn write_region(&self, region: usize, values: &[f64]) {
        debug_assert!(values.len() <= self.slot_len && region <= self.members);
        let offset = self.region_offset(region);
        // SAFETY: the region lies inside the mapping (sized by `scratch_bytes`),
        // is 8-byte aligned, and is written only by its owner between barriers.
        unsafe {
            let dst = self.map.as_mut_ptr().add(offset) as *mut f64;
            std::ptr::copy_nonoverlapping(values.as_ptr(), dst, values.len());
        }
    }

    fn read_region(&self, region: usize, len: usize) -> &[f64] {
        debug_assert!(len <= self.slot_len && region <= self.members);
        let offset = self.region_offset(region);
        // SAFETY: only called after a barrier that orders the owner's writes
        // before this read; no one writes the region until the next barrier.
        unsafe {
            let src = self.map.as_ptr().add(offset) as *const f64;
            std::slice::from_raw_parts(src, len)
        }
    }

    fn header(&self) -> (&AtomicU64, &AtomicU64) {
        // SAFETY: the mapping is page aligned and at least HEADER_BYTES long.
        // Both words are only ever accessed atomically, by every process.
        unsafe {
            let base = self.map.as_ptr();
            (
                &*(base as *const AtomicU64),
                &*(base.add(F64_BYTES) as *const AtomicU64),
            )
        }
    }

    /// Sense-reversing barrier living in the shared header.
    fn barrier(&self) {
        let (arrivals, generation) = self.header();
        let seen = generation.load(Ordering::Acquire);
        if arrivals.fetch_add(1, Ordering::AcqRel) + 1 == self.members as u64 {
            arrivals.store(0, Ordering::Relaxed);
            generation.fetch_add(1, Ordering::AcqRel);
            return;
        }
        let mut spins = 0u32;
        while generation.load(Ordering::Acquire) == seen {
            if spins < SPINS_BEFORE_YIELD {
                std::hint::spin_loop();
                spins += 1;
            } else {
                std::thread::yield_now();
            }
        }
    }
}

impl Drop for GroupExchange {
    fn drop(&mut self) {
        if self.is_leader() {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Turns a local outcome into a run-wide one: if any rank failed, every rank
/// fails, so no participant is left waiting in a later collective.
fn agree<T>(world: &dyn Communicator, local: Result<T, TopologyError>) -> Result<T, DamdsError> {
    let mut flag = [if local.is_err() { 1.0 } else { 0.0 }];
    world.all_reduce(&mut flag, ReduceOp::Max)?;
    match local {
        Err(e) => Err(e.into()),
        Ok(value) if flag[0] == 0.0 => Ok(value),
        Ok(_) => Err(TopologyError::InvalidLayout(
            "a peer rank failed to prepare its communicating group scratch".to_string(),
        )
        .into()),
    }
}

fn check_capacity(dir: &Path, required: u64, limit: Option<u64>) -> Result<(), TopologyError> {
    fs::create_dir_all(dir).map_err(|source| TopologyError::Scratch {
        path: dir.to_path_buf(),
        source,
    })?;
    let available = match (limit, available_space(dir)) {
        (Some(limit), Some(free)) => Some(limit.min(free)),
        (Some(limit), None) => Some(limit),
        (None, free) => free,
    };
    match available {
        Some(available) if required > available => Err(TopologyError::ScratchCapacity {
            path: dir.to_path_buf(),
            required,
            available,
        }),
        _ => Ok(()),
    }
}

/// Free bytes on the file system holding `dir`, when it can be determined.
fn available_space(dir: &Path) -> Option<u64> {
    let dir = dir.canonicalize().ok()?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| dir.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

/// Refuses to reuse an existing file: another live run may be mapping it.
fn create_scratch(path: &Path, bytes: u64) -> Result<(), TopologyError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)
        .and_then(|file| file.set_len(bytes))
        .map_err(|source| TopologyError::Scratch {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessLayout;
    use crate::parallel::comm::LocalWorld;
    use std::thread;

    fn topology(processes: usize, groups_per_node: usize) -> Topology {
        let layout = ProcessLayout {
            process_count: processes,
            processes_per_node: processes,
            groups_per_node,
            threads_per_process: 1,
            scratch_dir: None,
            scratch_limit_bytes: None,
        };
        Topology::new(32, &layout).unwrap()
    }

    #[test]
    fn grouped_reduction_matches_plain_sum() {
        let dir = tempfile::tempdir().unwrap();
        let topo = topology(4, 2);
        let handles: Vec<_> = LocalWorld::create(4)
            .into_iter()
            .map(|comm| {
                let topo = topo.clone();
                let dir = dir.path().to_path_buf();
                thread::spawn(move || {
                    let exchange =
                        GroupExchange::establish(&comm, &topo, &dir, "sum", 8, None).unwrap();
                    let rank = comm.rank() as f64;
                    let mut rounds = Vec::new();
                    for round in 0..3 {
                        let mut buf = vec![rank + round as f64, 1.0, -rank];
                        exchange.all_reduce_sum(&mut buf).unwrap();
                        rounds.push(buf);
                    }
                    comm.barrier().unwrap();
                    (exchange.is_leader(), rounds)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|(leader, _)| *leader).count(), 2);
        for (_, rounds) in results {
            for (round, buf) in rounds.iter().enumerate() {
                assert_eq!(buf, &vec![6.0 + 4.0 * round as f64, 4.0, -6.0]);
            }
        }
    }

    #[test]
    fn concurrent_runs_keep_their_own_scratch_files() {
        let dir = tempfile::tempdir().unwrap();
        let topo = topology(1, 1);
        let comm = crate::parallel::comm::SelfComm;
        let first = GroupExchange::establish(&comm, &topo, dir.path(), "run-1", 2, None).unwrap();
        let second = GroupExchange::establish(&comm, &topo, dir.path(), "run-2", 2, None).unwrap();
        assert!(dir.path().join("run-1-group0.bin").exists());
        assert!(dir.path().join("run-2-group0.bin").exists());

        let mut a = vec![1.0, 2.0];
        let mut b = vec![5.0, 6.0];
        first.all_reduce_sum(&mut a).unwrap();
        second.all_reduce_sum(&mut b).unwrap();
        assert_eq!(a, vec![1.0, 2.0]);
        assert_eq!(b, vec![5.0, 6.0]);

        let clash = GroupExchange::establish(&comm, &topo, dir.path(), "run-1", 2, None);
        assert!(matches!(
            clash,
            Err(DamdsError::Topology(TopologyError::Scratch { .. }))
        ));
        drop(first);
        assert!(!dir.path().join("run-1-group0.bin").exists());
    }

    #[test]
    fn undersized_scratch_fails_before_first_write() {
        let dir = tempfile::tempdir().unwrap();
        let topo = topology(2, 1);
        let handles: Vec<_> = LocalWorld::create(2)
            .into_iter()
            .map(|comm| {
                let topo = topo.clone();
                let dir = dir.path().to_path_buf();
                thread::spawn(move || {
                    GroupExchange::establish(&comm, &topo, &dir, "tiny", 1024, Some(128)).err()
                })
            })
            .collect();
        for handle in handles {
            let err = handle.join().unwrap().expect("capacity must be rejected");
            assert!(matches!(
                err,
                DamdsError::Topology(TopologyError::ScratchCapacity { .. })
            ));
        }
        assert!(!dir.path().join("tiny-group0.bin").exists());
    }

    #[test]
    fn oversized_buffer_is_a_capacity_error() {
        let dir = tempfile::tempdir().unwrap();
        let topo = topology(1, 1);
        let comm = crate::parallel::comm::SelfComm;
        let exchange = GroupExchange::establish(&comm, &topo, dir.path(), "one", 2, None).unwrap();
        let mut buf = vec![1.0; 3];
        assert!(exchange.all_reduce_sum(&mut buf).is_err());
        let mut small = vec![1.0, 2.0];
        exchange.all_reduce_sum(&mut small).unwrap();
        assert_eq!(small, vec![1.0, 2.0]);
    }
}

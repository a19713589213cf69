// ========================================================================================
//
//                     THE TWO-TIER PARALLEL RUNTIME: PROCESSES & THREADS
//
// ========================================================================================
//
// Processes exchange partial results through collective operations on a
// `Communicator`. Threads inside a process share memory and each own a
// disjoint row range, writing only into their own result slot. Processes that
// share a node may additionally route their reductions through a memory-mapped
// communicating group so that only one member per group touches the network.

pub mod comm;
pub mod context;
pub mod group;
pub mod topology;

pub use comm::{CommError, Communicator, LocalWorld, ReduceOp, SelfComm};
pub use context::{ParallelContext, ThreadUnit};
pub use group::GroupExchange;
pub use topology::{Topology, TopologyError, partition};

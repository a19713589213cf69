// ========================================================================================
//
//                        PROCESS-LEVEL COLLECTIVE COMMUNICATION
//
// ========================================================================================
//
// Every process executes the same control flow (SPMD), so every collective is
// entered by every participant in the same order. A participant that never
// arrives stalls the others; that is accepted as fatal rather than recovered.

use crossbeam_channel::{Receiver, Sender, unbounded};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommError {
    #[error("Rank {rank} lost its connection to the collective; a participant has terminated.")]
    Disconnected { rank: usize },
    #[error("Collective protocol violation on rank {rank}: expected {expected}, received {received}.")]
    Protocol {
        rank: usize,
        expected: &'static str,
        received: &'static str,
    },
    #[error("Rank {rank} contributed {found} values to a collective expecting {expected}.")]
    LengthMismatch {
        rank: usize,
        expected: usize,
        found: usize,
    },
}

/// Element-wise combination applied by `all_reduce`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
}

impl ReduceOp {
    /// Folds `other` into `acc` element by element.
    pub fn combine(self, acc: &mut [f64], other: &[f64]) {
        match self {
            Self::Sum => acc.iter_mut().zip(other).for_each(|(a, b)| *a += b),
            Self::Max => acc.iter_mut().zip(other).for_each(|(a, b)| *a = a.max(*b)),
            Self::Min => acc.iter_mut().zip(other).for_each(|(a, b)| *a = a.min(*b)),
        }
    }
}

/// A group of processes that can take part in collective operations.
///
/// Results of `all_reduce` are defined only after every member has called it,
/// and are replicated on every member. Contributions are combined in ascending
/// rank order, so a fixed process count yields bit-identical results.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    fn all_reduce(&self, buf: &mut [f64], op: ReduceOp) -> Result<(), CommError>;

    fn barrier(&self) -> Result<(), CommError> {
        self.all_reduce(&mut [], ReduceOp::Sum)
    }

    /// Partitions the members by `color` into independent communicators.
    /// Ranks in the new communicator follow the order of the parent ranks.
    fn split(&self, color: usize) -> Result<Box<dyn Communicator>, CommError>;

    fn is_root(&self) -> bool {
        self.rank() == 0
    }
}

/// The communicator of a run with exactly one process.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfComm;

impl Communicator for SelfComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_reduce(&self, buf: &mut [f64], op: ReduceOp) -> Result<(), CommError> {
        let _ = (buf, op);
        Ok(())
    }

    fn split(&self, color: usize) -> Result<Box<dyn Communicator>, CommError> {
        let _ = color;
        Ok(Box::new(SelfComm))
    }
}

enum Message {
    Reduce(Vec<f64>, ReduceOp),
    Split(usize),
    Comm(Box<LocalComm>),
    /// The root gave up on the current collective.
    Abort,
}

impl Message {
    fn kind(&self) -> &'static str {
        match self {
            Self::Reduce(..) => "reduce",
            Self::Split(..) => "split",
            Self::Comm(..) => "communicator",
            Self::Abort => "abort",
        }
    }
}

/// Every peer has its own channel in each direction, so the loss of any one
/// rank is seen as a disconnect on exactly the channel it owned.
enum Link {
    Root {
        from_peers: Vec<Receiver<Message>>,
        to_peers: Vec<Sender<Message>>,
    },
    Peer {
        to_root: Sender<Message>,
        from_root: Receiver<Message>,
    },
}

/// One rank of a `LocalWorld`: message passing over channels between ranks
/// that live in the same OS process. Collectives are implemented as a gather
/// to rank 0, a combine in rank order, and a broadcast of the result.
pub struct LocalComm {
    rank: usize,
    size: usize,
    link: Link,
}

/// Factory for in-process message-passing worlds.
pub struct LocalWorld;

impl LocalWorld {
    /// Creates `size` connected ranks, returned in rank order. Each one is
    /// meant to be moved onto its own OS thread.
    pub fn create(size: usize) -> Vec<LocalComm> {
        if size == 0 {
            return Vec::new();
        }
        let mut from_peers = Vec::with_capacity(size - 1);
        let mut to_peers = Vec::with_capacity(size - 1);
        let mut peers = Vec::with_capacity(size - 1);
        for rank in 1..size {
            let (up_tx, up_rx) = unbounded();
            let (down_tx, down_rx) = unbounded();
            from_peers.push(up_rx);
            to_peers.push(down_tx);
            peers.push(LocalComm {
                rank,
                size,
                link: Link::Peer {
                    to_root: up_tx,
                    from_root: down_rx,
                },
            });
        }
        let mut world = Vec::with_capacity(size);
        world.push(LocalComm {
            rank: 0,
            size,
            link: Link::Root {
                from_peers,
                to_peers,
            },
        });
        world.extend(peers);
        world
    }
}

impl LocalComm {
    fn disconnected(&self) -> CommError {
        CommError::Disconnected { rank: self.rank }
    }

    /// Receives one message from every peer, in rank order. A peer that has
    /// gone away fails the gather with its own rank, and every live peer is
    /// told to abandon the collective.
    fn gather_at_root(
        &self,
        from_peers: &[Receiver<Message>],
        to_peers: &[Sender<Message>],
    ) -> Result<Vec<Message>, CommError> {
        let mut messages = Vec::with_capacity(from_peers.len());
        for (index, rx) in from_peers.iter().enumerate() {
            match rx.recv() {
                Ok(msg) => messages.push(msg),
                Err(_) => {
                    abort_peers(to_peers);
                    return Err(CommError::Disconnected { rank: index + 1 });
                }
            }
        }
        Ok(messages)
    }

    /// Waits for the root's reply, turning an abort into a disconnect.
    fn receive_from_root(&self, from_root: &Receiver<Message>) -> Result<Message, CommError> {
        match from_root.recv() {
            Ok(Message::Abort) | Err(_) => Err(self.disconnected()),
            Ok(msg) => Ok(msg),
        }
    }
}

/// Best effort: peers that are already gone need no notice.
fn abort_peers(to_peers: &[Sender<Message>]) {
    for tx in to_peers {
        let _ = tx.send(Message::Abort);
    }
}

/// Fails the collective on the root after telling every peer to give up.
fn root_failure(to_peers: &[Sender<Message>], err: CommError) -> CommError {
    abort_peers(to_peers);
    err
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn all_reduce(&self, buf: &mut [f64], op: ReduceOp) -> Result<(), CommError> {
        match &self.link {
            Link::Root {
                from_peers,
                to_peers,
            } => {
                let contributions = self.gather_at_root(from_peers, to_peers)?;
                for (index, msg) in contributions.into_iter().enumerate() {
                    let peer = index + 1;
                    match msg {
                        Message::Reduce(values, peer_op) if peer_op == op => {
                            if values.len() != buf.len() {
                                return Err(root_failure(
                                    to_peers,
                                    CommError::LengthMismatch {
                                        rank: peer,
                                        expected: buf.len(),
                                        found: values.len(),
                                    },
                                ));
                            }
                            op.combine(buf, &values);
                        }
                        other => {
                            return Err(root_failure(
                                to_peers,
                                CommError::Protocol {
                                    rank: peer,
                                    expected: "reduce",
                                    received: other.kind(),
                                },
                            ));
                        }
                    }
                }
                for (index, tx) in to_peers.iter().enumerate() {
                    if tx.send(Message::Reduce(buf.to_vec(), op)).is_err() {
                        return Err(root_failure(to_peers, CommError::Disconnected { rank: index + 1 }));
                    }
                }
                Ok(())
            }
            Link::Peer { to_root, from_root } => {
                to_root
                    .send(Message::Reduce(buf.to_vec(), op))
                    .map_err(|_| self.disconnected())?;
                match self.receive_from_root(from_root)? {
                    Message::Reduce(values, _) if values.len() == buf.len() => {
                        buf.copy_from_slice(&values);
                        Ok(())
                    }
                    Message::Reduce(values, _) => Err(CommError::LengthMismatch {
                        rank: 0,
                        expected: buf.len(),
                        found: values.len(),
                    }),
                    other => Err(CommError::Protocol {
                        rank: 0,
                        expected: "reduce",
                        received: other.kind(),
                    }),
                }
            }
        }
    }

    fn split(&self, color: usize) -> Result<Box<dyn Communicator>, CommError> {
        match &self.link {
            Link::Root {
                from_peers,
                to_peers,
            } => {
                let mut colors = vec![color];
                for (index, msg) in self.gather_at_root(from_peers, to_peers)?.into_iter().enumerate() {
                    match msg {
                        Message::Split(peer_color) => colors.push(peer_color),
                        other => {
                            return Err(root_failure(
                                to_peers,
                                CommError::Protocol {
                                    rank: index + 1,
                                    expected: "split",
                                    received: other.kind(),
                                },
                            ));
                        }
                    }
                }

                let mut members: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
                for (rank, c) in colors.into_iter().enumerate() {
                    members.entry(c).or_default().push(rank);
                }

                let mut own = None;
                for ranks in members.values() {
                    for (comm, &rank) in LocalWorld::create(ranks.len()).into_iter().zip(ranks) {
                        if rank == 0 {
                            own = Some(comm);
                        } else if to_peers[rank - 1].send(Message::Comm(Box::new(comm))).is_err() {
                            return Err(root_failure(to_peers, CommError::Disconnected { rank }));
                        }
                    }
                }
                own.map(|comm| Box::new(comm) as Box<dyn Communicator>)
                    .ok_or(CommError::Protocol {
                        rank: 0,
                        expected: "a communicator for the root",
                        received: "none",
                    })
            }
            Link::Peer { to_root, from_root } => {
                to_root
                    .send(Message::Split(color))
                    .map_err(|_| self.disconnected())?;
                match self.receive_from_root(from_root)? {
                    Message::Comm(comm) => Ok(comm as Box<dyn Communicator>),
                    other => Err(CommError::Protocol {
                        rank: 0,
                        expected: "communicator",
                        received: other.kind(),
                    }),
                }
            }
        }
    }
}

// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Collective operations
//!
//! A collective is a small state machine driven by the engine thread. It is
//! started once, then offered every packet that arrives for its
//! `(communicator, tag, sequence)` key. A packet the algorithm does not want
//! yet (a later dissemination round, say) stays in the engine's collective
//! inbox and is offered again after the next accepted packet.
//!
//! Values travel as bincode bytes. Algorithms that only move data around
//! (bcast, scatter, gather, allgather, alltoall) never look inside them;
//! the reducing algorithms are generic over the value type.

pub mod controller;
pub mod exchange;
pub mod operations;
pub mod tree;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{
    Rank, Tag, TAG_ALLGATHER, TAG_ALLREDUCE, TAG_ALLTOALL, TAG_BARRIER, TAG_BCAST, TAG_GATHER, TAG_REDUCE,
    TAG_SCAN, TAG_SCATTER,
};
use crate::error::MpiResult;

pub use self::controller::{select, Choice};
pub use self::operations::{Avg, FnOp, Max, Min, Prod, ReduceOp, Sum};

/// Step numbers shared by the tree algorithms
pub const STEP_UP: u32 = 0;
pub const STEP_DOWN: u32 = 1;

/// Per-rank byte chunks, keyed by communicator rank
pub type Chunks = BTreeMap<Rank, Vec<u8>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectiveKind {
    Bcast,
    Barrier,
    Reduce,
    Allreduce,
    Scatter,
    Gather,
    Allgather,
    Alltoall,
    Scan,
}

impl CollectiveKind {
    pub fn tag(&self) -> Tag {
        match self {
            CollectiveKind::Bcast => TAG_BCAST,
            CollectiveKind::Barrier => TAG_BARRIER,
            CollectiveKind::Reduce => TAG_REDUCE,
            CollectiveKind::Allreduce => TAG_ALLREDUCE,
            CollectiveKind::Scatter => TAG_SCATTER,
            CollectiveKind::Gather => TAG_GATHER,
            CollectiveKind::Allgather => TAG_ALLGATHER,
            CollectiveKind::Alltoall => TAG_ALLTOALL,
            CollectiveKind::Scan => TAG_SCAN,
        }
    }
}

impl fmt::Display for CollectiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CollectiveKind::Bcast => "bcast",
            CollectiveKind::Barrier => "barrier",
            CollectiveKind::Reduce => "reduce",
            CollectiveKind::Allreduce => "allreduce",
            CollectiveKind::Scatter => "scatter",
            CollectiveKind::Gather => "gather",
            CollectiveKind::Allgather => "allgather",
            CollectiveKind::Alltoall => "alltoall",
            CollectiveKind::Scan => "scan",
        };
        write!(f, "{}", name)
    }
}

/// Payload of every collective frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectivePacket {
    /// Per-communicator invocation counter
    pub seq: u64,
    pub step: u32,
    pub body: Vec<u8>,
}

/// A decoded packet as offered to an algorithm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectiveMessage {
    /// Communicator rank of the sender
    pub from: Rank,
    pub step: u32,
    pub body: Vec<u8>,
}

/// How an algorithm reaches the other members
pub trait CollectiveIo {
    /// Calling process's rank in the communicator
    fn rank(&self) -> Rank;

    fn size(&self) -> usize;

    fn send(&mut self, to: Rank, step: u32, body: Vec<u8>) -> MpiResult<()>;
}

pub trait CollectiveAlgorithm: Send {
    fn name(&self) -> &'static str;

    fn start(&mut self, io: &mut dyn CollectiveIo) -> MpiResult<()>;

    /// Whether a packet from `from` at `step` can be accepted now
    fn wants(&self, from: Rank, step: u32) -> bool;

    fn accept(&mut self, message: CollectiveMessage, io: &mut dyn CollectiveIo) -> MpiResult<()>;

    fn is_finished(&self) -> bool;

    /// Result bytes for the caller, empty where the caller gets nothing
    fn take_result(&mut self) -> MpiResult<Vec<u8>>;
}

#[cfg(test)]
pub(crate) mod harness {
    //! Drives a set of algorithms, one per rank, without an engine

    use std::collections::VecDeque;

    use super::*;

    pub struct Outbox {
        rank: Rank,
        size: usize,
        pub sent: Vec<(Rank, CollectiveMessage)>,
    }

    impl Outbox {
        pub fn for_rank(rank: Rank, size: usize) -> Self {
            Self {
                rank,
                size,
                sent: Vec::new(),
            }
        }
    }

    impl CollectiveIo for Outbox {
        fn rank(&self) -> Rank {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn send(&mut self, to: Rank, step: u32, body: Vec<u8>) -> MpiResult<()> {
            self.sent.push((
                to,
                CollectiveMessage {
                    from: self.rank,
                    step,
                    body,
                },
            ));
            Ok(())
        }
    }

    /// Run every algorithm to completion and return the results in rank order
    pub fn run(mut algorithms: Vec<Box<dyn CollectiveAlgorithm>>) -> Vec<Vec<u8>> {
        let size = algorithms.len();
        let mut inboxes: Vec<VecDeque<CollectiveMessage>> = vec![VecDeque::new(); size];
        let route = |outbox: Outbox, inboxes: &mut Vec<VecDeque<CollectiveMessage>>| {
            for (to, message) in outbox.sent {
                inboxes[to as usize].push_back(message);
            }
        };

        for (rank, algorithm) in algorithms.iter_mut().enumerate() {
            let mut io = Outbox::for_rank(rank as Rank, size);
            algorithm.start(&mut io).unwrap();
            route(io, &mut inboxes);
        }

        loop {
            let mut progressed = false;
            for rank in 0..size {
                let position = inboxes[rank]
                    .iter()
                    .position(|m| algorithms[rank].wants(m.from, m.step));
                if let Some(position) = position {
                    let message = inboxes[rank].remove(position).unwrap();
                    let mut io = Outbox::for_rank(rank as Rank, size);
                    algorithms[rank].accept(message, &mut io).unwrap();
                    route(io, &mut inboxes);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }

        assert!(algorithms.iter().all(|a| a.is_finished()), "collective stalled");
        assert!(inboxes.iter().all(|i| i.is_empty()), "undelivered packets left");
        algorithms.iter_mut().map(|a| a.take_result().unwrap()).collect()
    }
}

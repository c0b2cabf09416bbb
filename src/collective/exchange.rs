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

//! Exchange-based collectives that do not use a tree

use std::collections::BTreeSet;

use crate::collective::{Chunks, CollectiveAlgorithm, CollectiveIo, CollectiveMessage};
use crate::constants::Rank;
use crate::error::{Code, MpiError, MpiResult};
use crate::net::codec::{deserialize_payload, serialize_payload};

/// Rounds needed so every rank hears from every other: `ceil(log2 size)`
///
/// That is `floor(log2 size)` doubling rounds plus one gap round when the
/// size is not a power of two.
pub fn dissemination_rounds(size: usize) -> u32 {
    if size <= 1 {
        0
    } else {
        usize::BITS - (size - 1).leading_zeros()
    }
}

// ============================================================================
// Dissemination allgather
// ============================================================================

/// In round `r` every rank sends all it knows to `rank + 2^r` and receives
/// from `rank - 2^r`, both modulo the size.
pub struct DisseminationAllgather {
    rank: Rank,
    size: usize,
    round: u32,
    rounds: u32,
    known: Chunks,
}

impl DisseminationAllgather {
    pub fn new(rank: Rank, size: usize, own: Vec<u8>) -> Self {
        let mut known = Chunks::new();
        known.insert(rank, own);
        Self {
            rank,
            size,
            round: 0,
            rounds: dissemination_rounds(size),
            known,
        }
    }

    fn offset(&self, round: u32) -> usize {
        (1usize << round) % self.size
    }

    fn partner_to(&self, round: u32) -> Rank {
        ((self.rank as usize + self.offset(round)) % self.size) as Rank
    }

    fn partner_from(&self, round: u32) -> Rank {
        ((self.rank as usize + self.size - self.offset(round)) % self.size) as Rank
    }

    fn send_round(&self, io: &mut dyn CollectiveIo) -> MpiResult<()> {
        if self.round < self.rounds {
            io.send(self.partner_to(self.round), self.round, serialize_payload(&self.known)?)?;
        }
        Ok(())
    }
}

impl CollectiveAlgorithm for DisseminationAllgather {
    fn name(&self) -> &'static str {
        "dissemination-allgather"
    }

    fn start(&mut self, io: &mut dyn CollectiveIo) -> MpiResult<()> {
        self.send_round(io)
    }

    fn wants(&self, from: Rank, step: u32) -> bool {
        !self.is_finished() && step == self.round && from == self.partner_from(step)
    }

    fn accept(&mut self, message: CollectiveMessage, io: &mut dyn CollectiveIo) -> MpiResult<()> {
        let theirs: Chunks = deserialize_payload(&message.body)?;
        for (rank, chunk) in theirs {
            self.known.entry(rank).or_insert(chunk);
        }
        self.round += 1;
        self.send_round(io)
    }

    fn is_finished(&self) -> bool {
        self.round >= self.rounds
    }

    fn take_result(&mut self) -> MpiResult<Vec<u8>> {
        if self.known.len() != self.size {
            return Err(MpiError::new(
                Code::CollectiveAborted,
                format!("allgather ended with {} of {} chunks", self.known.len(), self.size),
            ));
        }
        serialize_payload(&std::mem::take(&mut self.known))
    }
}

// ============================================================================
// Naive exchanges
// ============================================================================

/// Everyone sends its chunk to everyone else
pub struct NaiveAllgather {
    rank: Rank,
    size: usize,
    own: Vec<u8>,
    missing: BTreeSet<Rank>,
    known: Chunks,
}

impl NaiveAllgather {
    pub fn new(rank: Rank, size: usize, own: Vec<u8>) -> Self {
        let missing = (0..size as Rank).filter(|&r| r != rank).collect();
        Self {
            rank,
            size,
            own,
            missing,
            known: Chunks::new(),
        }
    }
}

impl CollectiveAlgorithm for NaiveAllgather {
    fn name(&self) -> &'static str {
        "naive-allgather"
    }

    fn start(&mut self, io: &mut dyn CollectiveIo) -> MpiResult<()> {
        for to in 0..self.size as Rank {
            if to != self.rank {
                io.send(to, 0, self.own.clone())?;
            }
        }
        self.known.insert(self.rank, std::mem::take(&mut self.own));
        Ok(())
    }

    fn wants(&self, from: Rank, step: u32) -> bool {
        step == 0 && self.missing.contains(&from)
    }

    fn accept(&mut self, message: CollectiveMessage, _io: &mut dyn CollectiveIo) -> MpiResult<()> {
        self.missing.remove(&message.from);
        self.known.insert(message.from, message.body);
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.missing.is_empty()
    }

    fn take_result(&mut self) -> MpiResult<Vec<u8>> {
        serialize_payload(&std::mem::take(&mut self.known))
    }
}

/// Pairwise exchange: chunk `j` of rank `i` ends up as chunk `i` of rank `j`
pub struct NaiveAlltoall {
    rank: Rank,
    outgoing: Chunks,
    missing: BTreeSet<Rank>,
    received: Chunks,
}

impl NaiveAlltoall {
    pub fn new(rank: Rank, size: usize, outgoing: Chunks) -> MpiResult<Self> {
        if outgoing.len() != size || !(0..size as Rank).all(|r| outgoing.contains_key(&r)) {
            return Err(MpiError::new(
                Code::Invalid,
                format!("alltoall needs exactly one chunk for each of {} ranks", size),
            ));
        }
        let missing = (0..size as Rank).filter(|&r| r != rank).collect();
        Ok(Self {
            rank,
            outgoing,
            missing,
            received: Chunks::new(),
        })
    }
}

impl CollectiveAlgorithm for NaiveAlltoall {
    fn name(&self) -> &'static str {
        "naive-alltoall"
    }

    fn start(&mut self, io: &mut dyn CollectiveIo) -> MpiResult<()> {
        for (to, chunk) in std::mem::take(&mut self.outgoing) {
            if to == self.rank {
                self.received.insert(to, chunk);
            } else {
                io.send(to, 0, chunk)?;
            }
        }
        Ok(())
    }

    fn wants(&self, from: Rank, step: u32) -> bool {
        step == 0 && self.missing.contains(&from)
    }

    fn accept(&mut self, message: CollectiveMessage, _io: &mut dyn CollectiveIo) -> MpiResult<()> {
        self.missing.remove(&message.from);
        self.received.insert(message.from, message.body);
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.missing.is_empty()
    }

    fn take_result(&mut self) -> MpiResult<Vec<u8>> {
        serialize_payload(&std::mem::take(&mut self.received))
    }
}

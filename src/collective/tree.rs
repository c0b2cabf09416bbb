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

//! Tree-based collectives
//!
//! Each algorithm runs over a [`Tree`] shared by every member. Packets going
//! towards the root use [`STEP_UP`], packets going away from it
//! [`STEP_DOWN`]. A rank only ever hears from its parent or its children.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::collective::operations::ReduceOp;
use crate::collective::{Chunks, CollectiveAlgorithm, CollectiveIo, CollectiveMessage, STEP_DOWN, STEP_UP};
use crate::constants::Rank;
use crate::error::{Code, MpiError, MpiResult};
use crate::net::codec::{deserialize_payload, serialize_payload};
use crate::topology::Tree;

fn children_of(tree: &Tree, rank: Rank) -> BTreeSet<Rank> {
    tree.children(rank).iter().copied().collect()
}

fn send_down(tree: &Tree, rank: Rank, body: &[u8], io: &mut dyn CollectiveIo) -> MpiResult<()> {
    for &child in tree.children(rank) {
        io.send(child, STEP_DOWN, body.to_vec())?;
    }
    Ok(())
}

fn from_parent(tree: &Tree, rank: Rank, from: Rank) -> bool {
    tree.parent(rank) == Some(from)
}

// ============================================================================
// Broadcast
// ============================================================================

pub struct TreeBcast {
    tree: Arc<Tree>,
    rank: Rank,
    data: Option<Vec<u8>>,
    finished: bool,
}

impl TreeBcast {
    /// `data` must be present at the root
    pub fn new(tree: Arc<Tree>, rank: Rank, data: Option<Vec<u8>>) -> MpiResult<Self> {
        if rank == tree.root() && data.is_none() {
            return Err(MpiError::new(Code::Invalid, "bcast root has no data"));
        }
        Ok(Self {
            tree,
            rank,
            data,
            finished: false,
        })
    }
}

impl CollectiveAlgorithm for TreeBcast {
    fn name(&self) -> &'static str {
        "tree-bcast"
    }

    fn start(&mut self, io: &mut dyn CollectiveIo) -> MpiResult<()> {
        if self.rank == self.tree.root() {
            if let Some(data) = &self.data {
                send_down(&self.tree, self.rank, data, io)?;
            }
            self.finished = true;
        }
        Ok(())
    }

    fn wants(&self, from: Rank, step: u32) -> bool {
        !self.finished && step == STEP_DOWN && from_parent(&self.tree, self.rank, from)
    }

    fn accept(&mut self, message: CollectiveMessage, io: &mut dyn CollectiveIo) -> MpiResult<()> {
        send_down(&self.tree, self.rank, &message.body, io)?;
        self.data = Some(message.body);
        self.finished = true;
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn take_result(&mut self) -> MpiResult<Vec<u8>> {
        self.data
            .take()
            .ok_or_else(|| MpiError::new(Code::Invalid, "bcast result already taken"))
    }
}

// ============================================================================
// Barrier
// ============================================================================

/// Nobody passes until every rank has arrived: UP from all children before
/// reporting to the parent, released only by the DOWN wave.
pub struct TreeBarrier {
    tree: Arc<Tree>,
    rank: Rank,
    missing: BTreeSet<Rank>,
    arrived: bool,
    finished: bool,
}

impl TreeBarrier {
    pub fn new(tree: Arc<Tree>, rank: Rank) -> Self {
        let missing = children_of(&tree, rank);
        Self {
            tree,
            rank,
            missing,
            arrived: false,
            finished: false,
        }
    }

    fn try_arrive(&mut self, io: &mut dyn CollectiveIo) -> MpiResult<()> {
        if self.arrived || !self.missing.is_empty() {
            return Ok(());
        }
        self.arrived = true;
        match self.tree.parent(self.rank) {
            Some(parent) => io.send(parent, STEP_UP, Vec::new()),
            None => self.release(io),
        }
    }

    fn release(&mut self, io: &mut dyn CollectiveIo) -> MpiResult<()> {
        send_down(&self.tree, self.rank, &[], io)?;
        self.finished = true;
        Ok(())
    }
}

impl CollectiveAlgorithm for TreeBarrier {
    fn name(&self) -> &'static str {
        "tree-barrier"
    }

    fn start(&mut self, io: &mut dyn CollectiveIo) -> MpiResult<()> {
        self.try_arrive(io)
    }

    fn wants(&self, from: Rank, step: u32) -> bool {
        if self.finished {
            return false;
        }
        match step {
            STEP_UP => self.missing.contains(&from),
            STEP_DOWN => self.arrived && from_parent(&self.tree, self.rank, from),
            _ => false,
        }
    }

    fn accept(&mut self, message: CollectiveMessage, io: &mut dyn CollectiveIo) -> MpiResult<()> {
        if message.step == STEP_UP {
            self.missing.remove(&message.from);
            self.try_arrive(io)
        } else {
            self.release(io)
        }
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn take_result(&mut self) -> MpiResult<Vec<u8>> {
        Ok(Vec::new())
    }
}

// ============================================================================
// Gather
// ============================================================================

pub struct TreeGather {
    tree: Arc<Tree>,
    rank: Rank,
    missing: BTreeSet<Rank>,
    collected: Chunks,
    finished: bool,
}

impl TreeGather {
    pub fn new(tree: Arc<Tree>, rank: Rank, own: Vec<u8>) -> Self {
        let missing = children_of(&tree, rank);
        let mut collected = Chunks::new();
        collected.insert(rank, own);
        Self {
            tree,
            rank,
            missing,
            collected,
            finished: false,
        }
    }

    fn try_forward(&mut self, io: &mut dyn CollectiveIo) -> MpiResult<()> {
        if !self.missing.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.tree.parent(self.rank) {
            let subtree = std::mem::take(&mut self.collected);
            io.send(parent, STEP_UP, serialize_payload(&subtree)?)?;
        }
        self.finished = true;
        Ok(())
    }
}

impl CollectiveAlgorithm for TreeGather {
    fn name(&self) -> &'static str {
        "tree-gather"
    }

    fn start(&mut self, io: &mut dyn CollectiveIo) -> MpiResult<()> {
        self.try_forward(io)
    }

    fn wants(&self, from: Rank, step: u32) -> bool {
        step == STEP_UP && self.missing.contains(&from)
    }

    fn accept(&mut self, message: CollectiveMessage, io: &mut dyn CollectiveIo) -> MpiResult<()> {
        let subtree: Chunks = deserialize_payload(&message.body)?;
        self.collected.extend(subtree);
        self.missing.remove(&message.from);
        self.try_forward(io)
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    /// The full rank-keyed map at the root, nothing elsewhere
    fn take_result(&mut self) -> MpiResult<Vec<u8>> {
        if self.rank == self.tree.root() {
            serialize_payload(&std::mem::take(&mut self.collected))
        } else {
            Ok(Vec::new())
        }
    }
}

// ============================================================================
// Scatter
// ============================================================================

/// The root holds one chunk per rank and hands every child exactly the
/// chunks of its subtree.
pub struct TreeScatter {
    tree: Arc<Tree>,
    rank: Rank,
    held: Option<Chunks>,
    mine: Option<Vec<u8>>,
    finished: bool,
}

impl TreeScatter {
    pub fn new(tree: Arc<Tree>, rank: Rank, chunks: Option<Chunks>) -> MpiResult<Self> {
        if rank == tree.root() {
            let complete = chunks.as_ref().map_or(false, |c| {
                c.len() == tree.size() && (0..tree.size() as Rank).all(|r| c.contains_key(&r))
            });
            if !complete {
                return Err(MpiError::new(
                    Code::Invalid,
                    format!("scatter root needs exactly one chunk for each of {} ranks", tree.size()),
                ));
            }
        }
        Ok(Self {
            tree,
            rank,
            held: chunks,
            mine: None,
            finished: false,
        })
    }

    fn distribute(&mut self, mut held: Chunks, io: &mut dyn CollectiveIo) -> MpiResult<()> {
        self.mine = held.remove(&self.rank);
        for &child in self.tree.children(self.rank) {
            let mut subtree = Chunks::new();
            for r in std::iter::once(child).chain(self.tree.descendants(child).iter().copied()) {
                if let Some(chunk) = held.remove(&r) {
                    subtree.insert(r, chunk);
                }
            }
            io.send(child, STEP_DOWN, serialize_payload(&subtree)?)?;
        }
        self.finished = true;
        Ok(())
    }
}

impl CollectiveAlgorithm for TreeScatter {
    fn name(&self) -> &'static str {
        "tree-scatter"
    }

    fn start(&mut self, io: &mut dyn CollectiveIo) -> MpiResult<()> {
        if self.rank == self.tree.root() {
            if let Some(held) = self.held.take() {
                self.distribute(held, io)?;
            }
        }
        Ok(())
    }

    fn wants(&self, from: Rank, step: u32) -> bool {
        !self.finished && step == STEP_DOWN && from_parent(&self.tree, self.rank, from)
    }

    fn accept(&mut self, message: CollectiveMessage, io: &mut dyn CollectiveIo) -> MpiResult<()> {
        let held: Chunks = deserialize_payload(&message.body)?;
        self.distribute(held, io)
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn take_result(&mut self) -> MpiResult<Vec<u8>> {
        self.mine
            .take()
            .ok_or_else(|| MpiError::new(Code::Invalid, format!("no scatter chunk reached rank {}", self.rank)))
    }
}

// ============================================================================
// Reduce / Allreduce
// ============================================================================

/// Tree reduction, optionally followed by a DOWN pass of the result
///
/// Partially reducible operators fold at every interior node. Any other
/// operator has its values carried up keyed by rank and folded at the root
/// in rank order.
pub struct TreeReduce<T, O> {
    tree: Arc<Tree>,
    rank: Rank,
    op: O,
    everyone: bool,
    partial: bool,
    missing: BTreeSet<Rank>,
    folded: Vec<T>,
    keyed: BTreeMap<Rank, T>,
    result: Option<T>,
    sent_up: bool,
    finished: bool,
}

impl<T, O> TreeReduce<T, O>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    O: ReduceOp<T> + 'static,
{
    /// Result only at the root
    pub fn reduce(tree: Arc<Tree>, rank: Rank, value: T, op: O) -> Self {
        Self::build(tree, rank, value, op, false)
    }

    /// Result at every rank
    pub fn allreduce(tree: Arc<Tree>, rank: Rank, value: T, op: O) -> Self {
        Self::build(tree, rank, value, op, true)
    }

    fn build(tree: Arc<Tree>, rank: Rank, value: T, op: O, everyone: bool) -> Self {
        let missing = children_of(&tree, rank);
        let partial = op.partial_reducible();
        let mut folded = Vec::new();
        let mut keyed = BTreeMap::new();
        if partial {
            folded.push(value);
        } else {
            keyed.insert(rank, value);
        }
        Self {
            tree,
            rank,
            op,
            everyone,
            partial,
            missing,
            folded,
            keyed,
            result: None,
            sent_up: false,
            finished: false,
        }
    }

    fn try_up(&mut self, io: &mut dyn CollectiveIo) -> MpiResult<()> {
        if self.sent_up || !self.missing.is_empty() {
            return Ok(());
        }
        self.sent_up = true;

        let parent = self.tree.parent(self.rank);
        if self.partial {
            let subtotal = self.op.reduce(std::mem::take(&mut self.folded))?;
            match parent {
                Some(p) => io.send(p, STEP_UP, serialize_payload(&subtotal)?)?,
                None => self.result = Some(subtotal),
            }
        } else {
            let keyed = std::mem::take(&mut self.keyed);
            match parent {
                Some(p) => io.send(p, STEP_UP, serialize_payload(&keyed)?)?,
                None => self.result = Some(self.op.reduce(keyed.into_values().collect())?),
            }
        }

        if parent.is_none() && self.everyone {
            if let Some(result) = &self.result {
                send_down(&self.tree, self.rank, &serialize_payload(result)?, io)?;
            }
        }
        if parent.is_none() || !self.everyone {
            self.finished = true;
        }
        Ok(())
    }
}

impl<T, O> CollectiveAlgorithm for TreeReduce<T, O>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    O: ReduceOp<T> + 'static,
{
    fn name(&self) -> &'static str {
        if self.everyone {
            "tree-allreduce"
        } else {
            "tree-reduce"
        }
    }

    fn start(&mut self, io: &mut dyn CollectiveIo) -> MpiResult<()> {
        self.try_up(io)
    }

    fn wants(&self, from: Rank, step: u32) -> bool {
        if self.finished {
            return false;
        }
        match step {
            STEP_UP => self.missing.contains(&from),
            STEP_DOWN => self.everyone && self.sent_up && from_parent(&self.tree, self.rank, from),
            _ => false,
        }
    }

    fn accept(&mut self, message: CollectiveMessage, io: &mut dyn CollectiveIo) -> MpiResult<()> {
        if message.step == STEP_DOWN {
            send_down(&self.tree, self.rank, &message.body, io)?;
            self.result = Some(deserialize_payload(&message.body)?);
            self.finished = true;
            return Ok(());
        }

        if self.partial {
            self.folded.push(deserialize_payload(&message.body)?);
        } else {
            let subtree: BTreeMap<Rank, T> = deserialize_payload(&message.body)?;
            self.keyed.extend(subtree);
        }
        self.missing.remove(&message.from);
        self.try_up(io)
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn take_result(&mut self) -> MpiResult<Vec<u8>> {
        match self.result.take() {
            Some(result) => serialize_payload(&result),
            None => Ok(Vec::new()),
        }
    }
}

// ============================================================================
// Scan
// ============================================================================

/// Inclusive prefix reduction: values go up keyed by rank, the full set comes
/// back down and every rank folds the values of ranks up to its own.
pub struct TreeScan<T, O> {
    tree: Arc<Tree>,
    rank: Rank,
    op: O,
    missing: BTreeSet<Rank>,
    keyed: BTreeMap<Rank, T>,
    result: Option<T>,
    sent_up: bool,
    finished: bool,
}

impl<T, O> TreeScan<T, O>
where
    T: Serialize + DeserializeOwned + Clone + Send + 'static,
    O: ReduceOp<T> + 'static,
{
    pub fn new(tree: Arc<Tree>, rank: Rank, value: T, op: O) -> Self {
        let missing = children_of(&tree, rank);
        let mut keyed = BTreeMap::new();
        keyed.insert(rank, value);
        Self {
            tree,
            rank,
            op,
            missing,
            keyed,
            result: None,
            sent_up: false,
            finished: false,
        }
    }

    fn finish_with(&mut self, all: &BTreeMap<Rank, T>) -> MpiResult<()> {
        let prefix: Vec<T> = all.range(..=self.rank).map(|(_, v)| v.clone()).collect();
        self.result = Some(self.op.reduce(prefix)?);
        self.finished = true;
        Ok(())
    }

    fn try_up(&mut self, io: &mut dyn CollectiveIo) -> MpiResult<()> {
        if self.sent_up || !self.missing.is_empty() {
            return Ok(());
        }
        self.sent_up = true;
        match self.tree.parent(self.rank) {
            Some(parent) => {
                let subtree = std::mem::take(&mut self.keyed);
                io.send(parent, STEP_UP, serialize_payload(&subtree)?)
            }
            None => {
                let all = std::mem::take(&mut self.keyed);
                send_down(&self.tree, self.rank, &serialize_payload(&all)?, io)?;
                self.finish_with(&all)
            }
        }
    }
}

impl<T, O> CollectiveAlgorithm for TreeScan<T, O>
where
    T: Serialize + DeserializeOwned + Clone + Send + 'static,
    O: ReduceOp<T> + 'static,
{
    fn name(&self) -> &'static str {
        "tree-scan"
    }

    fn start(&mut self, io: &mut dyn CollectiveIo) -> MpiResult<()> {
        self.try_up(io)
    }

    fn wants(&self, from: Rank, step: u32) -> bool {
        if self.finished {
            return false;
        }
        match step {
            STEP_UP => self.missing.contains(&from),
            STEP_DOWN => self.sent_up && from_parent(&self.tree, self.rank, from),
            _ => false,
        }
    }

    fn accept(&mut self, message: CollectiveMessage, io: &mut dyn CollectiveIo) -> MpiResult<()> {
        let values: BTreeMap<Rank, T> = deserialize_payload(&message.body)?;
        if message.step == STEP_DOWN {
            send_down(&self.tree, self.rank, &message.body, io)?;
            return self.finish_with(&values);
        }
        self.keyed.extend(values);
        self.missing.remove(&message.from);
        self.try_up(io)
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn take_result(&mut self) -> MpiResult<Vec<u8>> {
        let result = self
            .result
            .take()
            .ok_or_else(|| MpiError::new(Code::Invalid, "scan result already taken"))?;
        serialize_payload(&result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::harness::{self, Outbox};
    use crate::collective::operations::{FnOp, Sum};
    use crate::topology::TreeShape;

    fn tree(shape: TreeShape, size: usize, root: Rank) -> Arc<Tree> {
        Arc::new(Tree::generate(shape, size, root).unwrap())
    }

    #[test]
    fn binomial_allreduce_of_rank_plus_one() {
        let t = tree(TreeShape::Binomial, 8, 0);
        let algorithms: Vec<Box<dyn CollectiveAlgorithm>> = (0..8)
            .map(|r| Box::new(TreeReduce::allreduce(t.clone(), r, (r + 1) as i64, Sum)) as Box<dyn CollectiveAlgorithm>)
            .collect();
        for bytes in harness::run(algorithms) {
            assert_eq!(deserialize_payload::<i64>(&bytes).unwrap(), 36);
        }
    }

    #[test]
    fn non_partial_reduce_folds_in_rank_order() {
        let t = tree(TreeShape::StaticFanout(2), 5, 2);
        let algorithms: Vec<Box<dyn CollectiveAlgorithm>> = (0..5)
            .map(|r| {
                let concat = FnOp::new(|v: Vec<String>| v.concat());
                Box::new(TreeReduce::reduce(t.clone(), r, r.to_string(), concat)) as Box<dyn CollectiveAlgorithm>
            })
            .collect();
        let results = harness::run(algorithms);
        assert_eq!(deserialize_payload::<String>(&results[2]).unwrap(), "01234");
        assert!(results[0].is_empty());
    }

    #[test]
    fn scatter_from_root_three() {
        let size = 6;
        let k = 4;
        let t = tree(TreeShape::Binomial, size, 3);
        let algorithms: Vec<Box<dyn CollectiveAlgorithm>> = (0..size as Rank)
            .map(|r| {
                let chunks = (r == 3).then(|| {
                    (0..size as Rank)
                        .map(|dest| {
                            let chunk: Vec<i64> = (0..k).map(|i| dest as i64 * k + i).collect();
                            (dest, serialize_payload(&chunk).unwrap())
                        })
                        .collect::<Chunks>()
                });
                Box::new(TreeScatter::new(t.clone(), r, chunks).unwrap()) as Box<dyn CollectiveAlgorithm>
            })
            .collect();
        for (r, bytes) in harness::run(algorithms).into_iter().enumerate() {
            let chunk: Vec<i64> = deserialize_payload(&bytes).unwrap();
            assert_eq!(chunk, (0..k).map(|i| r as i64 * k + i).collect::<Vec<_>>());
        }
    }

    #[test]
    fn barrier_waits_for_the_last_arrival() {
        let size = 7;
        let t = tree(TreeShape::Binomial, size, 0);
        let mut barriers: Vec<TreeBarrier> = (0..size as Rank).map(|r| TreeBarrier::new(t.clone(), r)).collect();
        let mut pending: Vec<(Rank, CollectiveMessage)> = Vec::new();

        // Everyone but rank 6 arrives and all traffic settles
        for r in 0..(size as Rank - 1) {
            let mut io = Outbox::for_rank(r, size);
            barriers[r as usize].start(&mut io).unwrap();
            pending.extend(io.sent);
        }
        loop {
            let position = pending
                .iter()
                .position(|(to, m)| barriers[*to as usize].wants(m.from, m.step));
            let Some(position) = position else { break };
            let (to, message) = pending.remove(position);
            let mut io = Outbox::for_rank(to, size);
            barriers[to as usize].accept(message, &mut io).unwrap();
            pending.extend(io.sent);
        }
        assert!(barriers.iter().all(|b| !b.is_finished()));
    }

    #[test]
    fn scan_prefix_sums() {
        let t = tree(TreeShape::Flat, 5, 0);
        let algorithms: Vec<Box<dyn CollectiveAlgorithm>> = (0..5)
            .map(|r| Box::new(TreeScan::new(t.clone(), r, 1u32, Sum)) as Box<dyn CollectiveAlgorithm>)
            .collect();
        for (r, bytes) in harness::run(algorithms).into_iter().enumerate() {
            assert_eq!(deserialize_payload::<u32>(&bytes).unwrap(), r as u32 + 1);
        }
    }
}

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

//! Communicators
//!
//! A communicator is a group plus a context id. All addressing goes through
//! it: ranks are communicator ranks, and frames carry the id so traffic of
//! different communicators never matches. Communicators own no sockets; they
//! hand jobs to the process's engine.
//!
//! Ids come from a halving id space: deriving a communicator gives the child
//! the upper half of the parent's remaining range. Every member performs the
//! same derivations in the same order, so ids agree without any messages.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::collective::exchange::{DisseminationAllgather, NaiveAllgather, NaiveAlltoall};
use crate::collective::tree::{TreeBarrier, TreeBcast, TreeGather, TreeReduce, TreeScan, TreeScatter};
use crate::collective::{select, Choice, Chunks, CollectiveAlgorithm, CollectiveKind, ReduceOp};
use crate::constants::{
    is_user_tag, CommId, Comparison, Rank, Tag, ANY_SOURCE, ANY_TAG, COMM_ID_CEILING, TAG_BARRIER, UNDEFINED,
    WORLD_COMM_ID,
};
use crate::engine::{CollectiveJob, CollectiveKey, Engine, Job, RecvJob, SendJob, SyncPayload};
use crate::error::{Code, MpiError, MpiResult};
use crate::group::Group;
use crate::net::codec::{deserialize_payload, serialize_payload, Frame, MessageKind};
use crate::net::PeerAddr;
use crate::request::{Request, Status};
use crate::topology::{Tree, TreeShape};

struct CommInner {
    id: CommId,
    /// Exclusive upper bound of the ids this communicator may still hand out
    id_ceiling: Mutex<CommId>,
    group: Group,
    my_rank: Rank,
    name: Mutex<String>,
    engine: Engine,
    trees: RwLock<HashMap<(TreeShape, Rank), Arc<Tree>>>,
    collective_seq: AtomicU64,
    freed: AtomicBool,
}

#[derive(Clone)]
pub struct Communicator {
    inner: Arc<CommInner>,
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("id", &self.inner.id)
            .field("name", &self.name())
            .field("rank", &self.inner.my_rank)
            .field("size", &self.size())
            .finish()
    }
}

impl Communicator {
    /// The world communicator over the full roster
    pub fn world(engine: &Engine, roster: Vec<PeerAddr>) -> MpiResult<Communicator> {
        let group = Group::new(roster, engine.my_rank());
        Self::build(engine.clone(), WORLD_COMM_ID, COMM_ID_CEILING, group, "MPI_COMM_WORLD".to_string())
    }

    fn build(engine: Engine, id: CommId, ceiling: CommId, group: Group, name: String) -> MpiResult<Communicator> {
        let my_rank = group.rank().ok_or_else(|| {
            MpiError::new(
                Code::InvalidRank,
                format!("world rank {} is not a member of communicator {}", engine.my_rank(), id),
            )
        })?;
        Ok(Communicator {
            inner: Arc::new(CommInner {
                id,
                id_ceiling: Mutex::new(ceiling),
                group,
                my_rank,
                name: Mutex::new(name),
                engine,
                trees: RwLock::new(HashMap::new()),
                collective_seq: AtomicU64::new(0),
                freed: AtomicBool::new(false),
            }),
        })
    }

    pub fn id(&self) -> CommId {
        self.inner.id
    }

    pub fn rank(&self) -> Rank {
        self.inner.my_rank
    }

    pub fn size(&self) -> usize {
        self.inner.group.size()
    }

    pub fn group(&self) -> &Group {
        &self.inner.group
    }

    pub fn name(&self) -> String {
        self.inner.name.lock().unwrap().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.inner.name.lock().unwrap() = name.to_string();
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    pub fn is_freed(&self) -> bool {
        self.inner.freed.load(Ordering::Acquire)
    }

    /// Entry check of every operation, also runs pending control commands
    fn ready(&self) -> MpiResult<()> {
        if self.is_freed() {
            return Err(MpiError::new(
                Code::Invalid,
                format!("communicator {} has been freed", self.name()),
            ));
        }
        self.inner.engine.execute_system_commands();
        Ok(())
    }

    fn check_rank(&self, rank: Rank) -> MpiResult<()> {
        if rank < 0 || rank as usize >= self.size() {
            return Err(MpiError::new(
                Code::InvalidRank,
                format!("rank {} outside communicator of size {}", rank, self.size()),
            ));
        }
        Ok(())
    }

    fn check_send_tag(tag: Tag) -> MpiResult<()> {
        if !is_user_tag(tag) {
            return Err(MpiError::new(Code::InvalidTag, format!("tag {} is not a user tag", tag)));
        }
        Ok(())
    }

    // ========================================================================
    // Point-to-point
    // ========================================================================

    fn post_send(&self, payload: Vec<u8>, dest: Rank, tag: Tag, sync_id: Option<u64>) -> MpiResult<Request<()>> {
        self.ready()?;
        self.check_rank(dest)?;
        Self::check_send_tag(tag)?;

        let (kind, payload) = match sync_id {
            Some(id) => (MessageKind::SyncUser, serialize_payload(&SyncPayload { id, data: payload })?),
            None => (MessageKind::User, payload),
        };
        let core = self.inner.engine.new_request();
        self.inner.engine.submit(Job::Send(SendJob {
            dest: self.inner.group.global_rank(dest)?,
            dest_rank: dest,
            frame: Frame::new(self.rank(), tag, self.id(), kind, payload),
            core: core.clone(),
            sync_id,
        }))?;
        Ok(Request::from_core(core))
    }

    /// Start a send; the request completes once the message is written
    pub fn isend<T: Serialize + ?Sized>(&self, data: &T, dest: Rank, tag: Tag) -> MpiResult<Request<()>> {
        self.post_send(serialize_payload(data)?, dest, tag, None)
    }

    pub fn send<T: Serialize + ?Sized>(&self, data: &T, dest: Rank, tag: Tag) -> MpiResult<()> {
        self.isend(data, dest, tag)?.wait()
    }

    /// Start a synchronous send; the request completes once the receiver
    /// has matched the message
    pub fn issend<T: Serialize + ?Sized>(&self, data: &T, dest: Rank, tag: Tag) -> MpiResult<Request<()>> {
        let id = self.inner.engine.next_sync_id();
        self.post_send(serialize_payload(data)?, dest, tag, Some(id))
    }

    pub fn ssend<T: Serialize + ?Sized>(&self, data: &T, dest: Rank, tag: Tag) -> MpiResult<()> {
        self.issend(data, dest, tag)?.wait()
    }

    /// Post a receive from `source` (or `ANY_SOURCE`) with `tag` (or `ANY_TAG`)
    pub fn irecv<T: DeserializeOwned>(&self, source: Rank, tag: Tag) -> MpiResult<Request<T>> {
        self.ready()?;
        if source != ANY_SOURCE {
            self.check_rank(source)?;
        }
        if tag != ANY_TAG {
            Self::check_send_tag(tag)?;
        }

        let source_global = if source == ANY_SOURCE {
            None
        } else {
            Some(self.inner.group.global_rank(source)?)
        };
        let core = self.inner.engine.new_request();
        self.inner.engine.submit(Job::Recv(RecvJob {
            comm_id: self.id(),
            source,
            source_global,
            tag,
            my_rank: self.rank(),
            core: core.clone(),
        }))?;
        Ok(Request::from_core(core))
    }

    pub fn recv<T: DeserializeOwned>(&self, source: Rank, tag: Tag) -> MpiResult<T> {
        self.irecv(source, tag)?.wait()
    }

    pub fn recv_with_status<T: DeserializeOwned>(&self, source: Rank, tag: Tag) -> MpiResult<(T, Status)> {
        self.irecv(source, tag)?.wait_with_status()
    }

    /// Send to `dest` and receive from `source` without ordering deadlocks
    pub fn sendrecv<S, R>(&self, data: &S, dest: Rank, send_tag: Tag, source: Rank, recv_tag: Tag) -> MpiResult<R>
    where
        S: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let incoming = self.irecv(source, recv_tag)?;
        self.isend(data, dest, send_tag)?.wait()?;
        incoming.wait()
    }

    // ========================================================================
    // Collectives
    // ========================================================================

    fn tree(&self, shape: TreeShape, root: Rank) -> MpiResult<Arc<Tree>> {
        if let Some(tree) = self.inner.trees.read().unwrap().get(&(shape, root)) {
            return Ok(tree.clone());
        }
        let tree = Arc::new(Tree::generate(shape, self.size(), root)?);
        let mut trees = self.inner.trees.write().unwrap();
        Ok(trees.entry((shape, root)).or_insert(tree).clone())
    }

    fn tree_for(&self, kind: CollectiveKind, root: Rank) -> MpiResult<Arc<Tree>> {
        let settings = self.inner.engine.collective_settings();
        match select(kind, &settings, self.size())? {
            (_, Choice::Tree(shape)) => self.tree(shape, root),
            (name, _) => Err(MpiError::new(
                Code::Invalid,
                format!("{} selected non-tree algorithm {}", kind, name),
            )),
        }
    }

    /// Run one collective to completion and return its raw result
    fn run_collective(&self, tag: Tag, algorithm: Box<dyn CollectiveAlgorithm>) -> MpiResult<Vec<u8>> {
        let key = CollectiveKey {
            comm_id: self.id(),
            tag,
            seq: self.inner.collective_seq.fetch_add(1, Ordering::AcqRel),
        };
        log::debug!("{} on communicator {} as {:?}", algorithm.name(), self.id(), key);

        let core = self.inner.engine.new_request();
        self.inner.engine.submit(Job::Collective(CollectiveJob {
            key,
            my_rank: self.rank(),
            members: self.inner.group.global_ranks(),
            algorithm,
            core: core.clone(),
        }))?;
        Ok(core.wait_raw()?.0)
    }

    /// Barrier on an internal tag, used around startup and shutdown
    pub(crate) fn barrier_on(&self, tag: Tag) -> MpiResult<()> {
        let tree = self.tree_for(CollectiveKind::Barrier, 0)?;
        self.run_collective(tag, Box::new(TreeBarrier::new(tree, self.rank())))?;
        Ok(())
    }

    /// Block until every member has entered the barrier
    pub fn barrier(&self) -> MpiResult<()> {
        self.ready()?;
        self.barrier_on(TAG_BARRIER)
    }

    /// Broadcast from `root`; `data` is only read at the root
    pub fn bcast<T>(&self, data: Option<&T>, root: Rank) -> MpiResult<T>
    where
        T: Serialize + DeserializeOwned,
    {
        self.ready()?;
        self.check_rank(root)?;
        let bytes = if self.rank() == root {
            let data = data.ok_or_else(|| MpiError::new(Code::Invalid, "bcast root must supply data"))?;
            Some(serialize_payload(data)?)
        } else {
            None
        };
        let tree = self.tree_for(CollectiveKind::Bcast, root)?;
        let algorithm = TreeBcast::new(tree, self.rank(), bytes)?;
        let result = self.run_collective(CollectiveKind::Bcast.tag(), Box::new(algorithm))?;
        deserialize_payload(&result)
    }

    /// Reduce to `root`, which gets `Some(result)`; everyone else gets `None`
    pub fn reduce<T, O>(&self, value: T, op: O, root: Rank) -> MpiResult<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        O: ReduceOp<T> + 'static,
    {
        self.ready()?;
        self.check_rank(root)?;
        let tree = self.tree_for(CollectiveKind::Reduce, root)?;
        let algorithm = TreeReduce::reduce(tree, self.rank(), value, op);
        let result = self.run_collective(CollectiveKind::Reduce.tag(), Box::new(algorithm))?;
        if self.rank() == root {
            Ok(Some(deserialize_payload(&result)?))
        } else {
            Ok(None)
        }
    }

    pub fn allreduce<T, O>(&self, value: T, op: O) -> MpiResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        O: ReduceOp<T> + 'static,
    {
        self.ready()?;
        let tree = self.tree_for(CollectiveKind::Allreduce, 0)?;
        let algorithm = TreeReduce::allreduce(tree, self.rank(), value, op);
        let result = self.run_collective(CollectiveKind::Allreduce.tag(), Box::new(algorithm))?;
        deserialize_payload(&result)
    }

    /// Inclusive prefix reduction over ranks `0..=rank`
    pub fn scan<T, O>(&self, value: T, op: O) -> MpiResult<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
        O: ReduceOp<T> + 'static,
    {
        self.ready()?;
        let tree = self.tree_for(CollectiveKind::Scan, 0)?;
        let algorithm = TreeScan::new(tree, self.rank(), value, op);
        let result = self.run_collective(CollectiveKind::Scan.tag(), Box::new(algorithm))?;
        deserialize_payload(&result)
    }

    /// Split `data` at the root into `size` equal consecutive chunks and
    /// give chunk `i` to rank `i`
    pub fn scatter<T>(&self, data: Option<&[T]>, root: Rank) -> MpiResult<Vec<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        self.ready()?;
        self.check_rank(root)?;
        let size = self.size();
        let chunks = if self.rank() == root {
            let data = data.ok_or_else(|| MpiError::new(Code::Invalid, "scatter root must supply data"))?;
            if data.len() % size != 0 {
                return Err(MpiError::new(
                    Code::Invalid,
                    format!("cannot split {} items evenly over {} ranks", data.len(), size),
                ));
            }
            let per_rank = data.len() / size;
            let mut chunks = Chunks::new();
            for r in 0..size {
                chunks.insert(r as Rank, serialize_payload(&data[r * per_rank..(r + 1) * per_rank])?);
            }
            Some(chunks)
        } else {
            None
        };
        let tree = self.tree_for(CollectiveKind::Scatter, root)?;
        let algorithm = TreeScatter::new(tree, self.rank(), chunks)?;
        let result = self.run_collective(CollectiveKind::Scatter.tag(), Box::new(algorithm))?;
        deserialize_payload(&result)
    }

    /// Collect one value per rank at `root`, in rank order
    pub fn gather<T>(&self, value: &T, root: Rank) -> MpiResult<Option<Vec<T>>>
    where
        T: Serialize + DeserializeOwned,
    {
        self.ready()?;
        self.check_rank(root)?;
        let tree = self.tree_for(CollectiveKind::Gather, root)?;
        let algorithm = TreeGather::new(tree, self.rank(), serialize_payload(value)?);
        let result = self.run_collective(CollectiveKind::Gather.tag(), Box::new(algorithm))?;
        if self.rank() != root {
            return Ok(None);
        }
        let chunks: Chunks = deserialize_payload(&result)?;
        self.decode_all(chunks).map(Some)
    }

    /// Every rank gets every rank's value, in rank order
    pub fn allgather<T>(&self, value: &T) -> MpiResult<Vec<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        self.ready()?;
        let own = serialize_payload(value)?;
        let settings = self.inner.engine.collective_settings();
        let algorithm: Box<dyn CollectiveAlgorithm> = match select(CollectiveKind::Allgather, &settings, self.size())? {
            (_, Choice::Dissemination) => Box::new(DisseminationAllgather::new(self.rank(), self.size(), own)),
            _ => Box::new(NaiveAllgather::new(self.rank(), self.size(), own)),
        };
        let result = self.run_collective(CollectiveKind::Allgather.tag(), algorithm)?;
        self.decode_all(deserialize_payload(&result)?)
    }

    /// `data[j]` goes to rank `j`; the result holds one value from each rank
    pub fn alltoall<T>(&self, data: &[T]) -> MpiResult<Vec<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        self.ready()?;
        if data.len() != self.size() {
            return Err(MpiError::new(
                Code::Invalid,
                format!("alltoall needs {} items, got {}", self.size(), data.len()),
            ));
        }
        let mut outgoing = Chunks::new();
        for (j, item) in data.iter().enumerate() {
            outgoing.insert(j as Rank, serialize_payload(item)?);
        }
        let algorithm = NaiveAlltoall::new(self.rank(), self.size(), outgoing)?;
        let result = self.run_collective(CollectiveKind::Alltoall.tag(), Box::new(algorithm))?;
        self.decode_all(deserialize_payload(&result)?)
    }

    fn decode_all<T: DeserializeOwned>(&self, chunks: Chunks) -> MpiResult<Vec<T>> {
        if chunks.len() != self.size() {
            return Err(MpiError::new(
                Code::CollectiveAborted,
                format!("expected {} values, got {}", self.size(), chunks.len()),
            ));
        }
        chunks.values().map(|bytes| deserialize_payload(bytes)).collect()
    }

    // ========================================================================
    // Communicator management
    // ========================================================================

    /// Take the next id from this communicator's range
    fn claim_id(&self) -> MpiResult<(CommId, CommId)> {
        let mut ceiling = self.inner.id_ceiling.lock().unwrap();
        let id = self.inner.id;
        if *ceiling - id <= 1 {
            return Err(MpiError::new(
                Code::NoIdAvailable,
                format!("communicator {} has no ids left below {}", id, *ceiling),
            ));
        }
        let new_id = id + (*ceiling - id) / 2;
        let child_ceiling = *ceiling;
        *ceiling = new_id;
        Ok((new_id, child_ceiling))
    }

    fn derive(&self, id: CommId, ceiling: CommId, group: Group) -> MpiResult<Communicator> {
        let name = format!("{}/{}", self.name(), id);
        log::debug!("derived communicator {} with {} members", name, group.size());
        Self::build(self.inner.engine.clone(), id, ceiling, group, name)
    }

    /// New communicator over `group`, which must be part of this one
    ///
    /// Every member of this communicator must call this with the same group.
    /// Callers outside `group` still consume the id and get `None`.
    pub fn comm_create(&self, group: &Group) -> MpiResult<Option<Communicator>> {
        self.ready()?;
        if !self.inner.group.is_superset_of(group) {
            return Err(MpiError::new(
                Code::GroupNotSubset,
                format!("group of {} is not part of communicator {}", group.size(), self.name()),
            ));
        }
        let (id, ceiling) = self.claim_id()?;
        if group.rank().is_none() {
            return Ok(None);
        }
        self.derive(id, ceiling, group.clone()).map(Some)
    }

    /// Same group, fresh context
    pub fn comm_dup(&self) -> MpiResult<Communicator> {
        self.comm_create(&self.inner.group)?
            .ok_or_else(|| MpiError::new(Code::Invalid, "duplicate lost the calling process"))
    }

    /// Partition by `color`, ordering each part by `key` then current rank
    ///
    /// Collective. `UNDEFINED` as the color opts out and returns `None`.
    pub fn comm_split(&self, color: i32, key: i32) -> MpiResult<Option<Communicator>> {
        if color < 0 && color != UNDEFINED {
            return Err(MpiError::new(Code::Invalid, format!("invalid split color {}", color)));
        }
        let choices: Vec<(i32, i32)> = self.allgather(&(color, key))?;
        let (id, ceiling) = self.claim_id()?;
        if color == UNDEFINED {
            return Ok(None);
        }

        let mut same: Vec<(i32, Rank)> = choices
            .iter()
            .enumerate()
            .filter(|(_, (c, _))| *c == color)
            .map(|(rank, (_, k))| (*k, rank as Rank))
            .collect();
        same.sort_unstable();
        let ranks: Vec<Rank> = same.into_iter().map(|(_, rank)| rank).collect();
        let group = self.inner.group.incl(&ranks)?;
        self.derive(id, ceiling, group).map(Some)
    }

    /// Mark this communicator unusable; later operations fail with `Invalid`
    pub fn comm_free(&self) -> MpiResult<()> {
        if self.inner.id == WORLD_COMM_ID {
            return Err(MpiError::new(Code::Invalid, "the world communicator cannot be freed"));
        }
        if self.inner.freed.swap(true, Ordering::AcqRel) {
            return Err(MpiError::new(Code::Invalid, "communicator freed twice"));
        }
        self.inner.trees.write().unwrap().clear();
        Ok(())
    }

    /// `Ident` for the same context and group, `Congruent` for the same
    /// group in another context, else the comparison of the groups
    pub fn compare(&self, other: &Communicator) -> Comparison {
        match self.inner.group.compare(&other.inner.group) {
            Comparison::Ident if self.id() == other.id() => Comparison::Ident,
            Comparison::Ident => Comparison::Congruent,
            other => other,
        }
    }
}

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

//! The coordinating engine
//!
//! One engine per process, running on its own thread. User threads hand it
//! [`Job`]s; the network hands it frames through the [`Inbox`]. Each time the
//! engine wakes it
//!
//! 1. starts every unstarted job (sends go to the network, receives become
//!    pending, collectives are started),
//! 2. decodes every raw frame into the matcher, the collective inbox or the
//!    control command list,
//! 3. matches pending receives against received envelopes,
//! 4. offers collective packets to the collectives waiting for them.
//!
//! Requests are completed from this thread only, except for send requests,
//! which the network completes once their frame is written.

pub mod inbox;
pub mod matcher;
pub mod syscommands;

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::collective::{CollectiveAlgorithm, CollectiveIo, CollectiveMessage, CollectivePacket};
use crate::config::{CollectiveSettings, MpiConfig};
use crate::constants::{is_collective_tag, CommId, Rank, Tag, TAG_ACK};
use crate::error::{Code, MpiError, MpiResult};
use crate::net::codec::{deserialize_payload, serialize_payload, Frame, MessageKind};
use crate::net::connection::SendNotify;
use crate::net::{Destination, InboundSink, Origin, Outbound, OutboundJob};
use crate::request::{CompletionSignal, RequestCore, SendCompletion, Status};

use self::syscommands::{ControlPayload, PendingCommand, SystemCommand};

pub use self::inbox::{InboundEvent, Inbox, WorkSignal};
pub use self::matcher::{Envelope, Matcher, PendingRecv};
pub use self::syscommands::ControlClient;

/// Longest the engine sleeps without a wakeup
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Called with the exit code when the job is aborted
pub type ExitAction = Arc<dyn Fn(i32) + Send + Sync>;

pub struct EngineOptions {
    pub my_rank: Rank,
    pub security_token: String,
    pub settings: CollectiveSettings,
    pub exit_action: ExitAction,
}

impl EngineOptions {
    pub fn new(my_rank: Rank) -> Self {
        Self {
            my_rank,
            security_token: uuid::Uuid::new_v4().to_string(),
            settings: CollectiveSettings::default(),
            exit_action: Arc::new(|code| std::process::exit(code)),
        }
    }

    pub fn from_config(config: &MpiConfig) -> Self {
        Self::new(config.get_rank())
            .with_security_token(config.get_security_token())
            .with_settings(config.get_collective_settings().clone())
    }

    pub fn with_security_token(mut self, token: &str) -> Self {
        self.security_token = token.to_string();
        self
    }

    pub fn with_settings(mut self, settings: CollectiveSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replace `process::exit`, mostly for tests
    pub fn with_exit_action<F>(mut self, action: F) -> Self
    where
        F: Fn(i32) + Send + Sync + 'static,
    {
        self.exit_action = Arc::new(action);
        self
    }
}

/// Payload of a `SyncUser` frame; ACKs carry the id and no data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SyncPayload {
    pub id: u64,
    pub data: Vec<u8>,
}

/// Identifies one collective invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CollectiveKey {
    pub comm_id: CommId,
    pub tag: Tag,
    pub seq: u64,
}

pub(crate) struct SendJob {
    /// World rank of the receiver
    pub dest: Rank,
    /// Communicator rank of the receiver
    pub dest_rank: Rank,
    pub frame: Frame,
    pub core: Arc<RequestCore>,
    pub sync_id: Option<u64>,
}

pub(crate) struct RecvJob {
    pub comm_id: CommId,
    pub source: Rank,
    /// World rank of the source, `None` for `ANY_SOURCE`
    pub source_global: Option<Rank>,
    pub tag: Tag,
    /// Communicator rank of the receiver, used as the sender of ACKs
    pub my_rank: Rank,
    pub core: Arc<RequestCore>,
}

pub(crate) struct CollectiveJob {
    pub key: CollectiveKey,
    pub my_rank: Rank,
    /// World ranks of the communicator, indexed by communicator rank
    pub members: Vec<Rank>,
    pub algorithm: Box<dyn CollectiveAlgorithm>,
    pub core: Arc<RequestCore>,
}

pub(crate) enum Job {
    Send(SendJob),
    Recv(RecvJob),
    Collective(CollectiveJob),
}

struct EngineShared {
    my_rank: Rank,
    inbox: Arc<Inbox>,
    outbound: Arc<dyn Outbound>,
    jobs: Mutex<VecDeque<Job>>,
    completion: Arc<CompletionSignal>,
    shutdown: AtomicBool,
    commands: Mutex<Vec<PendingCommand>>,
    register: Mutex<BTreeMap<String, serde_json::Value>>,
    settings: RwLock<CollectiveSettings>,
    security_token: String,
    exit_action: ExitAction,
    next_sync_id: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EngineShared {
    /// Hand a frame to the network, or straight to our own inbox
    fn send_frame(&self, dest: Rank, frame: Frame, notify: Option<Box<dyn SendNotify>>) {
        if dest == self.my_rank {
            if notify.as_ref().map_or(false, |n| n.is_cancelled()) {
                if let Some(notify) = notify {
                    notify.sent(Err(MpiError::Cancelled));
                }
                return;
            }
            self.inbox.deliver(
                frame,
                Origin {
                    connection: None,
                    peer: Some(self.my_rank),
                },
            );
            if let Some(notify) = notify {
                notify.sent(Ok(()));
            }
            return;
        }

        let mut job = OutboundJob::new(Destination::Rank(dest), frame);
        if let Some(notify) = notify {
            job = job.with_notify(notify);
        }
        self.outbound.enqueue(job);
    }

    fn execute_command(&self, pending: PendingCommand) {
        let reply = match &pending.command {
            SystemCommand::Ping => syscommands::pong(self.my_rank),
            SystemCommand::ReadRegister => syscommands::register_reply(self.my_rank, &self.register.lock().unwrap()),
            SystemCommand::Config(changes) => {
                let results = syscommands::apply_config(&mut self.settings.write().unwrap(), changes);
                log::info!("collective settings reconfigured: {:?}", results);
                syscommands::config_reply(self.my_rank, &results)
            }
            SystemCommand::Abort(code) => {
                log::error!("job aborted with exit code {}", code);
                (self.exit_action)(*code);
                return;
            }
        };

        match (reply, pending.reply_to) {
            (Ok(frame), Some(dest)) => self.outbound.enqueue(OutboundJob::new(dest, frame)),
            (Ok(_), None) => log::debug!("no route back for {:?} reply", pending.command),
            (Err(e), _) => log::warn!("could not build reply to {:?}: {}", pending.command, e),
        }
    }
}

/// Handle to the process's engine, cheap to clone
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("my_rank", &self.shared.my_rank)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Engine {
    /// Start the engine thread
    ///
    /// `inbox` must be the sink the network delivers to, `outbound` the
    /// network's sending side.
    pub fn start(options: EngineOptions, inbox: Arc<Inbox>, outbound: Arc<dyn Outbound>) -> MpiResult<Engine> {
        let EngineOptions {
            my_rank,
            security_token,
            settings,
            exit_action,
        } = options;

        let shared = Arc::new(EngineShared {
            my_rank,
            inbox,
            outbound,
            jobs: Mutex::new(VecDeque::new()),
            completion: CompletionSignal::new(),
            shutdown: AtomicBool::new(false),
            commands: Mutex::new(Vec::new()),
            register: Mutex::new(BTreeMap::new()),
            settings: RwLock::new(settings),
            security_token,
            exit_action,
            next_sync_id: AtomicU64::new(1),
            thread: Mutex::new(None),
        });

        let s = shared.clone();
        let handle = thread::Builder::new()
            .name(format!("mpi-engine-{}", my_rank))
            .spawn(move || EngineState::default().run(&s))?;
        *shared.thread.lock().unwrap() = Some(handle);
        log::debug!("engine started for rank {}", my_rank);

        Ok(Engine { shared })
    }

    /// World rank this engine serves
    pub fn my_rank(&self) -> Rank {
        self.shared.my_rank
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    pub fn security_token(&self) -> &str {
        &self.shared.security_token
    }

    /// Snapshot of the current collective settings
    pub fn collective_settings(&self) -> CollectiveSettings {
        self.shared.settings.read().unwrap().clone()
    }

    pub fn set_register(&self, key: &str, value: serde_json::Value) {
        self.shared.register.lock().unwrap().insert(key.to_string(), value);
    }

    pub fn register(&self) -> BTreeMap<String, serde_json::Value> {
        self.shared.register.lock().unwrap().clone()
    }

    pub(crate) fn new_request(&self) -> Arc<RequestCore> {
        RequestCore::new(self.shared.completion.clone())
    }

    pub(crate) fn next_sync_id(&self) -> u64 {
        self.shared.next_sync_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn submit(&self, job: Job) -> MpiResult<()> {
        if self.is_shut_down() {
            return Err(MpiError::new(Code::Invalid, "the runtime has been finalized"));
        }
        self.shared.jobs.lock().unwrap().push_back(job);
        self.shared.inbox.work().notify();
        Ok(())
    }

    /// Run the control commands received since the last user operation
    pub fn execute_system_commands(&self) {
        let pending: Vec<PendingCommand> = self.shared.commands.lock().unwrap().drain(..).collect();
        for command in pending {
            self.shared.execute_command(command);
        }
    }

    /// Queue an `Abort` to every rank in `ranks` except ourselves
    pub(crate) fn send_abort(&self, ranks: &[Rank], code: i32) -> MpiResult<()> {
        let payload = serialize_payload(&ControlPayload {
            security_token: Some(self.shared.security_token.clone()),
            data: Some(code.to_string()),
        })?;
        for &rank in ranks.iter().filter(|&&r| r != self.shared.my_rank) {
            let frame = Frame::new(
                self.shared.my_rank,
                0,
                crate::constants::WORLD_COMM_ID,
                MessageKind::Abort,
                payload.clone(),
            );
            self.shared.outbound.enqueue(OutboundJob::new(Destination::Rank(rank), frame));
        }
        Ok(())
    }

    pub(crate) fn exit(&self, code: i32) {
        (self.shared.exit_action)(code);
    }

    /// Stop accepting work, drain the queues and join the engine thread
    ///
    /// Receives and collectives still pending afterwards fail with `Invalid`.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.inbox.work().notify();
        let handle = self.shared.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("engine thread panicked");
            }
        }
        log::debug!("engine for rank {} flushed and stopped", self.shared.my_rank);
    }
}

// ============================================================================
// Engine thread
// ============================================================================

struct RecvSlot {
    core: Arc<RequestCore>,
    my_rank: Rank,
    /// World rank the receive depends on, if any
    peer: Option<Rank>,
}

struct PendingCollective {
    my_rank: Rank,
    members: Vec<Rank>,
    algorithm: Box<dyn CollectiveAlgorithm>,
    core: Arc<RequestCore>,
}

struct EngineIo<'a> {
    shared: &'a EngineShared,
    key: CollectiveKey,
    my_rank: Rank,
    members: &'a [Rank],
}

impl CollectiveIo for EngineIo<'_> {
    fn rank(&self) -> Rank {
        self.my_rank
    }

    fn size(&self) -> usize {
        self.members.len()
    }

    fn send(&mut self, to: Rank, step: u32, body: Vec<u8>) -> MpiResult<()> {
        let dest = usize::try_from(to)
            .ok()
            .and_then(|i| self.members.get(i).copied())
            .ok_or_else(|| MpiError::new(Code::InvalidRank, format!("collective peer {} out of range", to)))?;
        let packet = CollectivePacket {
            seq: self.key.seq,
            step,
            body,
        };
        let frame = Frame::new(
            self.my_rank,
            self.key.tag,
            self.key.comm_id,
            MessageKind::User,
            serialize_payload(&packet)?,
        );
        self.shared.send_frame(dest, frame, None);
        Ok(())
    }
}

enum Progress {
    Running,
    Finished,
    Failed(MpiError),
}

#[derive(Default)]
struct EngineState {
    matcher: Matcher<RecvSlot>,
    collectives: BTreeMap<CollectiveKey, PendingCollective>,
    collective_inbox: Vec<(CollectiveKey, CollectiveMessage)>,
    failed: HashSet<Rank>,
}

fn unreachable_peer(rank: Rank) -> MpiError {
    MpiError::new(Code::ConnectionBroken, format!("rank {} is unreachable", rank))
}

impl EngineState {
    fn run(mut self, shared: &EngineShared) {
        loop {
            shared.inbox.work().wait(IDLE_WAIT);
            let stopping = shared.shutdown.load(Ordering::Acquire);
            self.step(shared);
            if stopping {
                // Jobs submitted while the last pass ran
                self.step(shared);
                self.abandon();
                break;
            }
        }
    }

    fn step(&mut self, shared: &EngineShared) {
        let jobs: Vec<Job> = shared.jobs.lock().unwrap().drain(..).collect();
        for job in jobs {
            match job {
                Job::Send(job) => self.start_send(shared, job),
                Job::Recv(job) => self.start_recv(job),
                Job::Collective(job) => self.start_collective(shared, job),
            }
        }

        for event in shared.inbox.drain() {
            match event {
                InboundEvent::Frame(frame, origin) => self.handle_frame(shared, frame, origin),
                InboundEvent::PeerFailed(rank, error) => self.peer_failed(rank, error),
            }
        }

        // Withdrawn receives
        self.matcher.remove_where(|r| r.handle.core.is_done());
        self.match_receives(shared);
        self.progress_collectives(shared);
    }

    fn start_send(&mut self, shared: &EngineShared, job: SendJob) {
        let SendJob {
            dest,
            dest_rank,
            frame,
            core,
            sync_id,
        } = job;
        if core.is_cancelled() {
            return;
        }
        if self.failed.contains(&dest) {
            core.fail(unreachable_peer(dest));
            return;
        }
        core.mark_queued();

        if let Some(id) = sync_id {
            let slot = RecvSlot {
                core: core.clone(),
                my_rank: frame.sender,
                peer: Some(dest),
            };
            self.matcher.post(PendingRecv::ack(frame.comm_id, dest_rank, id, slot));
        }
        let status = Status {
            source: dest_rank,
            tag: frame.tag,
        };
        let notify: Box<dyn SendNotify> = SendCompletion::new(core, status, sync_id.is_some());
        shared.send_frame(dest, frame, Some(notify));
    }

    fn start_recv(&mut self, job: RecvJob) {
        if job.core.is_cancelled() {
            return;
        }
        if let Some(peer) = job.source_global.filter(|p| self.failed.contains(p)) {
            job.core.fail(unreachable_peer(peer));
            return;
        }
        job.core.mark_queued();
        let slot = RecvSlot {
            core: job.core,
            my_rank: job.my_rank,
            peer: job.source_global,
        };
        self.matcher.post(PendingRecv::new(job.comm_id, job.source, job.tag, slot));
    }

    fn start_collective(&mut self, shared: &EngineShared, job: CollectiveJob) {
        let CollectiveJob {
            key,
            my_rank,
            members,
            mut algorithm,
            core,
        } = job;

        if let Some(peer) = members.iter().find(|&&m| self.failed.contains(&m)) {
            core.fail(MpiError::new(
                Code::CollectiveAborted,
                format!("member with world rank {} is unreachable", peer),
            ));
            return;
        }
        if self.collectives.contains_key(&key) {
            core.fail(MpiError::new(Code::Invalid, format!("collective {:?} is already running", key)));
            return;
        }
        core.mark_queued();

        let mut io = EngineIo {
            shared,
            key,
            my_rank,
            members: &members,
        };
        if let Err(e) = algorithm.start(&mut io) {
            core.fail(e);
            return;
        }
        log::trace!("started {} for {:?}", algorithm.name(), key);

        let pending = PendingCollective {
            my_rank,
            members,
            algorithm,
            core,
        };
        if pending.algorithm.is_finished() {
            Self::finish_collective(key, pending);
        } else {
            self.collectives.insert(key, pending);
        }
    }

    fn finish_collective(key: CollectiveKey, mut pending: PendingCollective) {
        match pending.algorithm.take_result() {
            Ok(result) => {
                let status = Status {
                    source: pending.my_rank,
                    tag: key.tag,
                };
                pending.core.complete(result, status);
            }
            Err(e) => {
                pending.core.fail(e);
            }
        }
    }

    fn handle_frame(&mut self, shared: &EngineShared, frame: Frame, origin: Origin) {
        match frame.kind {
            MessageKind::User | MessageKind::SyncUser => self.receive_data(frame, origin),
            kind if kind.is_control() => self.receive_command(shared, frame, origin),
            MessageKind::Hello | MessageKind::Bootstrap | MessageKind::Goodbye => {
                log::trace!("ignoring {:?} frame from {:?}", frame.kind, origin.peer);
            }
            kind => log::debug!("ignoring unsolicited {:?} from {:?}", kind, origin.peer),
        }
    }

    fn receive_data(&mut self, frame: Frame, origin: Origin) {
        let Frame {
            sender,
            tag,
            comm_id,
            kind,
            payload,
        } = frame;

        if kind == MessageKind::User && is_collective_tag(tag) {
            match deserialize_payload::<CollectivePacket>(&payload) {
                Ok(packet) => {
                    let key = CollectiveKey {
                        comm_id,
                        tag,
                        seq: packet.seq,
                    };
                    let message = CollectiveMessage {
                        from: sender,
                        step: packet.step,
                        body: packet.body,
                    };
                    self.collective_inbox.push((key, message));
                }
                Err(e) => log::warn!("dropping malformed collective packet from {}: {}", sender, e),
            }
            return;
        }

        let (sync_id, payload) = if kind == MessageKind::SyncUser {
            match deserialize_payload::<SyncPayload>(&payload) {
                Ok(sync) => (Some(sync.id), sync.data),
                Err(e) => {
                    log::warn!("dropping malformed synchronous frame from {}: {}", sender, e);
                    return;
                }
            }
        } else {
            (None, payload)
        };

        self.matcher.deliver(Envelope {
            sender,
            tag,
            comm_id,
            sync_id,
            payload,
            origin: origin.peer,
        });
    }

    fn receive_command(&mut self, shared: &EngineShared, frame: Frame, origin: Origin) {
        match syscommands::decode_command(&frame, &origin, &shared.security_token) {
            Ok(Some(pending)) => match pending.command {
                // Read-only commands and aborts do not wait for a user operation
                SystemCommand::Ping | SystemCommand::ReadRegister | SystemCommand::Abort(_) => {
                    shared.execute_command(pending)
                }
                SystemCommand::Config(_) => shared.commands.lock().unwrap().push(pending),
            },
            Ok(None) => {}
            Err(e) => log::warn!("rejected control frame from {:?}: {}", origin, e),
        }
    }

    fn match_receives(&mut self, shared: &EngineShared) {
        loop {
            let restored = self.match_once(shared);
            if restored.is_empty() {
                break;
            }
            // Oldest first ends up at the front again
            for envelope in restored.into_iter().rev() {
                self.matcher.restore(envelope);
            }
        }
    }

    /// One matching pass, returns the envelopes whose receive settled
    /// (cancelled or failed) before it could take them
    fn match_once(&mut self, shared: &EngineShared) -> Vec<Envelope> {
        let mut restored = Vec::new();
        for (slot, mut envelope) in self.matcher.match_pending() {
            let ack = if envelope.wants_ack() {
                envelope.sync_id.map(|id| (id, envelope.origin, envelope.comm_id))
            } else {
                None
            };
            let status = Status {
                source: envelope.sender,
                tag: envelope.tag,
            };
            let payload = std::mem::take(&mut envelope.payload);
            if let Err(payload) = slot.core.offer(payload, status) {
                log::debug!("request {} settled before its match, message kept", slot.core.id());
                envelope.payload = payload;
                restored.push(envelope);
                continue;
            }

            if let Some((id, origin, comm_id)) = ack {
                let Some(origin) = origin else {
                    log::warn!("synchronous send {} has no known origin to acknowledge", id);
                    continue;
                };
                match serialize_payload(&SyncPayload { id, data: Vec::new() }) {
                    Ok(payload) => {
                        let frame = Frame::new(slot.my_rank, TAG_ACK, comm_id, MessageKind::SyncUser, payload);
                        shared.send_frame(origin, frame, None);
                    }
                    Err(e) => log::error!("could not encode ACK for {}: {}", id, e),
                }
            }
        }
        restored
    }

    fn progress_collectives(&mut self, shared: &EngineShared) {
        loop {
            let mut progressed = false;
            let mut i = 0;
            while i < self.collective_inbox.len() {
                let (key, from, step) = {
                    let (key, message) = &self.collective_inbox[i];
                    (*key, message.from, message.step)
                };
                let wanted = self
                    .collectives
                    .get(&key)
                    .map_or(false, |p| p.algorithm.wants(from, step));
                if !wanted {
                    i += 1;
                    continue;
                }

                let (_, message) = self.collective_inbox.remove(i);
                progressed = true;
                let progress = match self.collectives.get_mut(&key) {
                    Some(pending) => {
                        let mut io = EngineIo {
                            shared,
                            key,
                            my_rank: pending.my_rank,
                            members: &pending.members,
                        };
                        match pending.algorithm.accept(message, &mut io) {
                            Ok(()) if pending.algorithm.is_finished() => Progress::Finished,
                            Ok(()) => Progress::Running,
                            Err(e) => Progress::Failed(e),
                        }
                    }
                    None => Progress::Running,
                };

                match progress {
                    Progress::Running => {}
                    Progress::Finished => {
                        if let Some(pending) = self.collectives.remove(&key) {
                            log::trace!("finished {} for {:?}", pending.algorithm.name(), key);
                            Self::finish_collective(key, pending);
                        }
                    }
                    Progress::Failed(e) => {
                        log::error!("collective {:?} failed: {}", key, e);
                        if let Some(pending) = self.collectives.remove(&key) {
                            pending.core.fail(e);
                        }
                        self.collective_inbox.retain(|(k, _)| *k != key);
                    }
                }
            }
            if !progressed {
                break;
            }
        }
    }

    /// Fail everything that depends on `rank`
    fn peer_failed(&mut self, rank: Rank, error: MpiError) {
        log::error!("lost rank {}: {}", rank, error);
        self.failed.insert(rank);

        for slot in self.matcher.remove_where(|r| r.handle.peer == Some(rank)) {
            slot.core.fail(MpiError::new(
                Code::ConnectionBroken,
                format!("rank {} is unreachable: {}", rank, error),
            ));
        }

        let affected: Vec<CollectiveKey> = self
            .collectives
            .iter()
            .filter(|(_, p)| p.members.contains(&rank))
            .map(|(k, _)| *k)
            .collect();
        for key in affected {
            if let Some(pending) = self.collectives.remove(&key) {
                pending.core.fail(MpiError::new(
                    Code::CollectiveAborted,
                    format!("member with world rank {} is unreachable: {}", rank, error),
                ));
            }
            self.collective_inbox.retain(|(k, _)| *k != key);
        }
    }

    fn abandon(&mut self) {
        for slot in self.matcher.drain_pending() {
            slot.core.fail(MpiError::new(Code::Invalid, "runtime finalized before the receive matched"));
        }
        for (_, pending) in std::mem::take(&mut self.collectives) {
            pending
                .core
                .fail(MpiError::new(Code::Invalid, "runtime finalized during a collective"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        jobs: Mutex<Vec<OutboundJob>>,
    }

    impl Outbound for Recorder {
        fn enqueue(&self, job: OutboundJob) {
            self.jobs.lock().unwrap().push(job);
        }
    }

    fn shared(my_rank: Rank, outbound: Arc<dyn Outbound>) -> EngineShared {
        let options = EngineOptions::new(my_rank);
        EngineShared {
            my_rank,
            inbox: Inbox::new(),
            outbound,
            jobs: Mutex::new(VecDeque::new()),
            completion: CompletionSignal::new(),
            shutdown: AtomicBool::new(false),
            commands: Mutex::new(Vec::new()),
            register: Mutex::new(BTreeMap::new()),
            settings: RwLock::new(options.settings),
            security_token: options.security_token,
            exit_action: options.exit_action,
            next_sync_id: AtomicU64::new(1),
            thread: Mutex::new(None),
        }
    }

    fn post(state: &mut EngineState, shared: &EngineShared, source: Rank, tag: Tag) -> Arc<RequestCore> {
        let core = RequestCore::new(shared.completion.clone());
        state.start_recv(RecvJob {
            comm_id: 0,
            source,
            source_global: Some(source),
            tag,
            my_rank: shared.my_rank,
            core: core.clone(),
        });
        core
    }

    #[test]
    fn receive_cancelled_after_matching_keeps_the_message() {
        let recorder = Arc::new(Recorder::default());
        let shared = shared(1, recorder.clone());
        let mut state = EngineState::default();

        let first = post(&mut state, &shared, 0, 5);
        let payload = serialize_payload(&SyncPayload {
            id: 77,
            data: serialize_payload(&42i32).unwrap(),
        })
        .unwrap();
        state.receive_data(
            Frame::new(0, 5, 0, MessageKind::SyncUser, payload),
            Origin {
                connection: None,
                peer: Some(0),
            },
        );

        // The user withdraws the receive after the engine last pruned settled
        // receives but before the match completes it
        assert!(first.cancel());
        state.match_receives(&shared);
        assert!(recorder.jobs.lock().unwrap().is_empty());
        assert_eq!(state.matcher.received_len(), 1);

        let second = post(&mut state, &shared, 0, 5);
        state.match_receives(&shared);
        let (bytes, status) = second.wait_raw().unwrap();
        assert_eq!(deserialize_payload::<i32>(&bytes).unwrap(), 42);
        assert_eq!(status, Status { source: 0, tag: 5 });

        let jobs = recorder.jobs.lock().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].dest, Destination::Rank(0));
        assert_eq!(jobs[0].frame.tag, TAG_ACK);
        let ack: SyncPayload = deserialize_payload(&jobs[0].frame.payload).unwrap();
        assert_eq!(ack.id, 77);
    }

    #[test]
    fn restored_messages_keep_arrival_order() {
        let shared = shared(1, Arc::new(Recorder::default()));
        let mut state = EngineState::default();

        let a = post(&mut state, &shared, 0, 5);
        let b = post(&mut state, &shared, 0, 5);
        for value in [1i32, 2] {
            state.receive_data(
                Frame::new(0, 5, 0, MessageKind::User, serialize_payload(&value).unwrap()),
                Origin::default(),
            );
        }
        assert!(a.cancel());
        assert!(b.cancel());
        state.match_receives(&shared);
        assert_eq!(state.matcher.received_len(), 2);

        let c = post(&mut state, &shared, 0, 5);
        state.match_receives(&shared);
        assert_eq!(deserialize_payload::<i32>(&c.wait_raw().unwrap().0).unwrap(), 1);
    }
}

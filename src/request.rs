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

//! Outstanding operations
//!
//! A request moves `New -> Queued -> Ready -> Finished`. Synchronous sends
//! pass through `Unacked` between being written and the receiver's ACK.
//! `Cancelled` and `Failed` are terminal. The engine moves a request out of
//! the pending states exactly once and signals its condition variable; the
//! caller of `wait` then takes ownership of the data.
//!
//! Cancellation is local only: it withdraws a request that has not been
//! matched or written yet, the peer is never told.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::constants::{Rank, Tag};
use crate::error::{Code, MpiError, MpiResult};
use crate::net::codec::deserialize_payload;
use crate::net::connection::SendNotify;

/// Upper bound on a single wait for the shared completion signal
const COMPLETION_RECHECK: Duration = Duration::from_millis(50);

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    New,
    Queued,
    Unacked,
    Ready,
    Finished,
    Cancelled,
    Failed,
}

impl RequestState {
    pub fn is_pending(&self) -> bool {
        matches!(self, RequestState::New | RequestState::Queued | RequestState::Unacked)
    }
}

/// Envelope information of a completed receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub source: Rank,
    pub tag: Tag,
}

/// Wakes anyone waiting for "some request completed"
#[derive(Debug, Default)]
pub struct CompletionSignal {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl CompletionSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn generation(&self) -> u64 {
        *self.generation.lock().unwrap()
    }

    pub fn notify(&self) {
        let mut generation = self.generation.lock().unwrap();
        *generation += 1;
        drop(generation);
        self.cond.notify_all();
    }

    /// Wait until the generation moves past `seen`
    pub fn wait_past(&self, seen: u64) {
        let generation = self.generation.lock().unwrap();
        if *generation == seen {
            let _ = self.cond.wait_timeout(generation, COMPLETION_RECHECK).unwrap();
        }
    }
}

#[derive(Debug)]
struct Slot {
    state: RequestState,
    payload: Option<Vec<u8>>,
    status: Option<Status>,
    error: Option<MpiError>,
}

/// Shared state of one request, held by the engine and by the user handle
#[derive(Debug)]
pub struct RequestCore {
    id: u64,
    slot: Mutex<Slot>,
    cond: Condvar,
    signal: Arc<CompletionSignal>,
}

impl RequestCore {
    pub fn new(signal: Arc<CompletionSignal>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            slot: Mutex::new(Slot {
                state: RequestState::New,
                payload: None,
                status: None,
                error: None,
            }),
            cond: Condvar::new(),
            signal,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> RequestState {
        self.slot.lock().unwrap().state
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == RequestState::Cancelled
    }

    pub fn is_done(&self) -> bool {
        !self.state().is_pending()
    }

    pub fn mark_queued(&self) {
        let mut slot = self.slot.lock().unwrap();
        if slot.state == RequestState::New {
            slot.state = RequestState::Queued;
        }
    }

    /// Written to the wire, still waiting for the receiver's ACK
    pub fn mark_unacked(&self) {
        let mut slot = self.slot.lock().unwrap();
        if matches!(slot.state, RequestState::New | RequestState::Queued) {
            slot.state = RequestState::Unacked;
        }
    }

    fn settle(&self, apply: impl FnOnce(&mut Slot)) -> bool {
        let mut slot = self.slot.lock().unwrap();
        if !slot.state.is_pending() {
            return false;
        }
        apply(&mut slot);
        drop(slot);
        self.cond.notify_all();
        self.signal.notify();
        true
    }

    /// Move to `Ready` with the given data, false if already settled
    pub fn complete(&self, payload: Vec<u8>, status: Status) -> bool {
        self.settle(|slot| {
            slot.state = RequestState::Ready;
            slot.payload = Some(payload);
            slot.status = Some(status);
        })
    }

    /// Move to `Ready` unless already settled, handing the payload back when
    /// the request was cancelled or failed first
    pub fn offer(&self, payload: Vec<u8>, status: Status) -> Result<(), Vec<u8>> {
        let mut slot = self.slot.lock().unwrap();
        if !slot.state.is_pending() {
            return Err(payload);
        }
        slot.state = RequestState::Ready;
        slot.payload = Some(payload);
        slot.status = Some(status);
        drop(slot);
        self.cond.notify_all();
        self.signal.notify();
        Ok(())
    }

    pub fn fail(&self, error: MpiError) -> bool {
        self.settle(|slot| {
            slot.state = RequestState::Failed;
            slot.error = Some(error);
        })
    }

    /// Withdraw a request that has not been matched or written yet
    pub fn cancel(&self) -> bool {
        let mut slot = self.slot.lock().unwrap();
        if !matches!(slot.state, RequestState::New | RequestState::Queued) {
            return false;
        }
        slot.state = RequestState::Cancelled;
        drop(slot);
        self.cond.notify_all();
        self.signal.notify();
        true
    }

    pub fn status(&self) -> Option<Status> {
        self.slot.lock().unwrap().status
    }

    /// Block until settled, then take the data
    pub fn wait_raw(&self) -> MpiResult<(Vec<u8>, Status)> {
        let mut slot = self.slot.lock().unwrap();
        while slot.state.is_pending() {
            slot = self.cond.wait(slot).unwrap();
        }

        match slot.state {
            RequestState::Ready => {
                slot.state = RequestState::Finished;
                let payload = slot.payload.take().unwrap_or_default();
                let status = slot.status.unwrap_or(Status { source: -1, tag: -1 });
                Ok((payload, status))
            }
            RequestState::Cancelled => Err(MpiError::Cancelled),
            RequestState::Failed => Err(slot
                .error
                .clone()
                .unwrap_or_else(|| MpiError::new(Code::UnknownError, "request failed"))),
            _ => Err(MpiError::new(Code::Invalid, "request was already waited on")),
        }
    }
}

/// Completion hook for frames handed to the network
pub struct SendCompletion {
    core: Arc<RequestCore>,
    status: Status,
    synchronous: bool,
}

impl SendCompletion {
    pub fn new(core: Arc<RequestCore>, status: Status, synchronous: bool) -> Box<Self> {
        Box::new(Self {
            core,
            status,
            synchronous,
        })
    }
}

impl SendNotify for SendCompletion {
    fn is_cancelled(&self) -> bool {
        self.core.is_cancelled()
    }

    fn sent(self: Box<Self>, result: MpiResult<()>) {
        match result {
            Ok(()) if self.synchronous => self.core.mark_unacked(),
            Ok(()) => {
                self.core.complete(Vec::new(), self.status);
            }
            Err(MpiError::Cancelled) => {}
            Err(e) => {
                self.core.fail(e);
            }
        }
    }
}

/// Handle to an outstanding operation producing a `T`
///
/// Sends produce `()`, receives produce the received value.
#[derive(Debug)]
pub struct Request<T = ()> {
    core: Arc<RequestCore>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Request<T> {
    pub(crate) fn from_core(core: Arc<RequestCore>) -> Self {
        Self {
            core,
            _marker: PhantomData,
        }
    }

    pub(crate) fn core(&self) -> &Arc<RequestCore> {
        &self.core
    }

    pub fn state(&self) -> RequestState {
        self.core.state()
    }

    /// True once the request no longer blocks a `wait`
    pub fn test(&self) -> bool {
        self.core.is_done()
    }

    /// Withdraw the request if it has not been matched or written yet
    ///
    /// Only the local side is affected; a message already on the wire still
    /// arrives at the receiver.
    pub fn cancel(&self) -> bool {
        self.core.cancel()
    }

    pub fn status(&self) -> Option<Status> {
        self.core.status()
    }
}

impl<T: DeserializeOwned> Request<T> {
    pub fn wait(self) -> MpiResult<T> {
        self.wait_with_status().map(|(value, _)| value)
    }

    pub fn wait_with_status(self) -> MpiResult<(T, Status)> {
        let (payload, status) = self.core.wait_raw()?;
        Ok((deserialize_payload(&payload)?, status))
    }
}

fn shared_signal<T>(requests: &[Request<T>]) -> Option<Arc<CompletionSignal>> {
    requests.first().map(|r| r.core.signal.clone())
}

/// Wait for every request, results in request order
pub fn waitall<T: DeserializeOwned>(requests: Vec<Request<T>>) -> MpiResult<Vec<T>> {
    requests.into_iter().map(|r| r.wait()).collect()
}

/// Wait until one request completes, remove it and return its index and value
pub fn waitany<T: DeserializeOwned>(requests: &mut Vec<Request<T>>) -> MpiResult<(usize, T)> {
    let signal = shared_signal(requests)
        .ok_or_else(|| MpiError::new(Code::Invalid, "waitany on an empty request list"))?;
    loop {
        let seen = signal.generation();
        if let Some(index) = testany(requests) {
            let request = requests.remove(index);
            return Ok((index, request.wait()?));
        }
        signal.wait_past(seen);
    }
}

/// Wait until at least one request completes, remove every completed one
///
/// Indices refer to positions before removal.
pub fn waitsome<T: DeserializeOwned>(requests: &mut Vec<Request<T>>) -> MpiResult<Vec<(usize, T)>> {
    let signal = shared_signal(requests)
        .ok_or_else(|| MpiError::new(Code::Invalid, "waitsome on an empty request list"))?;
    loop {
        let seen = signal.generation();
        let done = testsome(requests);
        if !done.is_empty() {
            let mut results = Vec::with_capacity(done.len());
            for &index in done.iter().rev() {
                let request = requests.remove(index);
                results.push((index, request.wait()?));
            }
            results.reverse();
            return Ok(results);
        }
        signal.wait_past(seen);
    }
}

pub fn testall<T>(requests: &[Request<T>]) -> bool {
    requests.iter().all(|r| r.test())
}

pub fn testany<T>(requests: &[Request<T>]) -> Option<usize> {
    requests.iter().position(|r| r.test())
}

pub fn testsome<T>(requests: &[Request<T>]) -> Vec<usize> {
    requests
        .iter()
        .enumerate()
        .filter(|(_, r)| r.test())
        .map(|(i, _)| i)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::codec::serialize_payload;

    #[test]
    fn completion_is_one_shot() {
        let core = RequestCore::new(CompletionSignal::new());
        assert!(core.complete(serialize_payload(&7u32).unwrap(), Status { source: 1, tag: 2 }));
        assert!(!core.fail(MpiError::Cancelled));
        let request: Request<u32> = Request::from_core(core);
        assert_eq!(request.wait_with_status().unwrap(), (7, Status { source: 1, tag: 2 }));
    }

    #[test]
    fn cancel_only_before_matching() {
        let core = RequestCore::new(CompletionSignal::new());
        core.mark_unacked();
        assert!(!core.cancel());

        let core = RequestCore::new(CompletionSignal::new());
        core.mark_queued();
        assert!(core.cancel());
        let request: Request<()> = Request::from_core(core);
        assert!(matches!(request.wait(), Err(MpiError::Cancelled)));
    }

    #[test]
    fn sync_send_waits_for_ack() {
        let core = RequestCore::new(CompletionSignal::new());
        SendCompletion::new(core.clone(), Status { source: 0, tag: 0 }, true).sent(Ok(()));
        assert_eq!(core.state(), RequestState::Unacked);
        core.complete(Vec::new(), Status { source: 0, tag: 0 });
        assert_eq!(core.state(), RequestState::Ready);
    }
}

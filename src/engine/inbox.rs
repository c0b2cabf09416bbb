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

//! Raw inbound queue shared between the network and the engine thread

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::constants::Rank;
use crate::error::MpiError;
use crate::net::codec::Frame;
use crate::net::{InboundSink, Origin};

/// "Has work" flag the engine thread sleeps on
#[derive(Debug, Default)]
pub struct WorkSignal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl WorkSignal {
    pub fn notify(&self) {
        *self.pending.lock().unwrap() = true;
        self.cond.notify_one();
    }

    /// Wait for a notification or `timeout`, consuming the flag
    pub fn wait(&self, timeout: Duration) {
        let mut pending = self.pending.lock().unwrap();
        if !*pending {
            pending = self.cond.wait_timeout(pending, timeout).unwrap().0;
        }
        *pending = false;
    }
}

#[derive(Debug)]
pub enum InboundEvent {
    Frame(Frame, Origin),
    PeerFailed(Rank, MpiError),
}

/// Frames not decoded yet, in arrival order
#[derive(Debug, Default)]
pub struct Inbox {
    events: Mutex<VecDeque<InboundEvent>>,
    work: Arc<WorkSignal>,
}

impl Inbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn work(&self) -> &Arc<WorkSignal> {
        &self.work
    }

    pub(crate) fn drain(&self) -> Vec<InboundEvent> {
        self.events.lock().unwrap().drain(..).collect()
    }

    fn push(&self, event: InboundEvent) {
        self.events.lock().unwrap().push_back(event);
        self.work.notify();
    }
}

impl InboundSink for Inbox {
    fn deliver(&self, frame: Frame, origin: Origin) {
        self.push(InboundEvent::Frame(frame, origin));
    }

    fn peer_failed(&self, rank: Rank, error: MpiError) {
        self.push(InboundEvent::PeerFailed(rank, error));
    }
}

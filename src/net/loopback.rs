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

//! In-memory fabric connecting several engines in one process
//!
//! Frames are handed straight to the destination's sink, in order, without
//! touching a socket. Hosting every rank of a job as threads of one process
//! this way exercises the full engine and collective stack.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use crate::constants::Rank;
use crate::error::{Code, MpiError};
use crate::net::{Destination, InboundSink, Origin, Outbound, OutboundJob};

pub struct LoopbackFabric {
    sinks: RwLock<Vec<Option<Arc<dyn InboundSink>>>>,
    down: Mutex<HashSet<Rank>>,
}

impl LoopbackFabric {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            sinks: RwLock::new((0..size).map(|_| None).collect()),
            down: Mutex::new(HashSet::new()),
        })
    }

    pub fn size(&self) -> usize {
        self.sinks.read().unwrap().len()
    }

    /// Register the receiving side of `rank`
    pub fn attach(&self, rank: Rank, sink: Arc<dyn InboundSink>) {
        if let Some(slot) = self.sinks.write().unwrap().get_mut(rank as usize) {
            *slot = Some(sink);
        }
    }

    /// Sending side for `rank`
    pub fn endpoint(self: &Arc<Self>, rank: Rank) -> Arc<LoopbackEndpoint> {
        Arc::new(LoopbackEndpoint {
            fabric: self.clone(),
            rank,
        })
    }

    /// Take `rank` off the fabric and tell every other rank its connection broke
    pub fn fail(&self, rank: Rank) {
        self.down.lock().unwrap().insert(rank);
        let sinks: Vec<(usize, Arc<dyn InboundSink>)> = self
            .sinks
            .read()
            .unwrap()
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.clone().map(|s| (i, s)))
            .collect();
        for (i, sink) in sinks {
            if i as Rank != rank {
                sink.peer_failed(
                    rank,
                    MpiError::new(Code::ConnectionBroken, format!("rank {} left the fabric", rank)),
                );
            }
        }
    }
}

pub struct LoopbackEndpoint {
    fabric: Arc<LoopbackFabric>,
    rank: Rank,
}

impl Outbound for LoopbackEndpoint {
    fn enqueue(&self, job: OutboundJob) {
        let OutboundJob { dest, frame, notify } = job;

        let target = match dest {
            Destination::Rank(rank) if !self.fabric.down.lock().unwrap().contains(&rank) => {
                self.fabric
                    .sinks
                    .read()
                    .unwrap()
                    .get(rank as usize)
                    .cloned()
                    .flatten()
            }
            _ => None,
        };

        match target {
            Some(sink) => {
                if notify.as_ref().map_or(false, |n| n.is_cancelled()) {
                    if let Some(notify) = notify {
                        notify.sent(Err(MpiError::Cancelled));
                    }
                    return;
                }
                sink.deliver(
                    frame,
                    Origin {
                        connection: None,
                        peer: Some(self.rank),
                    },
                );
                if let Some(notify) = notify {
                    notify.sent(Ok(()));
                }
            }
            None => {
                if let Some(notify) = notify {
                    notify.sent(Err(MpiError::new(
                        Code::ConnectionBroken,
                        format!("no loopback route from rank {} to {:?}", self.rank, dest),
                    )));
                }
            }
        }
    }
}

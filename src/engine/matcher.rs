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

//! Point-to-point matching
//!
//! Received envelopes wait in arrival order, posted receives wait in posting
//! order. A matching pass offers envelopes to receives grouped by how
//! specific they are: fully specified receives first, then receives with one
//! wildcard, then `(ANY_SOURCE, ANY_TAG)`. Each receive takes the earliest
//! envelope it matches. A wildcard receive posted early therefore cannot
//! swallow a message a specific receive is waiting for.
//!
//! The matcher is generic over the receive handle so it can be tested
//! without an engine.

use std::collections::VecDeque;

use crate::constants::{CommId, Rank, Tag, ANY_SOURCE, ANY_TAG, TAG_ACK};

/// A received message waiting for a receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Communicator rank of the sender
    pub sender: Rank,
    pub tag: Tag,
    pub comm_id: CommId,
    /// Id of a synchronous send, or of the send an ACK answers
    pub sync_id: Option<u64>,
    pub payload: Vec<u8>,
    /// World rank of the sending process
    pub origin: Option<Rank>,
}

impl Envelope {
    pub fn new(sender: Rank, tag: Tag, comm_id: CommId, payload: Vec<u8>) -> Self {
        Self {
            sender,
            tag,
            comm_id,
            sync_id: None,
            payload,
            origin: None,
        }
    }

    pub fn is_ack(&self) -> bool {
        self.tag == TAG_ACK
    }

    /// Data from a synchronous send, the receiver owes an ACK
    pub fn wants_ack(&self) -> bool {
        self.sync_id.is_some() && !self.is_ack()
    }
}

/// A posted receive
#[derive(Debug, Clone)]
pub struct PendingRecv<H> {
    pub comm_id: CommId,
    pub source: Rank,
    pub tag: Tag,
    /// Set when this receive waits for the ACK of synchronous send `id`
    pub ack_for: Option<u64>,
    pub handle: H,
    seq: u64,
}

impl<H> PendingRecv<H> {
    pub fn new(comm_id: CommId, source: Rank, tag: Tag, handle: H) -> Self {
        Self {
            comm_id,
            source,
            tag,
            ack_for: None,
            handle,
            seq: 0,
        }
    }

    pub fn ack(comm_id: CommId, source: Rank, sync_id: u64, handle: H) -> Self {
        Self {
            comm_id,
            source,
            tag: TAG_ACK,
            ack_for: Some(sync_id),
            handle,
            seq: 0,
        }
    }

    /// 0 = fully specific, 1 = one wildcard, 2 = both wildcards
    pub fn specificity(&self) -> u8 {
        if self.ack_for.is_some() {
            return 0;
        }
        (self.source == ANY_SOURCE) as u8 + (self.tag == ANY_TAG) as u8
    }

    pub fn matches(&self, envelope: &Envelope) -> bool {
        if self.comm_id != envelope.comm_id {
            return false;
        }
        if self.source != ANY_SOURCE && self.source != envelope.sender {
            return false;
        }
        match self.ack_for {
            Some(id) => envelope.is_ack() && envelope.sync_id == Some(id),
            None => {
                if envelope.is_ack() {
                    false
                } else if self.tag == ANY_TAG {
                    envelope.tag >= 0
                } else {
                    envelope.tag == self.tag
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct Matcher<H> {
    pending: Vec<PendingRecv<H>>,
    received: VecDeque<Envelope>,
    next_seq: u64,
}

impl<H> Default for Matcher<H> {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            received: VecDeque::new(),
            next_seq: 0,
        }
    }
}

impl<H> Matcher<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&mut self, mut recv: PendingRecv<H>) {
        recv.seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push(recv);
    }

    pub fn deliver(&mut self, envelope: Envelope) {
        self.received.push_back(envelope);
    }

    /// Put back an envelope whose receive was withdrawn after matching
    pub fn restore(&mut self, envelope: Envelope) {
        self.received.push_front(envelope);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn received_len(&self) -> usize {
        self.received.len()
    }

    /// Pair receives with envelopes, removing both
    pub fn match_pending(&mut self) -> Vec<(H, Envelope)> {
        if self.pending.is_empty() || self.received.is_empty() {
            return Vec::new();
        }

        let mut order: Vec<(u8, u64, usize)> = self
            .pending
            .iter()
            .enumerate()
            .map(|(i, r)| (r.specificity(), r.seq, i))
            .collect();
        order.sort_unstable();

        let mut pairs: Vec<(usize, Envelope)> = Vec::new();
        for (_, _, i) in order {
            if self.received.is_empty() {
                break;
            }
            let recv = &self.pending[i];
            if let Some(pos) = self.received.iter().position(|e| recv.matches(e)) {
                if let Some(envelope) = self.received.remove(pos) {
                    pairs.push((i, envelope));
                }
            }
        }

        if pairs.is_empty() {
            return Vec::new();
        }

        // Pull matched receives out, preserving the order of the rest
        let mut slots: Vec<Option<PendingRecv<H>>> = self.pending.drain(..).map(Some).collect();
        let mut matched = Vec::with_capacity(pairs.len());
        for (i, envelope) in pairs {
            if let Some(recv) = slots[i].take() {
                matched.push((recv.handle, envelope));
            }
        }
        self.pending = slots.into_iter().flatten().collect();
        matched
    }

    /// Drop every pending receive `remove` selects, returning their handles
    pub fn remove_where<F>(&mut self, mut remove: F) -> Vec<H>
    where
        F: FnMut(&PendingRecv<H>) -> bool,
    {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.pending.len());
        for recv in self.pending.drain(..) {
            if remove(&recv) {
                removed.push(recv.handle);
            } else {
                kept.push(recv);
            }
        }
        self.pending = kept;
        removed
    }

    /// Empty the pending list, used on shutdown
    pub fn drain_pending(&mut self) -> Vec<H> {
        self.pending.drain(..).map(|r| r.handle).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_only_matches_its_own_send() {
        let mut matcher = Matcher::new();
        matcher.post(PendingRecv::ack(0, 1, 42, "ack"));
        let mut stray = Envelope::new(1, TAG_ACK, 0, Vec::new());
        stray.sync_id = Some(41);
        matcher.deliver(stray);
        assert!(matcher.match_pending().is_empty());

        let mut ack = Envelope::new(1, TAG_ACK, 0, Vec::new());
        ack.sync_id = Some(42);
        matcher.deliver(ack);
        assert_eq!(matcher.match_pending().len(), 1);
        assert_eq!(matcher.received_len(), 1);
    }

    #[test]
    fn any_tag_skips_internal_tags() {
        let mut matcher = Matcher::new();
        matcher.post(PendingRecv::new(0, ANY_SOURCE, ANY_TAG, ()));
        matcher.deliver(Envelope::new(3, TAG_ACK, 0, Vec::new()));
        assert!(matcher.match_pending().is_empty());
    }
}

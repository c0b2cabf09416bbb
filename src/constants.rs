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

//! Tags, wildcards and communicator comparison results
//!
//! User tags are non-negative. Everything below zero other than `ANY_TAG`
//! belongs to the runtime's own protocol.

/// Rank within a group or communicator
pub type Rank = i32;

/// Message tag
pub type Tag = i32;

/// Communicator context id
pub type CommId = i64;

/// Receive from any sender
pub const ANY_SOURCE: Rank = -1;

/// Receive any user tag
pub const ANY_TAG: Tag = -1;

/// Rank value for a process that is not a member of a group
pub const UNDEFINED: Rank = -1;

/// Largest user tag accepted
pub const TAG_UB: Tag = 1 << 30;

pub const TAG_ACK: Tag = -16;
pub const TAG_SHUTDOWN: Tag = -32;
pub const TAG_INITIALIZING: Tag = -64;
pub const TAG_BCAST: Tag = -128;
pub const TAG_BARRIER: Tag = -256;
pub const TAG_REDUCE: Tag = -384;
pub const TAG_ALLREDUCE: Tag = -512;
pub const TAG_SCATTER: Tag = -640;
pub const TAG_GATHER: Tag = -768;
pub const TAG_ALLGATHER: Tag = -896;
pub const TAG_ALLTOALL: Tag = -1024;
pub const TAG_SCAN: Tag = -1152;

/// Tags routed to the collective engine instead of point-to-point matching
pub const COLLECTIVE_TAGS: [Tag; 11] = [
    TAG_SHUTDOWN,
    TAG_INITIALIZING,
    TAG_BCAST,
    TAG_BARRIER,
    TAG_REDUCE,
    TAG_ALLREDUCE,
    TAG_SCATTER,
    TAG_GATHER,
    TAG_ALLGATHER,
    TAG_ALLTOALL,
    TAG_SCAN,
];

/// Communicator id of the world communicator
pub const WORLD_COMM_ID: CommId = 0;

/// Upper bound of the locally derived communicator id space
pub const COMM_ID_CEILING: CommId = 1 << 31;

pub fn is_collective_tag(tag: Tag) -> bool {
    COLLECTIVE_TAGS.contains(&tag)
}

pub fn is_user_tag(tag: Tag) -> bool {
    (0..=TAG_UB).contains(&tag)
}

/// Result of comparing two groups or communicators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Comparison {
    /// Same object
    Ident,
    /// Same members in the same order, different context
    Congruent,
    /// Same members, different order
    Similar,
    /// Anything else
    Unequal,
}

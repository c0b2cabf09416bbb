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

//! Networking layer
//!
//! The engine talks to the network through two seams: it pushes
//! [`OutboundJob`]s into an [`Outbound`] and receives frames through an
//! [`InboundSink`]. [`transport::Transport`] implements both ends over TCP,
//! [`loopback::LoopbackFabric`] wires engines together in memory.

pub mod bootstrap;
pub mod codec;
pub mod connection;
pub mod loopback;
pub mod socket_pool;
pub mod transport;

use crate::constants::Rank;
use crate::error::MpiError;

use self::codec::Frame;
use self::connection::{ConnectionId, SendNotify};

pub use self::bootstrap::{PeerAddr, Rendezvous};
pub use self::codec::MessageKind;
pub use self::socket_pool::SocketPool;
pub use self::transport::Transport;

/// Where an outbound frame goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// A process, by world rank
    Rank(Rank),
    /// A specific connection, used to answer control commands
    Connection(ConnectionId),
}

pub struct OutboundJob {
    pub dest: Destination,
    pub frame: Frame,
    pub notify: Option<Box<dyn SendNotify>>,
}

impl OutboundJob {
    pub fn new(dest: Destination, frame: Frame) -> Self {
        Self {
            dest,
            frame,
            notify: None,
        }
    }

    pub fn with_notify(mut self, notify: Box<dyn SendNotify>) -> Self {
        self.notify = Some(notify);
        self
    }
}

/// Sending side of the network
pub trait Outbound: Send + Sync {
    fn enqueue(&self, job: OutboundJob);
}

/// Where a delivered frame came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Origin {
    pub connection: Option<ConnectionId>,
    /// World rank of the sending process, when the connection introduced itself
    pub peer: Option<Rank>,
}

/// Receiving side of the network
pub trait InboundSink: Send + Sync {
    fn deliver(&self, frame: Frame, origin: Origin);

    /// The connection to `rank` broke
    fn peer_failed(&self, rank: Rank, error: MpiError);
}

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

//! tcpmpi: message passing between processes over plain TCP
//!
//! A small MPI-style runtime. Processes find each other through a launcher,
//! exchange typed point-to-point messages with tag matching, and run tree
//! and exchange based collectives over communicators. Connections are kept
//! in a bounded socket pool and opened on demand.

pub mod cartesian;
pub mod collective;
pub mod communicator;
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod group;
pub mod mpi;
pub mod net;
pub mod request;
pub mod topology;
pub mod util;

// Re-export commonly used types
pub use crate::cartesian::{dims_create, CartesianComm, CartesianTopology};
pub use crate::collective::{Avg, FnOp, Max, Min, Prod, ReduceOp, Sum};
pub use crate::communicator::Communicator;
pub use crate::config::{CollectiveSettings, LogTarget, MpiConfig, MpiConfigBuilder};
pub use crate::constants::{Comparison, Rank, Tag, ANY_SOURCE, ANY_TAG, UNDEFINED};
pub use crate::engine::ControlClient;
pub use crate::error::{Code, MpiError, MpiResult};
pub use crate::group::Group;
pub use crate::mpi::Mpi;
pub use crate::net::{PeerAddr, Rendezvous};
pub use crate::request::{testall, testany, testsome, waitall, waitany, waitsome, Request, RequestState, Status};

/// The main entry point and version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

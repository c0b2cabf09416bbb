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

//! The runtime environment of one process
//!
//! [`Mpi::init`] binds the listening socket, registers with the launcher,
//! starts the transport and the engine, and synchronises with every other
//! rank before returning. [`Mpi::finalize`] is the mirror image.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::communicator::Communicator;
use crate::config::MpiConfig;
use crate::constants::{Rank, TAG_INITIALIZING, TAG_SHUTDOWN};
use crate::engine::{Engine, EngineOptions, Inbox};
use crate::error::{Code, MpiError, MpiResult};
use crate::net::bootstrap::{handshake, BootstrapHello};
use crate::net::transport::{bind_listener, TransportOptions};
use crate::net::{Outbound, Transport};
use crate::util::logging::init_logging;

/// How long a full network startup waits for lower ranks to dial in
const PEER_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// How long `abort` keeps flushing the abort notices before exiting
const ABORT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Mpi {
    config: MpiConfig,
    engine: Engine,
    transport: Arc<Transport>,
    world: Communicator,
    finalized: AtomicBool,
    started: Instant,
}

impl Mpi {
    /// Start the runtime for this process
    pub fn init(config: MpiConfig) -> MpiResult<Mpi> {
        let options = EngineOptions::from_config(&config);
        Self::init_with(config, options)
    }

    /// Like [`Mpi::init`] with explicit engine options, for instance a
    /// custom exit action
    pub fn init_with(config: MpiConfig, options: EngineOptions) -> MpiResult<Mpi> {
        init_logging(&config)?;
        let started = Instant::now();
        let rank = config.get_rank();

        let listener = bind_listener(config.get_bind_host())?;
        let port = listener.local_addr()?.port();
        log::info!("rank {} listening on {}:{}", rank, config.get_bind_host(), port);

        let roster = handshake(
            config.get_launcher_host(),
            config.get_launcher_port(),
            &BootstrapHello {
                host: config.get_bind_host().to_string(),
                port,
                rank,
                security_token: config.get_security_token().to_string(),
            },
        )?;
        if roster.len() != config.get_size() {
            return Err(MpiError::new(
                Code::Invalid,
                format!("launcher sent {} peers, expected {}", roster.len(), config.get_size()),
            ));
        }

        let inbox = Inbox::new();
        let transport = Arc::new(Transport::start(
            listener,
            roster.clone(),
            TransportOptions {
                my_rank: rank,
                pool_capacity: config.effective_pool_size(),
                single_io_thread: config.is_single_io_thread(),
                pin_connections: config.is_full_network_startup(),
            },
            inbox.clone(),
        )?);
        let outbound: Arc<dyn Outbound> = transport.clone();
        let engine = Engine::start(options, inbox, outbound)?;
        let world = Communicator::world(&engine, roster)?;

        let mpi = Mpi {
            config,
            engine,
            transport,
            world,
            finalized: AtomicBool::new(false),
            started,
        };

        if mpi.config.is_full_network_startup() {
            mpi.connect_everyone()?;
        }
        mpi.world.barrier_on(TAG_INITIALIZING)?;
        log::info!(
            "rank {} of {} initialised in {:?}",
            rank,
            mpi.size(),
            mpi.started.elapsed()
        );
        Ok(mpi)
    }

    /// Dial every higher rank, then wait for every lower rank to dial us
    fn connect_everyone(&self) -> MpiResult<()> {
        let rank = self.rank();
        let size = self.size() as Rank;
        let higher: Vec<Rank> = (rank + 1..size).collect();
        let lower: Vec<Rank> = (0..rank).collect();
        self.transport.connect_peers(&higher)?;
        self.transport.wait_for_peers(&lower, PEER_WAIT_TIMEOUT)?;
        log::debug!("full network startup done, pool holds {:?}", self.transport.pooled_ranks());
        Ok(())
    }

    pub fn config(&self) -> &MpiConfig {
        &self.config
    }

    pub fn world(&self) -> &Communicator {
        &self.world
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn rank(&self) -> Rank {
        self.engine.my_rank()
    }

    pub fn size(&self) -> usize {
        self.world.size()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    /// Store a value that control clients can read with `ReadRegister`
    pub fn set_register(&self, key: &str, value: serde_json::Value) {
        self.engine.set_register(key, value);
    }

    pub fn register(&self) -> std::collections::BTreeMap<String, serde_json::Value> {
        self.engine.register()
    }

    /// Seconds since this process initialised
    pub fn wtime(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Resolution of [`Mpi::wtime`]
    pub fn wtick(&self) -> f64 {
        1e-9
    }

    /// Synchronise with every rank, then stop the engine and the transport
    ///
    /// Operations still pending on other threads fail with `Invalid`.
    pub fn finalize(&self) -> MpiResult<()> {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return Err(MpiError::new(Code::Invalid, "finalize called twice"));
        }
        self.engine.execute_system_commands();
        let barrier = self.world.barrier_on(TAG_SHUTDOWN);
        if let Err(e) = &barrier {
            log::warn!("shutdown barrier failed: {}", e);
        }
        self.engine.shutdown();
        self.transport.shutdown();
        log::info!("rank {} finalized after {:.3}s", self.rank(), self.wtime());
        barrier
    }

    /// Tell every other rank to abort, flush for a bounded time, and exit with `code`
    pub fn abort(&self, code: i32) {
        log::error!("rank {} aborting with code {}", self.rank(), code);
        if let Err(e) = self.engine.send_abort(&self.world.group().global_ranks(), code) {
            log::error!("could not notify peers of abort: {}", e);
        }
        self.finalized.store(true, Ordering::Release);
        self.engine.shutdown();
        self.transport.halt(ABORT_FLUSH_TIMEOUT);
        self.engine.exit(code);
    }
}

impl Drop for Mpi {
    fn drop(&mut self) {
        if !self.is_finalized() {
            log::warn!("rank {} dropped without finalize, closing its connections", self.rank());
            self.finalized.store(true, Ordering::Release);
            self.engine.shutdown();
            // No goodbye: peers must see this rank as gone
            self.transport.halt(Duration::ZERO);
        }
    }
}

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

//! TCP transport
//!
//! Owns the listening socket, the socket pool and a tokio runtime driven by
//! one I/O thread. An accept task registers incoming connections; every
//! connection gets a reader task that hands complete frames to the
//! [`InboundSink`] and a writer task fed through a channel. Outbound jobs go
//! through one dispatcher task so frames to the same rank keep their order.
//! With `single_io_thread` the runtime is current-thread, otherwise two
//! workers share the connections.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpStream;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::constants::Rank;
use crate::error::{Code, MpiError, MpiResult};
use crate::net::bootstrap::PeerAddr;
use crate::net::codec::{Frame, MessageKind};
use crate::net::connection::{self, resolve, Connection, ConnectionId, PendingWrite};
use crate::net::socket_pool::SocketPool;
use crate::net::{Destination, InboundSink, Origin, Outbound, OutboundJob};

/// How long a graceful shutdown may spend flushing queued frames
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Transport settings taken from the runtime config
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub my_rank: Rank,
    pub pool_capacity: usize,
    pub single_io_thread: bool,
    /// Pin every pooled connection (full network startup)
    pub pin_connections: bool,
}

/// Bind the listening socket on an ephemeral port
pub fn bind_listener(host: &str) -> MpiResult<TcpListener> {
    let addr: SocketAddr = resolve(host, 0)?;
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| MpiError::new(Code::IoError, format!("Socket creation failed: {}", e)))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| MpiError::new(Code::IoError, format!("Failed to set SO_REUSEADDR: {}", e)))?;
    socket
        .bind(&addr.into())
        .map_err(|e| MpiError::new(Code::IoError, format!("Failed to bind {}: {}", addr, e)))?;
    socket
        .listen(128)
        .map_err(|e| MpiError::new(Code::IoError, format!("Failed to listen: {}", e)))?;
    Ok(socket.into())
}

#[derive(Debug, Clone, Copy)]
struct StopRequest {
    /// Close connections with a Goodbye so peers read a clean EOF
    goodbye: bool,
    deadline: Instant,
}

struct TransportShared {
    options: TransportOptions,
    roster: Vec<PeerAddr>,
    pool: Mutex<SocketPool<Arc<Connection>>>,
    pool_changed: Condvar,
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    writers: Mutex<HashMap<ConnectionId, JoinHandle<()>>>,
    sink: Arc<dyn InboundSink>,
    shutdown: AtomicBool,
    stop: Mutex<Option<StopRequest>>,
    stop_requested: Notify,
}

pub struct Transport {
    shared: Arc<TransportShared>,
    local_addr: SocketAddr,
    handle: Handle,
    jobs: Mutex<Option<mpsc::UnboundedSender<OutboundJob>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Transport {
    /// Start the I/O thread on an already bound listener
    pub fn start(
        listener: TcpListener,
        roster: Vec<PeerAddr>,
        options: TransportOptions,
        sink: Arc<dyn InboundSink>,
    ) -> MpiResult<Self> {
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let rank = options.my_rank;

        let runtime = build_runtime(&options)?;
        let listener = {
            let _context = runtime.enter();
            tokio::net::TcpListener::from_std(listener)?
        };
        let handle = runtime.handle().clone();
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(TransportShared {
            pool: Mutex::new(SocketPool::new(options.pool_capacity)),
            pool_changed: Condvar::new(),
            options,
            roster,
            connections: Mutex::new(HashMap::new()),
            writers: Mutex::new(HashMap::new()),
            sink,
            shutdown: AtomicBool::new(false),
            stop: Mutex::new(None),
            stop_requested: Notify::new(),
        });

        let s = shared.clone();
        let io_thread = thread::Builder::new()
            .name(format!("mpi-io-{}", rank))
            .spawn(move || {
                runtime.block_on(s.run(listener, jobs_rx));
                // Dropping the runtime cancels the readers and closes every socket
                drop(runtime);
            })?;
        log::debug!("transport started on {}", local_addr);

        Ok(Self {
            shared,
            local_addr,
            handle,
            jobs: Mutex::new(Some(jobs_tx)),
            thread: Mutex::new(Some(io_thread)),
        })
    }

    pub fn local_addr(&self) -> MpiResult<SocketAddr> {
        Ok(self.local_addr)
    }

    /// Dial `ranks` now and pin the connections
    pub fn connect_peers(&self, ranks: &[Rank]) -> MpiResult<()> {
        for &rank in ranks {
            self.handle.block_on(self.shared.checkout(rank, true, None))?;
        }
        Ok(())
    }

    /// Block until every rank in `ranks` has a pooled connection
    pub fn wait_for_peers(&self, ranks: &[Rank], timeout: Duration) -> MpiResult<()> {
        let deadline = Instant::now() + timeout;
        let mut pool = self.shared.pool.lock().unwrap();
        loop {
            let missing: Vec<Rank> = ranks.iter().copied().filter(|r| !pool.contains(*r)).collect();
            if missing.is_empty() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(MpiError::new(
                    Code::ConnectionBroken,
                    format!("ranks {:?} never connected", missing),
                ));
            }
            pool = self.shared.pool_changed.wait_timeout(pool, deadline - now).unwrap().0;
        }
    }

    /// Ranks with a pooled connection, in pool order
    pub fn pooled_ranks(&self) -> Vec<Rank> {
        self.shared.pool.lock().unwrap().ranks()
    }

    /// Flush the outbound queue, say Goodbye on every connection and stop
    pub fn shutdown(&self) {
        self.stop(true, SHUTDOWN_FLUSH_TIMEOUT);
    }

    /// Stop without Goodbyes after flushing for at most `flush`
    ///
    /// Peers see the connections drop as a failure of this rank.
    pub fn halt(&self, flush: Duration) {
        self.stop(false, flush);
    }

    fn stop(&self, goodbye: bool, flush: Duration) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.shared.stop.lock().unwrap() = Some(StopRequest {
            goodbye,
            deadline: Instant::now() + flush,
        });
        // Closing the queue lets the dispatcher finish once it is drained
        self.jobs.lock().unwrap().take();
        self.shared.stop_requested.notify_one();

        if let Some(io_thread) = self.thread.lock().unwrap().take() {
            if io_thread.join().is_err() {
                log::error!("transport thread panicked during shutdown");
            }
        }
        self.shared.pool.lock().unwrap().drain();
        self.shared.connections.lock().unwrap().clear();
        log::debug!("transport stopped");
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Outbound for Transport {
    fn enqueue(&self, job: OutboundJob) {
        let rejected = match self.jobs.lock().unwrap().as_ref() {
            Some(jobs) => jobs.send(job).err().map(|e| e.0),
            None => Some(job),
        };
        if let Some(OutboundJob {
            notify: Some(notify), ..
        }) = rejected
        {
            notify.sent(Err(MpiError::new(Code::Invalid, "transport is shut down")));
        }
    }
}

fn build_runtime(options: &TransportOptions) -> MpiResult<Runtime> {
    let mut builder = if options.single_io_thread {
        Builder::new_current_thread()
    } else {
        let mut builder = Builder::new_multi_thread();
        builder.worker_threads(2);
        builder
    };
    builder
        .enable_all()
        .thread_name(format!("mpi-io-{}", options.my_rank))
        .build()
        .map_err(|e| MpiError::new(Code::IoError, format!("Failed to build I/O runtime: {}", e)))
}

impl TransportShared {
    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn stop_request(&self) -> StopRequest {
        self.stop.lock().unwrap().unwrap_or(StopRequest {
            goodbye: false,
            deadline: Instant::now(),
        })
    }

    fn goodbye(&self) -> Frame {
        connection::goodbye(self.options.my_rank)
    }

    async fn run(self: Arc<Self>, listener: tokio::net::TcpListener, mut jobs: mpsc::UnboundedReceiver<OutboundJob>) {
        let accept = tokio::spawn(self.clone().accept_loop(listener));

        let dispatch = async {
            while let Some(job) = jobs.recv().await {
                self.route(job).await;
            }
        };
        tokio::select! {
            _ = dispatch => {}
            _ = self.stop_deadline() => log::warn!("outbound queue not drained before the shutdown deadline"),
        }
        accept.abort();
        self.close_connections().await;
    }

    async fn stop_deadline(&self) {
        self.stop_requested.notified().await;
        let deadline = self.stop_request().deadline;
        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
    }

    async fn close_connections(&self) {
        let stop = self.stop_request();
        let connections: Vec<Arc<Connection>> = self.connections.lock().unwrap().values().cloned().collect();
        for conn in &connections {
            conn.retire(stop.goodbye.then(|| self.goodbye()));
        }

        let writers: Vec<JoinHandle<()>> = self.writers.lock().unwrap().drain().map(|(_, w)| w).collect();
        let flushed = async {
            for writer in writers {
                let _ = writer.await;
            }
        };
        if tokio::time::timeout_at(tokio::time::Instant::from_std(stop.deadline), flushed)
            .await
            .is_err()
        {
            log::debug!("closing {} connection(s) with frames still queued", connections.len());
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: tokio::net::TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        log::warn!("could not set TCP_NODELAY on connection from {}: {}", addr, e);
                    }
                    let conn = self.attach(stream, None);
                    log::trace!("accepted connection {} from {}", conn.id(), addr);
                }
                Err(e) => {
                    log::error!("accept() on the listening socket failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    /// Register a stream and spawn its reader and writer
    fn attach(self: &Arc<Self>, stream: TcpStream, peer: Option<Rank>) -> Arc<Connection> {
        let (reader, writer) = stream.into_split();
        let (conn, commands) = Connection::new(peer);
        self.connections.lock().unwrap().insert(conn.id(), conn.clone());

        let s = self.clone();
        let c = conn.clone();
        let writer_task = tokio::spawn(async move {
            if let Err(e) = connection::write_frames(&c, writer, commands).await {
                s.connection_failed(&c, e);
            }
        });
        self.writers.lock().unwrap().insert(conn.id(), writer_task);

        let s = self.clone();
        let c = conn.clone();
        tokio::spawn(async move {
            let result = connection::read_frames(&c, reader, |frame| s.dispatch_frame(&c, frame)).await;
            let err = match result {
                Ok(()) => MpiError::new(
                    Code::ConnectionBroken,
                    format!("peer {:?} closed connection {} without a goodbye", c.peer(), c.id()),
                ),
                Err(e) => e,
            };
            s.connection_failed(&c, err);
            s.writers.lock().unwrap().remove(&c.id());
        });
        conn
    }

    fn dispatch_frame(&self, conn: &Arc<Connection>, frame: Frame) {
        match frame.kind {
            MessageKind::Hello => self.register_accepted(conn, frame.sender),
            MessageKind::Goodbye => self.peer_retired(conn),
            _ => self.sink.deliver(
                frame,
                Origin {
                    connection: Some(conn.id()),
                    peer: conn.peer(),
                },
            ),
        }
    }

    fn register_accepted(&self, conn: &Arc<Connection>, rank: Rank) {
        conn.set_peer(rank);
        let mut pool = self.pool.lock().unwrap();
        match pool.add_accepted(rank, conn.clone(), self.options.pin_connections) {
            Ok(Some((evicted_rank, evicted))) => {
                log::debug!("connection to rank {} evicted for rank {}", evicted_rank, rank);
                evicted.retire(Some(self.goodbye()));
            }
            Ok(None) => {}
            // The connection stays readable, it just is not cached
            Err(e) => log::warn!("accepted connection from rank {} not pooled: {}", rank, e),
        }
        self.pool_changed.notify_all();
    }

    /// The peer is closing this connection, answer in kind
    fn peer_retired(&self, conn: &Arc<Connection>) {
        conn.mark_peer_retired();
        if let Some(rank) = conn.peer() {
            let id = conn.id();
            self.pool.lock().unwrap().remove_if(rank, |c| c.id() == id);
        }
        conn.retire(Some(self.goodbye()));
        log::trace!("peer {:?} retired connection {}", conn.peer(), conn.id());
    }

    fn forget(&self, conn: &Arc<Connection>) {
        self.connections.lock().unwrap().remove(&conn.id());
        if let Some(rank) = conn.peer() {
            let id = conn.id();
            self.pool.lock().unwrap().remove_if(rank, |c| c.id() == id);
        }
    }

    /// Drop a connection that ended, reporting the peer unless the end was announced
    fn connection_failed(&self, conn: &Arc<Connection>, err: MpiError) {
        let expected = self.is_shutting_down() || conn.is_winding_down();
        self.forget(conn);
        conn.retire(None);

        if expected {
            log::trace!("connection {} to {:?} closed: {}", conn.id(), conn.peer(), err);
            return;
        }
        if !conn.mark_failed() {
            return;
        }
        match conn.peer() {
            Some(rank) => {
                log::error!("connection to rank {} failed: {}", rank, err);
                self.sink.peer_failed(rank, err);
            }
            // Control clients hang up without a goodbye
            None => log::debug!("unidentified connection {} closed: {}", conn.id(), err),
        }
    }

    /// Pooled connection for `rank`, dialling when needed
    ///
    /// The pool lock is not held across the dial. `write` is queued while the
    /// lock is held so an eviction cannot retire the connection between
    /// checkout and queueing. On failure the write is completed with the error.
    async fn checkout(self: &Arc<Self>, rank: Rank, pin: bool, write: Option<PendingWrite>) -> MpiResult<Arc<Connection>> {
        let pin = pin || self.options.pin_connections;
        let fail = |write: Option<PendingWrite>, err: MpiError| {
            if let Some(write) = write {
                write.fail(err.clone());
            }
            Err(err)
        };

        {
            let mut pool = self.pool.lock().unwrap();
            if let Some(conn) = pool.lookup(rank) {
                if pin {
                    pool.pin(rank);
                }
                if let Some(write) = write {
                    conn.queue_write(write);
                }
                return Ok(conn);
            }
            if let Err(e) = pool.check_room() {
                return fail(write, e);
            }
        }

        let addr = match self.roster.get(rank as usize) {
            Some(addr) => addr,
            None => return fail(write, MpiError::new(Code::InvalidRank, format!("no address for rank {}", rank))),
        };
        let stream = match connection::dial(&addr.host, addr.port, rank, self.options.my_rank).await {
            Ok(stream) => stream,
            Err(e) => return fail(write, e),
        };
        let fresh = self.attach(stream, Some(rank));

        let mut pool = self.pool.lock().unwrap();
        if let Some(existing) = pool.lookup(rank) {
            // Another task connected while we dialled
            fresh.retire(Some(self.goodbye()));
            if pin {
                pool.pin(rank);
            }
            if let Some(write) = write {
                existing.queue_write(write);
            }
            return Ok(existing);
        }
        match pool.insert(rank, fresh.clone(), pin) {
            Ok(evicted) => {
                if let Some((evicted_rank, evicted)) = evicted {
                    log::debug!("connection to rank {} evicted for rank {}", evicted_rank, rank);
                    evicted.retire(Some(self.goodbye()));
                }
                if let Some(write) = write {
                    fresh.queue_write(write);
                }
                self.pool_changed.notify_all();
                Ok(fresh)
            }
            Err(e) => {
                fresh.retire(Some(self.goodbye()));
                fail(write, e)
            }
        }
    }

    async fn route(self: &Arc<Self>, job: OutboundJob) {
        let OutboundJob { dest, frame, notify } = job;
        let write = PendingWrite::new(frame.to_bytes(), notify);
        match dest {
            Destination::Rank(rank) => {
                if let Err(e) = self.checkout(rank, false, Some(write)).await {
                    log::warn!("cannot send to rank {}: {}", rank, e);
                    if e.code() == Code::ConnectionBroken && !self.is_shutting_down() {
                        self.sink.peer_failed(rank, e);
                    }
                }
            }
            Destination::Connection(id) => {
                let conn = self.connections.lock().unwrap().get(&id).cloned();
                match conn {
                    Some(conn) => conn.queue_write(write),
                    None => write.fail(MpiError::new(
                        Code::ConnectionBroken,
                        format!("connection {} is gone", id),
                    )),
                }
            }
        }
    }
}

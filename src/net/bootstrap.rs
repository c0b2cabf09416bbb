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

//! Startup handshake with the launcher
//!
//! Each process dials the launcher, announces `(host, port, rank, token)` in
//! a `Bootstrap` frame and blocks until the launcher answers with the full
//! roster. [`Rendezvous`] is the launcher side of that exchange.

use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::constants::{Rank, WORLD_COMM_ID};
use crate::error::{Code, MpiError, MpiResult};
use crate::net::codec::{deserialize_payload, read_frame, serialize_payload, write_frame, Frame, MessageKind};

/// How long a process keeps retrying the launcher connection
const LAUNCHER_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const LAUNCHER_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Address of one process, ordered by world rank in the roster
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
    pub global_rank: Rank,
}

/// What a process tells the launcher about itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapHello {
    pub host: String,
    pub port: u16,
    pub rank: Rank,
    pub security_token: String,
}

fn connect_with_retry(host: &str, port: u16, timeout: Duration) -> MpiResult<TcpStream> {
    let deadline = Instant::now() + timeout;
    loop {
        match TcpStream::connect((host, port)) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) if Instant::now() < deadline => {
                log::trace!("launcher at {}:{} not reachable yet: {}", host, port, e);
                thread::sleep(LAUNCHER_RETRY_DELAY);
            }
            Err(e) => {
                return Err(MpiError::new(
                    Code::ConnectionBroken,
                    format!("could not reach launcher at {}:{}: {}", host, port, e),
                ))
            }
        }
    }
}

/// Announce ourselves to the launcher and receive the roster
pub fn handshake(launcher_host: &str, launcher_port: u16, hello: &BootstrapHello) -> MpiResult<Vec<PeerAddr>> {
    let mut stream = connect_with_retry(launcher_host, launcher_port, LAUNCHER_CONNECT_TIMEOUT)?;
    write_frame(
        &mut stream,
        &Frame::new(
            hello.rank,
            0,
            WORLD_COMM_ID,
            MessageKind::Bootstrap,
            serialize_payload(hello)?,
        ),
    )?;

    let frame = read_frame(&mut stream)?.ok_or_else(|| {
        MpiError::new(Code::ConnectionBroken, "launcher closed the connection before sending the roster")
    })?;
    if frame.kind != MessageKind::Bootstrap {
        return Err(MpiError::new(
            Code::ConnectionBroken,
            format!("expected a roster from the launcher, got {:?}", frame.kind),
        ));
    }

    let roster: Vec<PeerAddr> = deserialize_payload(&frame.payload)?;
    for (i, peer) in roster.iter().enumerate() {
        if peer.global_rank != i as Rank {
            return Err(MpiError::new(
                Code::InvalidRank,
                format!("roster entry {} carries rank {}", i, peer.global_rank),
            ));
        }
    }
    log::debug!("received roster of {} processes", roster.len());
    Ok(roster)
}

/// Launcher side of the handshake
///
/// Waits for `size` processes to check in, then sends each the roster sorted
/// by rank.
pub struct Rendezvous {
    listener: TcpListener,
    security_token: Option<String>,
}

impl Rendezvous {
    pub fn bind(host: &str, port: u16) -> MpiResult<Self> {
        let listener = TcpListener::bind((host, port))?;
        Ok(Self {
            listener,
            security_token: None,
        })
    }

    /// Reject processes announcing a different token
    pub fn with_security_token(mut self, token: &str) -> Self {
        self.security_token = Some(token.to_string());
        self
    }

    pub fn port(&self) -> MpiResult<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Collect `size` announcements and answer them
    pub fn serve(&self, size: usize) -> MpiResult<Vec<PeerAddr>> {
        let mut slots: Vec<Option<(PeerAddr, TcpStream)>> = (0..size).map(|_| None).collect();
        let mut joined = 0;

        while joined < size {
            let (mut stream, addr) = self.listener.accept()?;
            let frame = match read_frame(&mut stream)? {
                Some(frame) if frame.kind == MessageKind::Bootstrap => frame,
                other => {
                    log::warn!("ignoring non-bootstrap connection from {} ({:?})", addr, other.map(|f| f.kind));
                    continue;
                }
            };
            let hello: BootstrapHello = deserialize_payload(&frame.payload)?;

            if let Some(token) = &self.security_token {
                if &hello.security_token != token {
                    log::warn!("rank {} from {} presented a wrong security token", hello.rank, addr);
                    continue;
                }
            }
            if hello.rank < 0 || hello.rank as usize >= size {
                return Err(MpiError::new(
                    Code::InvalidRank,
                    format!("process at {} announced rank {} outside 0..{}", addr, hello.rank, size),
                ));
            }
            let slot = &mut slots[hello.rank as usize];
            if slot.is_some() {
                return Err(MpiError::new(
                    Code::InvalidRank,
                    format!("rank {} announced twice", hello.rank),
                ));
            }

            log::debug!("rank {} checked in from {}:{}", hello.rank, hello.host, hello.port);
            *slot = Some((
                PeerAddr {
                    host: hello.host,
                    port: hello.port,
                    global_rank: hello.rank,
                },
                stream,
            ));
            joined += 1;
        }

        let (roster, streams): (Vec<PeerAddr>, Vec<TcpStream>) = slots.into_iter().flatten().unzip();
        let payload = serialize_payload(&roster)?;
        for mut stream in streams {
            write_frame(
                &mut stream,
                &Frame::new(-1, 0, WORLD_COMM_ID, MessageKind::Bootstrap, payload.clone()),
            )?;
        }
        Ok(roster)
    }

    /// Serve on a background thread
    pub fn spawn(self, size: usize) -> JoinHandle<MpiResult<Vec<PeerAddr>>> {
        thread::spawn(move || self.serve(size))
    }
}

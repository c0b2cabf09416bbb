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

//! One TCP connection to a peer
//!
//! A connection is a pair of tasks on the transport runtime. The reader owns
//! the read half and a [`FrameDecoder`]; the writer owns the write half and
//! drains a command channel. [`Connection`] is the handle both the transport
//! and the pool share: it queues writes and asks the writer to retire.
//!
//! A connection closed on purpose ends with a Goodbye frame from the side
//! that closes it. An EOF that no Goodbye announced means the peer died.

use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::constants::{Rank, UNDEFINED, WORLD_COMM_ID};
use crate::error::{Code, MpiError, MpiResult};
use crate::net::codec::{Frame, FrameDecoder, MessageKind};

/// Timeout for establishing an outgoing connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Read chunk size
const READ_CHUNK: usize = 64 * 1024;

/// Frames written per flush
const WRITE_BATCH: usize = 64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub type ConnectionId = u64;

/// Callback attached to an outbound frame
pub trait SendNotify: Send {
    /// Checked before the first byte goes out, a cancelled frame is dropped
    fn is_cancelled(&self) -> bool {
        false
    }

    fn sent(self: Box<Self>, result: MpiResult<()>);
}

/// Encoded frame waiting for the writer
pub struct PendingWrite {
    bytes: Vec<u8>,
    notify: Option<Box<dyn SendNotify>>,
}

impl PendingWrite {
    pub fn new(bytes: Vec<u8>, notify: Option<Box<dyn SendNotify>>) -> Self {
        Self { bytes, notify }
    }

    fn is_cancelled(&self) -> bool {
        self.notify.as_ref().map_or(false, |n| n.is_cancelled())
    }

    fn finish(self, result: MpiResult<()>) {
        if let Some(notify) = self.notify {
            notify.sent(result);
        }
    }

    /// Complete the frame with an error without writing it
    pub fn fail(self, err: MpiError) {
        self.finish(Err(err));
    }
}

pub enum WriterCommand {
    Write(PendingWrite),
    /// Flush, optionally say Goodbye, then close the write half
    Retire(Option<Frame>),
}

pub struct Connection {
    id: ConnectionId,
    peer: AtomicI32,
    commands: mpsc::UnboundedSender<WriterCommand>,
    /// We asked the writer to close
    retiring: AtomicBool,
    /// The peer said Goodbye
    peer_retired: AtomicBool,
    failed: AtomicBool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer())
            .field("retiring", &self.is_retiring())
            .finish()
    }
}

impl Connection {
    /// New handle plus the receiving end its writer task drains
    ///
    /// `peer` is `None` for accepted connections until their Hello arrives.
    pub fn new(peer: Option<Rank>) -> (Arc<Self>, mpsc::UnboundedReceiver<WriterCommand>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer: AtomicI32::new(peer.unwrap_or(UNDEFINED)),
            commands,
            retiring: AtomicBool::new(false),
            peer_retired: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        });
        (conn, receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// World rank of the peer, once known
    pub fn peer(&self) -> Option<Rank> {
        match self.peer.load(Ordering::Acquire) {
            UNDEFINED => None,
            rank => Some(rank),
        }
    }

    pub fn set_peer(&self, rank: Rank) {
        self.peer.store(rank, Ordering::Release);
    }

    /// Hand a frame to the writer, failing it when the writer is gone
    pub fn queue_write(&self, write: PendingWrite) {
        if let Err(mpsc::error::SendError(WriterCommand::Write(write))) =
            self.commands.send(WriterCommand::Write(write))
        {
            write.fail(MpiError::new(
                Code::ConnectionBroken,
                format!("connection {} is closed", self.id),
            ));
        }
    }

    /// Close the write half after the queued frames, once
    ///
    /// Returns false when the connection was already retiring.
    pub fn retire(&self, goodbye: Option<Frame>) -> bool {
        if self.retiring.swap(true, Ordering::AcqRel) {
            return false;
        }
        // A writer that already exited has closed the half anyway
        let _ = self.commands.send(WriterCommand::Retire(goodbye));
        true
    }

    pub fn is_retiring(&self) -> bool {
        self.retiring.load(Ordering::Acquire)
    }

    pub fn mark_peer_retired(&self) {
        self.peer_retired.store(true, Ordering::Release);
    }

    /// Either side announced the close, so an EOF or a reset is expected
    pub fn is_winding_down(&self) -> bool {
        self.is_retiring() || self.peer_retired.load(Ordering::Acquire)
    }

    /// True the first time only
    pub fn mark_failed(&self) -> bool {
        !self.failed.swap(true, Ordering::AcqRel)
    }
}

/// The Goodbye frame `my_rank` sends before closing a connection
pub fn goodbye(my_rank: Rank) -> Frame {
    Frame::new(my_rank, 0, WORLD_COMM_ID, MessageKind::Goodbye, Vec::new())
}

/// Dial a peer and introduce ourselves with a Hello frame
pub async fn dial(host: &str, port: u16, peer: Rank, my_rank: Rank) -> MpiResult<TcpStream> {
    let addr = resolve(host, port)?;
    let broken = |e: std::io::Error| {
        MpiError::new(
            Code::ConnectionBroken,
            format!("could not connect to rank {} at {}: {}", peer, addr, e),
        )
    };

    let mut stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(connected) => connected.map_err(broken)?,
        Err(_) => {
            return Err(MpiError::new(
                Code::ConnectionBroken,
                format!("connecting to rank {} at {} timed out", peer, addr),
            ))
        }
    };
    stream.set_nodelay(true)?;
    let hello = Frame::new(my_rank, 0, WORLD_COMM_ID, MessageKind::Hello, Vec::new());
    stream.write_all(&hello.to_bytes()).await.map_err(broken)?;
    log::debug!("dialled rank {} at {}", peer, addr);
    Ok(stream)
}

/// Read frames until the peer closes its write half
///
/// Returns `Ok` for an EOF at a frame boundary. Whether that EOF was expected
/// is for the caller to decide.
pub async fn read_frames<F>(conn: &Connection, mut reader: OwnedReadHalf, mut on_frame: F) -> MpiResult<()>
where
    F: FnMut(Frame),
{
    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(MpiError::new(
                    Code::ConnectionBroken,
                    format!("read on connection {} failed: {}", conn.id(), e),
                ))
            }
        };
        if n == 0 {
            if decoder.is_idle() {
                return Ok(());
            }
            return Err(MpiError::new(
                Code::ConnectionBroken,
                format!(
                    "peer {:?} closed the connection inside a frame ({} bytes buffered)",
                    conn.peer(),
                    decoder.buffered()
                ),
            ));
        }

        decoder.push(&chunk[..n]);
        while let Some(frame) = decoder.next_frame()? {
            on_frame(frame);
        }
    }
}

/// Drain the command channel into the socket
///
/// Ends after a retire or when every handle is dropped. On a write error every
/// frame still queued is failed and the error is returned.
pub async fn write_frames(
    conn: &Connection,
    writer: OwnedWriteHalf,
    mut commands: mpsc::UnboundedReceiver<WriterCommand>,
) -> MpiResult<()> {
    let mut writer = BufWriter::new(writer);

    while let Some(first) = commands.recv().await {
        let mut batch = vec![first];
        while batch.len() < WRITE_BATCH {
            match commands.try_recv() {
                Ok(more) => batch.push(more),
                Err(_) => break,
            }
        }

        let mut written = Vec::new();
        let mut retire = None;
        let mut failure = None;
        for command in batch {
            if failure.is_some() || retire.is_some() {
                fail_command(conn, command);
                continue;
            }
            match command {
                WriterCommand::Write(write) if write.is_cancelled() => write.finish(Err(MpiError::Cancelled)),
                WriterCommand::Write(write) => match writer.write_all(&write.bytes).await {
                    Ok(()) => written.push(write),
                    Err(e) => {
                        write.fail(broken_write(conn, &e));
                        failure = Some(e);
                    }
                },
                WriterCommand::Retire(goodbye) => retire = Some(goodbye),
            }
        }

        if failure.is_none() {
            if let Some(Some(frame)) = &retire {
                if let Err(e) = writer.write_all(&frame.to_bytes()).await {
                    failure = Some(e);
                }
            }
        }
        if failure.is_none() {
            if let Err(e) = writer.flush().await {
                failure = Some(e);
            }
        }

        if let Some(e) = failure {
            let err = broken_write(conn, &e);
            for write in written {
                write.fail(err.clone());
            }
            commands.close();
            while let Ok(command) = commands.try_recv() {
                fail_command(conn, command);
            }
            return Err(err);
        }

        for write in written {
            write.finish(Ok(()));
        }

        if retire.is_some() {
            if let Err(e) = writer.shutdown().await {
                log::trace!("shutdown of connection {} write half: {}", conn.id(), e);
            }
            commands.close();
            while let Ok(command) = commands.try_recv() {
                fail_command(conn, command);
            }
            return Ok(());
        }
    }
    Ok(())
}

fn broken_write(conn: &Connection, e: &std::io::Error) -> MpiError {
    MpiError::new(
        Code::ConnectionBroken,
        format!("write to peer {:?} on connection {} failed: {}", conn.peer(), conn.id(), e),
    )
}

fn fail_command(conn: &Connection, command: WriterCommand) {
    if let WriterCommand::Write(write) = command {
        write.fail(MpiError::new(
            Code::ConnectionBroken,
            format!("connection {} closed before the frame was written", conn.id()),
        ));
    }
}

pub fn resolve(host: &str, port: u16) -> MpiResult<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| MpiError::new(Code::IoError, format!("could not resolve {}:{}", host, port)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Record(Arc<Mutex<Vec<Code>>>);

    impl SendNotify for Record {
        fn sent(self: Box<Self>, result: MpiResult<()>) {
            self.0.lock().unwrap().push(result.err().map_or(Code::Ok, |e| e.code()));
        }
    }

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn retire_sends_goodbye_after_queued_frames() {
        let (ours, theirs) = pair().await;
        let (conn, commands) = Connection::new(Some(1));
        let (_, writer) = ours.into_split();
        let results = Arc::new(Mutex::new(Vec::new()));

        let frame = Frame::new(0, 4, WORLD_COMM_ID, MessageKind::User, vec![1, 2, 3]);
        conn.queue_write(PendingWrite::new(frame.to_bytes(), Some(Box::new(Record(results.clone())))));
        assert!(conn.retire(Some(goodbye(0))));
        assert!(!conn.retire(Some(goodbye(0))));
        conn.queue_write(PendingWrite::new(frame.to_bytes(), Some(Box::new(Record(results.clone())))));
        write_frames(&conn, writer, commands).await.unwrap();

        let (reader, _) = theirs.into_split();
        let (remote, _) = Connection::new(Some(0));
        let mut kinds = Vec::new();
        read_frames(&remote, reader, |f| kinds.push(f.kind)).await.unwrap();

        assert_eq!(kinds, vec![MessageKind::User, MessageKind::Goodbye]);
        // The frame queued after the retire never reaches the wire
        let results = results.lock().unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.contains(&Code::Ok));
        assert!(results.contains(&Code::ConnectionBroken));
    }

    #[tokio::test]
    async fn eof_inside_a_frame_is_broken() {
        let (mut ours, theirs) = pair().await;
        let bytes = Frame::new(0, 1, WORLD_COMM_ID, MessageKind::User, vec![0; 32]).to_bytes();
        ours.write_all(&bytes[..20]).await.unwrap();
        ours.shutdown().await.unwrap();

        let (reader, _) = theirs.into_split();
        let (conn, _) = Connection::new(Some(0));
        let err = read_frames(&conn, reader, |_| {}).await.unwrap_err();
        assert_eq!(err.code(), Code::ConnectionBroken);
    }
}

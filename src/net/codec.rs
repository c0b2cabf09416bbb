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

//! Wire format
//!
//! Every message on a connection is one frame: a 40 byte header made of five
//! big-endian `i64` fields followed by the payload.
//!
//! ```text
//! +-------------+-----+----------------+---------+--------------+---------+
//! | sender_rank | tag | payload_length | comm_id | message_kind | payload |
//! +-------------+-----+----------------+---------+--------------+---------+
//! ```
//!
//! Payloads are bincode encoded. The functions here never touch sockets
//! directly; blocking readers and writers are generic over `Read`/`Write`
//! and the non-blocking transport feeds bytes through [`FrameDecoder`].

use std::io::{ErrorKind, Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::constants::{CommId, Rank, Tag};
use crate::error::{Code, MpiError, MpiResult};

/// Number of bytes in an encoded header
pub const HEADER_LEN: usize = 40;

/// Upper bound on a single payload (1 GiB)
pub const MAX_PAYLOAD_LEN: usize = 1 << 30;

/// What a frame carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Ordinary data, including internal tags such as collectives and ACKs
    User = 0,
    /// Data from a synchronous send, the receiver answers with an ACK
    SyncUser = 1,
    /// First frame on a dialled connection, carries the dialler's world rank
    Hello = 2,
    /// Launcher handshake
    Bootstrap = 3,
    Abort = 4,
    Config = 5,
    Ping = 6,
    Pong = 7,
    ReadRegister = 8,
    RegisterReply = 9,
    ConfigReply = 10,
    /// The sender is closing this connection on purpose; an EOF after it is
    /// not a failure
    Goodbye = 11,
}

impl MessageKind {
    pub fn from_i64(value: i64) -> MpiResult<Self> {
        let kind = match value {
            0 => MessageKind::User,
            1 => MessageKind::SyncUser,
            2 => MessageKind::Hello,
            3 => MessageKind::Bootstrap,
            4 => MessageKind::Abort,
            5 => MessageKind::Config,
            6 => MessageKind::Ping,
            7 => MessageKind::Pong,
            8 => MessageKind::ReadRegister,
            9 => MessageKind::RegisterReply,
            10 => MessageKind::ConfigReply,
            11 => MessageKind::Goodbye,
            other => {
                return Err(MpiError::new(
                    Code::ConnectionBroken,
                    format!("unknown message kind {} in frame header", other),
                ))
            }
        };
        Ok(kind)
    }

    /// Control channel commands handled outside point-to-point matching
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            MessageKind::Abort | MessageKind::Config | MessageKind::Ping | MessageKind::ReadRegister
        )
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub sender: Rank,
    pub tag: Tag,
    pub payload_len: usize,
    pub comm_id: CommId,
    pub kind: MessageKind,
}

/// A complete frame, header fields plus raw payload bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sender: Rank,
    pub tag: Tag,
    pub comm_id: CommId,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(sender: Rank, tag: Tag, comm_id: CommId, kind: MessageKind, payload: Vec<u8>) -> Self {
        Self {
            sender,
            tag,
            comm_id,
            kind,
            payload,
        }
    }

    pub fn header(&self) -> Header {
        Header {
            sender: self.sender,
            tag: self.tag,
            payload_len: self.payload.len(),
            comm_id: self.comm_id,
            kind: self.kind,
        }
    }

    /// Header and payload as one contiguous buffer
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.payload.len());
        bytes.extend_from_slice(&encode_header(&self.header()));
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

pub fn encode_header(header: &Header) -> [u8; HEADER_LEN] {
    let fields = [
        header.sender as i64,
        header.tag as i64,
        header.payload_len as i64,
        header.comm_id,
        header.kind as i64,
    ];
    let mut out = [0u8; HEADER_LEN];
    for (i, field) in fields.iter().enumerate() {
        out[i * 8..(i + 1) * 8].copy_from_slice(&field.to_be_bytes());
    }
    out
}

pub fn decode_header(bytes: &[u8; HEADER_LEN]) -> MpiResult<Header> {
    let mut fields = [0i64; 5];
    for (i, field) in fields.iter_mut().enumerate() {
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
        *field = i64::from_be_bytes(word);
    }

    if fields[2] < 0 || fields[2] as usize > MAX_PAYLOAD_LEN {
        return Err(MpiError::new(
            Code::ConnectionBroken,
            format!("frame announces an invalid payload length {}", fields[2]),
        ));
    }

    Ok(Header {
        sender: narrow(fields[0], "sender rank")?,
        tag: narrow(fields[1], "tag")?,
        payload_len: fields[2] as usize,
        comm_id: fields[3],
        kind: MessageKind::from_i64(fields[4])?,
    })
}

/// Header fields travel as i64, ranks and tags are i32 in memory
fn narrow(value: i64, field: &str) -> MpiResult<i32> {
    i32::try_from(value).map_err(|_| {
        MpiError::new(
            Code::ConnectionBroken,
            format!("frame header {} {} is out of range", field, value),
        )
    })
}

/// Serialize a payload with bincode
pub fn serialize_payload<T: Serialize + ?Sized>(value: &T) -> MpiResult<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub fn deserialize_payload<T: DeserializeOwned>(bytes: &[u8]) -> MpiResult<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Write one frame as a single unit
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> MpiResult<()> {
    writer.write_all(&frame.to_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Fill `buf` completely, looping on partial reads
///
/// Returns `Ok(false)` when the stream was already at EOF before the first
/// byte, and `ConnectionBroken` when it ends part way through.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> MpiResult<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(MpiError::new(
                    Code::ConnectionBroken,
                    format!("connection closed after {} of {} bytes", filled, buf.len()),
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

/// Blocking read of one frame
///
/// `Ok(None)` means the peer closed the connection exactly at a frame
/// boundary. A close anywhere inside a frame is `ConnectionBroken`.
pub fn read_frame<R: Read>(reader: &mut R) -> MpiResult<Option<Frame>> {
    let mut raw = [0u8; HEADER_LEN];
    if !read_full(reader, &mut raw)? {
        return Ok(None);
    }
    let header = decode_header(&raw)?;

    let mut payload = vec![0u8; header.payload_len];
    if header.payload_len > 0 && !read_full(reader, &mut payload)? {
        return Err(MpiError::new(
            Code::ConnectionBroken,
            "connection closed between header and payload",
        ));
    }

    Ok(Some(Frame {
        sender: header.sender,
        tag: header.tag,
        comm_id: header.comm_id,
        kind: header.kind,
        payload,
    }))
}

/// Incremental decoder for non-blocking connections
///
/// Bytes are pushed as they arrive and complete frames are pulled out.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    header: Option<Header>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// True when no partial frame is buffered
    pub fn is_idle(&self) -> bool {
        self.buffer.is_empty() && self.header.is_none()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pull the next complete frame, if one is buffered
    pub fn next_frame(&mut self) -> MpiResult<Option<Frame>> {
        if self.header.is_none() {
            if self.buffer.len() < HEADER_LEN {
                return Ok(None);
            }
            let mut raw = [0u8; HEADER_LEN];
            raw.copy_from_slice(&self.buffer[..HEADER_LEN]);
            self.header = Some(decode_header(&raw)?);
            self.buffer.drain(..HEADER_LEN);
        }

        let header = match self.header {
            Some(header) => header,
            None => return Ok(None),
        };
        if self.buffer.len() < header.payload_len {
            return Ok(None);
        }

        let rest = self.buffer.split_off(header.payload_len);
        let payload = std::mem::replace(&mut self.buffer, rest);
        self.header = None;

        Ok(Some(Frame {
            sender: header.sender,
            tag: header.tag,
            comm_id: header.comm_id,
            kind: header.kind,
            payload,
        }))
    }
}

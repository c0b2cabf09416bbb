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

//! Control commands accepted on the main listening socket
//!
//! `Ping` and `ReadRegister` are read-only. `Abort` and `Config` change the
//! running process; when they come from a connection that never introduced
//! itself as a member they must carry the job's security token.
//!
//! [`ControlClient`] is the tool side: it dials a rank's listening socket
//! and issues commands as a non-member.

use std::collections::BTreeMap;
use std::net::TcpStream;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::CollectiveSettings;
use crate::constants::{Rank, WORLD_COMM_ID};
use crate::error::{Code, MpiError, MpiResult};
use crate::net::codec::{deserialize_payload, read_frame, serialize_payload, write_frame, Frame, MessageKind};
use crate::net::connection::resolve;
use crate::net::{Destination, Origin};

/// Exit code used when an `Abort` carries none
pub const DEFAULT_ABORT_CODE: i32 = 1;

/// Payload of every control request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlPayload {
    pub security_token: Option<String>,
    /// JSON text, meaning depends on the command
    pub data: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SystemCommand {
    Ping,
    ReadRegister,
    Config(serde_json::Map<String, serde_json::Value>),
    Abort(i32),
}

impl SystemCommand {
    pub fn is_read_only(&self) -> bool {
        matches!(self, SystemCommand::Ping | SystemCommand::ReadRegister)
    }
}

/// A decoded command and where its reply goes
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub command: SystemCommand,
    pub reply_to: Option<Destination>,
}

/// Decode a control frame, `Ok(None)` for frames that need no action
pub fn decode_command(frame: &Frame, origin: &Origin, security_token: &str) -> MpiResult<Option<PendingCommand>> {
    let payload: ControlPayload = if frame.payload.is_empty() {
        ControlPayload::default()
    } else {
        deserialize_payload(&frame.payload)?
    };

    let command = match frame.kind {
        MessageKind::Ping => SystemCommand::Ping,
        MessageKind::ReadRegister => SystemCommand::ReadRegister,
        MessageKind::Config => {
            let data = payload.data.as_deref().unwrap_or("{}");
            match serde_json::from_str::<serde_json::Value>(data)? {
                serde_json::Value::Object(map) => SystemCommand::Config(map),
                other => {
                    return Err(MpiError::new(
                        Code::ConfigError,
                        format!("config command expects a JSON object, got {}", other),
                    ))
                }
            }
        }
        MessageKind::Abort => {
            let code = match payload.data.as_deref() {
                Some(text) => serde_json::from_str::<i32>(text)?,
                None => DEFAULT_ABORT_CODE,
            };
            SystemCommand::Abort(code)
        }
        _ => return Ok(None),
    };

    let member = frame.sender >= 0 && origin.peer.is_some();
    if !command.is_read_only() && !member && payload.security_token.as_deref() != Some(security_token) {
        return Err(MpiError::new(
            Code::Invalid,
            format!("{:?} from a non-member without a valid security token", frame.kind),
        ));
    }

    let reply_to = match (origin.connection, origin.peer) {
        (Some(connection), _) => Some(Destination::Connection(connection)),
        (None, Some(peer)) => Some(Destination::Rank(peer)),
        (None, None) => None,
    };
    Ok(Some(PendingCommand { command, reply_to }))
}

/// Reply frame for a Ping
pub fn pong(my_rank: Rank) -> MpiResult<Frame> {
    Ok(Frame::new(
        my_rank,
        0,
        WORLD_COMM_ID,
        MessageKind::Pong,
        serialize_payload("PONG")?,
    ))
}

/// Reply frame carrying the whole user register as JSON
pub fn register_reply(my_rank: Rank, register: &BTreeMap<String, serde_json::Value>) -> MpiResult<Frame> {
    let json = serde_json::to_string(register)?;
    Ok(Frame::new(
        my_rank,
        0,
        WORLD_COMM_ID,
        MessageKind::RegisterReply,
        serialize_payload(&json)?,
    ))
}

/// Apply every key of a Config command, collecting one result per key
pub fn apply_config(
    settings: &mut CollectiveSettings,
    changes: &serde_json::Map<String, serde_json::Value>,
) -> BTreeMap<String, String> {
    changes
        .iter()
        .map(|(name, value)| {
            let outcome = match settings.apply(name, value) {
                Ok(true) => "changed".to_string(),
                Ok(false) => "unchanged".to_string(),
                Err(e) => e.to_string(),
            };
            (name.clone(), outcome)
        })
        .collect()
}

pub fn config_reply(my_rank: Rank, results: &BTreeMap<String, String>) -> MpiResult<Frame> {
    let json = serde_json::to_string(results)?;
    Ok(Frame::new(
        my_rank,
        0,
        WORLD_COMM_ID,
        MessageKind::ConfigReply,
        serialize_payload(&json)?,
    ))
}

/// Issues control commands to one rank as a non-member
pub struct ControlClient {
    stream: TcpStream,
}

impl ControlClient {
    pub fn connect(host: &str, port: u16) -> MpiResult<Self> {
        let addr = resolve(host, port)?;
        let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(10))?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) -> MpiResult<()> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    fn send(&mut self, kind: MessageKind, payload: &ControlPayload) -> MpiResult<()> {
        let frame = Frame::new(-1, 0, WORLD_COMM_ID, kind, serialize_payload(payload)?);
        write_frame(&mut self.stream, &frame)
    }

    fn reply(&mut self, expected: MessageKind) -> MpiResult<Frame> {
        let frame = read_frame(&mut self.stream)?
            .ok_or_else(|| MpiError::new(Code::ConnectionBroken, "rank closed the control connection"))?;
        if frame.kind != expected {
            return Err(MpiError::new(
                Code::Invalid,
                format!("expected {:?}, got {:?}", expected, frame.kind),
            ));
        }
        Ok(frame)
    }

    /// Returns the world rank that answered
    pub fn ping(&mut self) -> MpiResult<Rank> {
        self.send(MessageKind::Ping, &ControlPayload::default())?;
        Ok(self.reply(MessageKind::Pong)?.sender)
    }

    pub fn read_register(&mut self) -> MpiResult<serde_json::Value> {
        self.send(MessageKind::ReadRegister, &ControlPayload::default())?;
        let json: String = deserialize_payload(&self.reply(MessageKind::RegisterReply)?.payload)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Change collective settings, returns the per-key outcome
    pub fn configure(&mut self, token: &str, settings: &serde_json::Value) -> MpiResult<BTreeMap<String, String>> {
        let payload = ControlPayload {
            security_token: Some(token.to_string()),
            data: Some(settings.to_string()),
        };
        self.send(MessageKind::Config, &payload)?;
        let json: String = deserialize_payload(&self.reply(MessageKind::ConfigReply)?.payload)?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn abort(&mut self, token: &str, code: i32) -> MpiResult<()> {
        let payload = ControlPayload {
            security_token: Some(token.to_string()),
            data: Some(code.to_string()),
        };
        self.send(MessageKind::Abort, &payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(kind: MessageKind, sender: Rank, payload: &ControlPayload) -> Frame {
        Frame::new(sender, 0, WORLD_COMM_ID, kind, serialize_payload(payload).unwrap())
    }

    #[test]
    fn write_commands_from_outsiders_need_the_token() {
        let outsider = Origin {
            connection: Some(9),
            peer: None,
        };
        let bare = ControlPayload::default();
        assert!(decode_command(&frame(MessageKind::Abort, -1, &bare), &outsider, "secret").is_err());
        assert!(decode_command(&frame(MessageKind::Ping, -1, &bare), &outsider, "secret")
            .unwrap()
            .is_some());

        let signed = ControlPayload {
            security_token: Some("secret".into()),
            data: Some("3".into()),
        };
        let pending = decode_command(&frame(MessageKind::Abort, -1, &signed), &outsider, "secret")
            .unwrap()
            .unwrap();
        assert_eq!(pending.command, SystemCommand::Abort(3));
        assert_eq!(pending.reply_to, Some(Destination::Connection(9)));
    }

    #[test]
    fn members_may_abort_without_token() {
        let member = Origin {
            connection: None,
            peer: Some(2),
        };
        let pending = decode_command(&frame(MessageKind::Abort, 2, &ControlPayload::default()), &member, "secret")
            .unwrap()
            .unwrap();
        assert_eq!(pending.command, SystemCommand::Abort(DEFAULT_ABORT_CODE));
    }

    #[test]
    fn config_results_per_key() {
        let mut settings = CollectiveSettings::default();
        let changes = serde_json::json!({"flat_tree_max": 3, "static_fanout": 2, "bogus": 1});
        let results = apply_config(&mut settings, changes.as_object().unwrap());
        assert_eq!(results["flat_tree_max"], "changed");
        assert_eq!(results["static_fanout"], "unchanged");
        assert!(results["bogus"].contains("unknown setting"));
        assert_eq!(settings.flat_tree_max, 3);
    }
}

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

//! Error handling for message passing operations
//!
//! Every failure is reported synchronously to the calling operation. Nothing
//! here is retried automatically; callers re-issue the operation if they want
//! to.

use std::fmt;

/// Error codes, one per failure class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Ok = 0,
    InvalidRank = 1,
    InvalidTag = 2,
    GroupNotSubset = 3,
    NoIdAvailable = 4,
    ConnectionBroken = 5,
    PoolCapacityExceeded = 6,
    CollectiveAborted = 7,
    IoError = 8,
    SerializationError = 9,
    Invalid = 10,
    Cancelled = 11,
    ConfigError = 12,
    UnknownError = 99,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Code::Ok => write!(f, "OK"),
            Code::InvalidRank => write!(f, "Invalid rank"),
            Code::InvalidTag => write!(f, "Invalid tag"),
            Code::GroupNotSubset => write!(f, "Group not subset"),
            Code::NoIdAvailable => write!(f, "No communicator id available"),
            Code::ConnectionBroken => write!(f, "Connection broken"),
            Code::PoolCapacityExceeded => write!(f, "Socket pool capacity exceeded"),
            Code::CollectiveAborted => write!(f, "Collective aborted"),
            Code::IoError => write!(f, "IO error"),
            Code::SerializationError => write!(f, "Serialization error"),
            Code::Invalid => write!(f, "Invalid"),
            Code::Cancelled => write!(f, "Cancelled"),
            Code::ConfigError => write!(f, "Configuration error"),
            Code::UnknownError => write!(f, "Unknown error"),
        }
    }
}

/// Main error type
#[derive(thiserror::Error, Debug, Clone)]
pub enum MpiError {
    #[error("Invalid rank: {0}")]
    InvalidRank(String),

    #[error("Invalid tag: {0}")]
    InvalidTag(String),

    #[error("Group is not a subset of the communicator group: {0}")]
    GroupNotSubset(String),

    #[error("No new communicator id available: {0}")]
    NoIdAvailable(String),

    #[error("Connection broken: {0}")]
    ConnectionBroken(String),

    #[error("Socket pool capacity exceeded: {0}")]
    PoolCapacityExceeded(String),

    #[error("Collective aborted: {0}")]
    CollectiveAborted(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid operation: {0}")]
    Invalid(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Generic error with code {code}: {message}")]
    Generic { code: Code, message: String },
}

impl MpiError {
    /// Create a new error with a specific code and message
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            Code::InvalidRank => MpiError::InvalidRank(message),
            Code::InvalidTag => MpiError::InvalidTag(message),
            Code::GroupNotSubset => MpiError::GroupNotSubset(message),
            Code::NoIdAvailable => MpiError::NoIdAvailable(message),
            Code::ConnectionBroken => MpiError::ConnectionBroken(message),
            Code::PoolCapacityExceeded => MpiError::PoolCapacityExceeded(message),
            Code::CollectiveAborted => MpiError::CollectiveAborted(message),
            Code::IoError => MpiError::Io(message),
            Code::SerializationError => MpiError::Serialization(message),
            Code::Invalid => MpiError::Invalid(message),
            Code::ConfigError => MpiError::Config(message),
            code => MpiError::Generic { code, message },
        }
    }

    /// Get the error code
    pub fn code(&self) -> Code {
        match self {
            MpiError::InvalidRank(_) => Code::InvalidRank,
            MpiError::InvalidTag(_) => Code::InvalidTag,
            MpiError::GroupNotSubset(_) => Code::GroupNotSubset,
            MpiError::NoIdAvailable(_) => Code::NoIdAvailable,
            MpiError::ConnectionBroken(_) => Code::ConnectionBroken,
            MpiError::PoolCapacityExceeded(_) => Code::PoolCapacityExceeded,
            MpiError::CollectiveAborted(_) => Code::CollectiveAborted,
            MpiError::Io(_) => Code::IoError,
            MpiError::Serialization(_) => Code::SerializationError,
            MpiError::Invalid(_) => Code::Invalid,
            MpiError::Cancelled => Code::Cancelled,
            MpiError::Config(_) => Code::ConfigError,
            MpiError::Generic { code, .. } => *code,
        }
    }

    /// True for transport-level failures that end the connection
    pub fn is_fatal(&self) -> bool {
        matches!(self, MpiError::ConnectionBroken(_) | MpiError::CollectiveAborted(_))
    }
}

impl From<std::io::Error> for MpiError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => MpiError::ConnectionBroken(err.to_string()),
            _ => MpiError::Io(err.to_string()),
        }
    }
}

impl From<bincode::Error> for MpiError {
    fn from(err: bincode::Error) -> Self {
        MpiError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for MpiError {
    fn from(err: serde_json::Error) -> Self {
        MpiError::Config(err.to_string())
    }
}

/// Type alias for Results using MpiError
pub type MpiResult<T> = Result<T, MpiError>;

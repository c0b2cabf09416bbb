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

//! Construction-time configuration
//!
//! The launcher (or whatever parses the command line) builds an [`MpiConfig`]
//! and hands it to [`crate::Mpi::init`]. The runtime never parses arguments
//! itself and treats the config as immutable, except for the collective
//! thresholds which may be changed at runtime through the control channel.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::constants::Rank;
use crate::error::{Code, MpiError, MpiResult};

/// Where log lines go
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogTarget {
    Stderr,
    Stdout,
    File(PathBuf),
}

impl Default for LogTarget {
    fn default() -> Self {
        LogTarget::Stderr
    }
}

/// Size thresholds used to pick a collective algorithm
///
/// A flat tree is used for communicators of up to `flat_tree_max` members, a
/// binomial tree up to `binomial_tree_max` and a static fanout tree beyond
/// that. `force_binomial` routes every tree collective through the binomial
/// tree regardless of size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectiveSettings {
    pub force_binomial: bool,
    pub flat_tree_max: usize,
    pub binomial_tree_max: usize,
    pub static_fanout: usize,
    /// Use the dissemination algorithm for allgather instead of the naive exchange
    pub dissemination_allgather: bool,
}

impl Default for CollectiveSettings {
    fn default() -> Self {
        Self {
            force_binomial: false,
            flat_tree_max: 10,
            binomial_tree_max: 50,
            static_fanout: 2,
            dissemination_allgather: true,
        }
    }
}

impl CollectiveSettings {
    /// Apply one `name = value` setting and return whether it changed
    pub fn apply(&mut self, name: &str, value: &serde_json::Value) -> MpiResult<bool> {
        fn as_usize(name: &str, value: &serde_json::Value) -> MpiResult<usize> {
            value
                .as_u64()
                .map(|v| v as usize)
                .ok_or_else(|| MpiError::new(Code::ConfigError, format!("{} expects an unsigned integer", name)))
        }
        fn as_bool(name: &str, value: &serde_json::Value) -> MpiResult<bool> {
            value
                .as_bool()
                .ok_or_else(|| MpiError::new(Code::ConfigError, format!("{} expects a boolean", name)))
        }

        let before = self.clone();
        match name {
            "force_binomial" => self.force_binomial = as_bool(name, value)?,
            "flat_tree_max" => self.flat_tree_max = as_usize(name, value)?,
            "binomial_tree_max" => self.binomial_tree_max = as_usize(name, value)?,
            "static_fanout" => {
                let fanout = as_usize(name, value)?;
                if fanout == 0 {
                    return Err(MpiError::new(Code::ConfigError, "static_fanout must be at least 1"));
                }
                self.static_fanout = fanout;
            }
            "dissemination_allgather" => self.dissemination_allgather = as_bool(name, value)?,
            other => {
                return Err(MpiError::new(Code::ConfigError, format!("unknown setting '{}'", other)));
            }
        }
        Ok(before != *self)
    }
}

/// Runtime configuration for one process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpiConfig {
    rank: Rank,
    size: usize,
    launcher_host: String,
    launcher_port: u16,
    bind_host: String,
    socket_pool_size: usize,
    single_io_thread: bool,
    full_network_startup: bool,
    verbosity: u8,
    log_target: LogTarget,
    security_token: String,
    collective: CollectiveSettings,
}

impl MpiConfig {
    pub fn builder() -> MpiConfigBuilder {
        MpiConfigBuilder::new()
    }

    /// Parse a config shipped by the launcher as JSON
    pub fn from_json(json: &str) -> MpiResult<Self> {
        let config: MpiConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> MpiResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn validate(&self) -> MpiResult<()> {
        if self.size == 0 {
            return Err(MpiError::new(Code::ConfigError, "size must be at least 1"));
        }
        if self.rank < 0 || self.rank as usize >= self.size {
            return Err(MpiError::new(
                Code::ConfigError,
                format!("rank {} outside 0..{}", self.rank, self.size),
            ));
        }
        if self.socket_pool_size == 0 {
            return Err(MpiError::new(Code::ConfigError, "socket_pool_size must be at least 1"));
        }
        Ok(())
    }

    pub fn get_rank(&self) -> Rank {
        self.rank
    }

    pub fn get_size(&self) -> usize {
        self.size
    }

    pub fn get_launcher_host(&self) -> &str {
        &self.launcher_host
    }

    pub fn get_launcher_port(&self) -> u16 {
        self.launcher_port
    }

    pub fn get_bind_host(&self) -> &str {
        &self.bind_host
    }

    /// Pool capacity actually used: a full network startup needs room for every peer
    pub fn effective_pool_size(&self) -> usize {
        if self.full_network_startup {
            self.socket_pool_size.max(self.size + 1)
        } else {
            self.socket_pool_size
        }
    }

    pub fn get_socket_pool_size(&self) -> usize {
        self.socket_pool_size
    }

    pub fn is_single_io_thread(&self) -> bool {
        self.single_io_thread
    }

    pub fn is_full_network_startup(&self) -> bool {
        self.full_network_startup
    }

    pub fn get_verbosity(&self) -> u8 {
        self.verbosity
    }

    pub fn get_log_target(&self) -> &LogTarget {
        &self.log_target
    }

    pub fn get_security_token(&self) -> &str {
        &self.security_token
    }

    pub fn get_collective_settings(&self) -> &CollectiveSettings {
        &self.collective
    }
}

/// Builder for MpiConfig with sensible defaults
#[derive(Debug, Clone)]
pub struct MpiConfigBuilder {
    rank: Rank,
    size: usize,
    launcher_host: String,
    launcher_port: u16,
    bind_host: String,
    socket_pool_size: usize,
    single_io_thread: bool,
    full_network_startup: bool,
    verbosity: u8,
    log_target: LogTarget,
    security_token: Option<String>,
    collective: CollectiveSettings,
}

impl Default for MpiConfigBuilder {
    fn default() -> Self {
        Self {
            rank: 0,
            size: 1,
            launcher_host: "localhost".to_string(),
            launcher_port: 14000,
            bind_host: "127.0.0.1".to_string(),
            socket_pool_size: 20,
            single_io_thread: false,
            full_network_startup: false,
            verbosity: 1,
            log_target: LogTarget::Stderr,
            security_token: None,
            collective: CollectiveSettings::default(),
        }
    }
}

impl MpiConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the rank of this process (required)
    pub fn rank(mut self, rank: Rank) -> Self {
        self.rank = rank;
        self
    }

    /// Set the total number of processes (required)
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Address of the launcher that hands out the roster
    pub fn launcher(mut self, host: &str, port: u16) -> Self {
        self.launcher_host = host.to_string();
        self.launcher_port = port;
        self
    }

    /// Interface the listening socket binds to (default: "127.0.0.1")
    pub fn bind_host(mut self, host: &str) -> Self {
        self.bind_host = host.to_string();
        self
    }

    pub fn socket_pool_size(mut self, size: usize) -> Self {
        self.socket_pool_size = size;
        self
    }

    /// Run inbound and outbound socket work on one thread
    pub fn single_io_thread(mut self, single: bool) -> Self {
        self.single_io_thread = single;
        self
    }

    /// Pre-connect to every peer during init and pin those connections
    pub fn full_network_startup(mut self, enabled: bool) -> Self {
        self.full_network_startup = enabled;
        self
    }

    /// 0 = warnings only, 1 = info, 2 = debug, 3+ = trace
    pub fn verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn log_target(mut self, target: LogTarget) -> Self {
        self.log_target = target;
        self
    }

    /// Token required on write commands arriving on the control channel
    pub fn security_token(mut self, token: &str) -> Self {
        self.security_token = Some(token.to_string());
        self
    }

    pub fn collective_settings(mut self, settings: CollectiveSettings) -> Self {
        self.collective = settings;
        self
    }

    pub fn build(self) -> MpiResult<MpiConfig> {
        let config = MpiConfig {
            rank: self.rank,
            size: self.size,
            launcher_host: self.launcher_host,
            launcher_port: self.launcher_port,
            bind_host: self.bind_host,
            socket_pool_size: self.socket_pool_size,
            single_io_thread: self.single_io_thread,
            full_network_startup: self.full_network_startup,
            verbosity: self.verbosity,
            log_target: self.log_target,
            security_token: self
                .security_token
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            collective: self.collective,
        };
        config.validate()?;
        Ok(config)
    }
}

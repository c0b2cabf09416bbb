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

//! Logging utilities
//!
//! All modules log through the `log` facade. The backend is env_logger,
//! configured from [`MpiConfig`]: `RUST_LOG` wins when set, otherwise the
//! verbosity picks the level. Every line carries the world rank.

use std::fs::OpenOptions;
use std::io::Write;

use crate::config::{LogTarget, MpiConfig};
use crate::error::MpiResult;

/// Map the configured verbosity onto a level filter
pub fn level_for_verbosity(verbosity: u8) -> log::LevelFilter {
    match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

/// Initialize logging for one process
///
/// Only the first call in a process installs a logger, later calls (several
/// ranks hosted as threads in one test binary, for instance) are no-ops.
pub fn init_logging(config: &MpiConfig) -> MpiResult<()> {
    let rank = config.get_rank();
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level_for_verbosity(config.get_verbosity()));
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }

    builder.format(move |buf, record| {
        writeln!(
            buf,
            "[rank {}] {:<5} {}: {}",
            rank,
            record.level(),
            record.target(),
            record.args()
        )
    });

    match config.get_log_target() {
        LogTarget::Stderr => {
            builder.target(env_logger::Target::Stderr);
        }
        LogTarget::Stdout => {
            builder.target(env_logger::Target::Stdout);
        }
        LogTarget::File(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        }
    }

    if builder.try_init().is_err() {
        log::trace!("logger already installed, keeping it");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_levels() {
        assert_eq!(level_for_verbosity(0), log::LevelFilter::Warn);
        assert_eq!(level_for_verbosity(1), log::LevelFilter::Info);
        assert_eq!(level_for_verbosity(2), log::LevelFilter::Debug);
        assert_eq!(level_for_verbosity(7), log::LevelFilter::Trace);
    }
}

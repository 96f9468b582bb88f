//! Log sink setup.
//!
//! The store itself only emits `tracing` events. Callers that want them
//! written somewhere can install a subscriber here, either explicitly or
//! through [`BlobStore::open_simple`](crate::BlobStore::open_simple).

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Verbosity bits, most verbose bit wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogMask(pub u32);

impl LogMask {
    pub const NONE: LogMask = LogMask(0);
    pub const NOTICE: LogMask = LogMask(1 << 0);
    pub const INFO: LogMask = LogMask(1 << 1);
    pub const TRANSACTIONS: LogMask = LogMask(1 << 2);
    pub const ERROR: LogMask = LogMask(1 << 3);
    pub const DEBUG: LogMask = LogMask(1 << 4);

    pub fn contains(self, other: LogMask) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// Most verbose level enabled by this mask.
    pub fn level(self) -> LevelFilter {
        if self.contains(Self::TRANSACTIONS) {
            LevelFilter::TRACE
        } else if self.contains(Self::DEBUG) {
            LevelFilter::DEBUG
        } else if self.contains(Self::INFO) {
            LevelFilter::INFO
        } else if self.contains(Self::NOTICE) {
            LevelFilter::WARN
        } else if self.contains(Self::ERROR) {
            LevelFilter::ERROR
        } else {
            LevelFilter::OFF
        }
    }
}

impl std::ops::BitOr for LogMask {
    type Output = LogMask;

    fn bitor(self, rhs: LogMask) -> LogMask {
        LogMask(self.0 | rhs.0)
    }
}

/// Where store logs go and how much of them.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log file, appended to. `None` logs to stderr.
    pub file: Option<PathBuf>,
    pub mask: LogMask,
}

impl LogConfig {
    pub fn new(file: Option<PathBuf>, mask: LogMask) -> Self {
        Self { file, mask }
    }
}

/// Install a global `tracing` subscriber for `config`.
///
/// `RUST_LOG` takes precedence over the mask when set. Returns `Ok(false)`
/// if a global subscriber was already installed, which is left in place.
pub fn init_logging(config: &LogConfig) -> Result<bool> {
    let filter = EnvFilter::builder()
        .with_default_directive(config.mask.level().into())
        .from_env_lossy();

    let installed = match &config.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_thread_ids(true)
                .try_init()
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init(),
    };

    match installed {
        Ok(()) => Ok(true),
        Err(e) => {
            tracing::debug!(error = %e, "log subscriber already installed");
            Ok(false)
        }
    }
}

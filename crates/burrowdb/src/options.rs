//! Configuration options and crate-wide limits.

use std::path::PathBuf;
use std::time::Duration;

/// Largest accepted user key, chosen so the internal form (user key plus the
/// 12-byte sequence/expiry suffix) still fits a 16-bit entry key size.
pub const MAX_KEY_LENGTH: usize = (1 << 16) - 13;

/// Largest accepted value.
pub const MAX_VALUE_LENGTH: usize = 1 << 30;

/// Hard upper bound on total live entries in the store.
pub const MAX_KEYS: u64 = 1 << 31;

/// Default maximum in-memory staging size (16 MB).
pub const DEFAULT_MEMDB_SIZE: usize = 16 * 1024 * 1024;

/// Default buffer unit for log payload assembly (1 MB).
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// Default batching interval for WAL flushes.
pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_millis(15);

/// Default time-block granularity for the WAL epoch.
pub const DEFAULT_TIME_BLOCK_DURATION: Duration = Duration::from_secs(1);

/// Configuration for opening a store.
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory for WAL files. When `None` the log lives beside the data
    /// and index files in the store directory.
    pub log_file_path: Option<PathBuf>,
    /// Maximum in-memory staging size in bytes; also sizes the initial
    /// staging arena reservation.
    pub memdb_size: usize,
    /// Buffer unit used when assembling WAL payloads.
    pub buffer_size: usize,
    /// Skip recovery on open and reinitialize the WAL.
    pub log_reset: bool,
    /// Batching interval for WAL flushes.
    pub log_interval: Duration,
    /// Time-block granularity for the WAL epoch.
    pub time_block_duration: Duration,
    /// Fsync the data and index files at the end of every commit.
    pub sync_writes: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            log_file_path: None,
            memdb_size: DEFAULT_MEMDB_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            log_reset: false,
            log_interval: DEFAULT_LOG_INTERVAL,
            time_block_duration: DEFAULT_TIME_BLOCK_DURATION,
            sync_writes: false,
        }
    }
}

impl Options {
    /// Creates options with defaults and the given WAL directory.
    pub fn with_log_file_path(path: impl Into<PathBuf>) -> Self {
        Self {
            log_file_path: Some(path.into()),
            ..Self::default()
        }
    }
}

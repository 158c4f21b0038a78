//! Burrowdb - embedded key/value store for time-series style ingest.
//!
//! This crate provides a single-process store tuned for high-throughput
//! batched writes, TTL-bounded entries and point lookups by key.
//!
//! # Components
//!
//! - [`Db`]: the store handle — open/close, lookups, single-record writes
//! - [`Batch`] / [`BatchGroup`]: buffered writes with dedup, optimistic
//!   conflict detection and group execution
//! - [`Wal`]: write-ahead log giving staged batches crash recovery
//!
//! # Write path
//!
//! ```text
//! put/delete → batch buffer → write(): dedup + conflict check →
//!   stage into the in-memory table → append WAL record →
//!   commit(): apply staged range to the on-disk bucket index →
//!   signal the WAL record applied
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use burrowdb::{Db, Options};
//!
//! let db = Db::open("/path/to/store", Options::default())?;
//!
//! let mut batch = db.batch();
//! batch.put(b"device/7/temp", b"21.5");
//! batch.put_with_ttl(b"device/7/beacon", b"up", std::time::Duration::from_secs(60));
//! batch.write()?;
//! batch.commit()?;
//!
//! assert_eq!(db.get(b"device/7/temp")?, Some(b"21.5".to_vec()));
//! db.close()?;
//! ```

#![deny(missing_docs)]

pub mod error;
pub mod options;
pub mod stats;
pub mod wal;

mod batch;
mod bucket;
mod data;
mod db;
mod file;
mod filter;
mod index;
mod key;
mod memdb;

pub use batch::{Batch, BatchGroup};
pub use db::{Db, Items};
pub use error::{Error, Result};
pub use key::KEY_MAX_SEQ;
pub use options::{Options, MAX_KEYS, MAX_KEY_LENGTH, MAX_VALUE_LENGTH};
pub use stats::{Stats, StatsSnapshot};
pub use wal::{LogReader, Wal};

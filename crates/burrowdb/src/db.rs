//! The store handle: open/close, lookups, batches and WAL replay.
//!
//! A [`Db`] ties the components together. Writes flow through batches:
//!
//! ```text
//! put/delete → batch buffer → write(): dedup + conflict check →
//!   reserve seqs → stage into the staging table → append WAL record →
//!   commit(): scan staged range, apply to the bucket index →
//!   signal the WAL record applied
//! ```
//!
//! Three locks split the shared state: `write_lock` serializes the bodies of
//! batch `write` and `commit`, `mu` guards every durable-index mutation (the
//! data heap included), and the WAL keeps its own reader/writer lock over
//! the log list. Lookups take `mu` only; batch construction is lock-free and
//! single-owner.
//!
//! On open, written-but-unapplied WAL records are replayed straight into the
//! index through the same insert/delete routines the commit path uses —
//! idempotent by sequence order and key equality — and then signalled
//! applied.

use crate::batch::{Batch, BatchGroup};
use crate::error::{Error, Result};
use crate::index::Index;
use crate::key::{fingerprint, is_expired};
use crate::memdb::Memdb;
use crate::options::Options;
use crate::stats::{Stats, StatsSnapshot};
use crate::wal::Wal;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{info, warn};

/// WAL file name within the log directory.
const WAL_FILE_NAME: &str = "burrow.log";

struct DbInner {
    mu: Mutex<Index>,
    write_lock: Mutex<()>,
    mem: Arc<Memdb>,
    wal: Wal,
    opts: Options,
    stats: Stats,
    committed_seq: AtomicU64,
    closed: AtomicBool,
}

/// An open store. Cheap to clone; clones share the same underlying state.
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

impl Db {
    /// Opens (creating if absent) a store in the directory at `path`.
    ///
    /// A non-empty WAL left by an unclean shutdown is replayed into the
    /// index before the store is handed out, unless
    /// [`Options::log_reset`] asks for a fresh log.
    pub fn open(path: impl AsRef<Path>, opts: Options) -> Result<Self> {
        let dir = path.as_ref();
        std::fs::create_dir_all(dir)?;
        let mut index = Index::open(dir)?;

        let log_dir = match &opts.log_file_path {
            Some(dir) => dir.clone(),
            None => dir.to_path_buf(),
        };
        std::fs::create_dir_all(&log_dir)?;
        let (wal, needs_recovery) = Wal::open(log_dir.join(WAL_FILE_NAME), opts.log_reset)?;

        let stats = Stats::new();
        let mut seq = index.seq();

        if needs_recovery {
            let mut replayed = 0u64;
            for (log_seq, upper_seq) in wal.scan()? {
                let mut reader = wal.read(log_seq)?;
                while let Some(record) = reader.next() {
                    let (del_flag, expires_at, key, value) = match decode_log_record(record) {
                        Some(decoded) => decoded,
                        None => {
                            warn!(log_seq, "skipping malformed log record");
                            continue;
                        }
                    };
                    let hash = fingerprint(key);
                    if del_flag {
                        index.remove(hash, key)?;
                    } else {
                        index.insert(hash, key, value, expires_at)?;
                    }
                }
                wal.signal_log_applied(upper_seq)?;
                seq = seq.max(upper_seq);
                replayed += 1;
            }
            index.set_seq(seq);
            index.sync()?;
            stats.add_recovered_logs(replayed);
            info!(logs = replayed, "replayed write-ahead log");
        }

        let mem = Arc::new(Memdb::new(opts.memdb_size));
        mem.set_seq(seq);

        Ok(Self {
            inner: Arc::new(DbInner {
                mu: Mutex::new(index),
                write_lock: Mutex::new(()),
                mem,
                wal,
                opts,
                stats,
                committed_seq: AtomicU64::new(seq),
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn ok(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::WalClosed);
        }
        Ok(())
    }

    pub(crate) fn write_lock(&self) -> MutexGuard<'_, ()> {
        self.inner
            .write_lock
            .lock()
            .unwrap_or_else(|err| err.into_inner())
    }

    pub(crate) fn durable(&self) -> MutexGuard<'_, Index> {
        self.inner.mu.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub(crate) fn wal(&self) -> &Wal {
        &self.inner.wal
    }

    pub(crate) fn meter(&self) -> &Stats {
        &self.inner.stats
    }

    pub(crate) fn sync_writes(&self) -> bool {
        self.inner.opts.sync_writes
    }

    pub(crate) fn publish_committed_seq(&self, seq: u64) {
        self.inner.committed_seq.fetch_max(seq, Ordering::AcqRel);
    }

    /// Creates a new write batch.
    ///
    /// # Panics
    ///
    /// Panics when the store has been closed.
    pub fn batch(&self) -> Batch {
        assert!(
            !self.inner.closed.load(Ordering::Acquire),
            "store is closed"
        );
        Batch::new(self.clone(), Arc::clone(&self.inner.mem))
    }

    /// Creates a new batch group.
    ///
    /// # Panics
    ///
    /// Panics when the store has been closed.
    pub fn batch_group(&self) -> BatchGroup {
        assert!(
            !self.inner.closed.load(Ordering::Acquire),
            "store is closed"
        );
        BatchGroup::new(self.clone())
    }

    /// Writes a single entry through a one-record batch.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_with_ttl(key, value, Duration::ZERO)
    }

    /// Writes a single TTL-bounded entry through a one-record batch.
    pub fn put_with_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> Result<()> {
        self.ok()?;
        let mut batch = self.batch();
        batch.put_with_ttl(key, value, ttl);
        batch.write()?;
        batch.commit()
    }

    /// Deletes a single entry through a one-record batch.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.ok()?;
        let mut batch = self.batch();
        batch.delete(key);
        batch.write()?;
        batch.commit()
    }

    /// Point lookup.
    ///
    /// Staged entries at or below the committed horizon are served from the
    /// staging table; everything else falls back to the durable index.
    /// Deleted and expired entries read as misses.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ok()?;
        self.inner.stats.add_gets(1);
        let hash = fingerprint(key);

        if let Some(hit) = self.inner.mem.lookup(hash, key) {
            if hit.seq <= self.inner.committed_seq.load(Ordering::Acquire) {
                if hit.delete || is_expired(hit.expires_at) {
                    return Ok(None);
                }
                return Ok(Some(hit.value));
            }
        }
        self.durable().get(hash, key)
    }

    /// Iterates the committed, unexpired entries in chain order over a
    /// point-in-time snapshot.
    pub fn items(&self) -> Result<Items> {
        self.ok()?;
        let items = self.durable().items()?;
        Ok(Items {
            iter: items.into_iter(),
        })
    }

    /// Number of live entries in the durable index.
    pub fn count(&self) -> u64 {
        self.durable().count()
    }

    /// A point-in-time snapshot of the operation counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Flushes everything and closes the store. Later operations fail; a
    /// second close reports [`Error::WalClosed`].
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::WalClosed);
        }
        {
            let durable = self.durable();
            durable.sync()?;
        }
        self.inner.wal.close()?;
        self.inner.mem.decref();
        Ok(())
    }
}

impl Drop for DbInner {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            let durable = self.mu.lock().unwrap_or_else(|err| err.into_inner());
            if let Err(e) = durable.sync() {
                warn!(error = %e, "failed to sync store on drop");
            }
        }
    }
}

/// Iterator over a snapshot of the store's committed entries.
pub struct Items {
    iter: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
}

impl Iterator for Items {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next()
    }
}

/// Decodes a WAL sub-record into `(del, expires_at, key, value)`.
fn decode_log_record(record: &[u8]) -> Option<(bool, u32, &[u8], &[u8])> {
    if record.len() < 7 {
        return None;
    }
    let del_flag = record[0] != 0;
    let expires_at = u32::from_le_bytes(record[1..5].try_into().unwrap());
    let key_size = usize::from(u16::from_le_bytes(record[5..7].try_into().unwrap()));
    if record.len() < 7 + key_size {
        return None;
    }
    let key = &record[7..7 + key_size];
    let value = &record[7 + key_size..];
    Some((del_flag, expires_at, key, value))
}

//! Write batches and batch groups.
//!
//! A [`Batch`] buffers put and delete records, then moves them through the
//! commit pipeline:
//!
//! ```text
//!     ┌─ init ─→ [open] ── put/delete ──┐
//!     │              │                  │
//!     │              └──────────────────┘
//!     │              │
//!     │          write()
//!     │              │
//!     │          [written] ── commit() ─→ [committed]
//!     │              │
//!     │              └── abort() ──────→ [aborted]
//! ```
//!
//! `write()` deduplicates the buffer, checks the records against every other
//! in-flight batch's fingerprints, stages them in the staging table under a
//! freshly reserved sequence range and appends them to the WAL. `commit()`
//! re-reads the staged range and applies it to the durable index, after which
//! the WAL record is signalled applied. Terminal states release the staging
//! table reference exactly once.
//!
//! A [`BatchGroup`] collects sibling batches and runs them as one logical
//! group: members are concatenated in registration order into a composite
//! batch that writes and commits under a single contiguous sequence range.

use crate::db::Db;
use crate::error::{Error, Result};
use crate::key::{fingerprint, make_internal_key, unix_now};
use crate::memdb::Memdb;
use crate::options::{MAX_KEY_LENGTH, MAX_VALUE_LENGTH};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Per-record metadata pointing into the batch's data buffer.
#[derive(Debug, Clone, Copy, Default)]
struct BatchIndex {
    del_flag: bool,
    hash: u32,
    key_size: u16,
    value_size: u32,
    expires_at: u32,
    kv_offset: usize,
}

impl BatchIndex {
    fn key<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.kv_offset..self.kv_offset + usize::from(self.key_size)]
    }

    fn key_value<'a>(&self, data: &'a [u8]) -> (&'a [u8], &'a [u8]) {
        let key_end = self.kv_offset + usize::from(self.key_size);
        (
            &data[self.kv_offset..key_end],
            &data[key_end..key_end + self.value_size as usize],
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchState {
    Open,
    Written,
    Committed,
    Aborted,
}

/// A write batch.
///
/// A batch is owned by a single thread until [`write`](Batch::write);
/// buffering records never fails, validation is deferred to the write.
pub struct Batch {
    db: Db,
    mem: Arc<Memdb>,
    state: BatchState,
    managed: bool,
    grouped: bool,
    order: i32,
    seq: u64,
    data: Vec<u8>,
    index: Vec<BatchIndex>,
    pending_writes: Vec<BatchIndex>,
    first_key_hash: Option<u32>,
    keys: Vec<u32>,
    internal_len: u64,
    released: bool,
}

impl Batch {
    pub(crate) fn new(db: Db, mem: Arc<Memdb>) -> Self {
        mem.incref();
        Self {
            db,
            mem,
            state: BatchState::Open,
            managed: false,
            grouped: false,
            order: 0,
            seq: 0,
            data: Vec::new(),
            index: Vec::new(),
            pending_writes: Vec::new(),
            first_key_hash: None,
            keys: Vec::new(),
            internal_len: 0,
            released: false,
        }
    }

    pub(crate) fn set_grouped(&mut self, order: i32) {
        self.grouped = true;
        self.managed = true;
        self.order = order;
    }

    fn append_rec(&mut self, del_flag: bool, expires_at: u32, key: &[u8], value: &[u8]) {
        let mut index = BatchIndex {
            del_flag,
            hash: fingerprint(key),
            key_size: key.len() as u16,
            expires_at,
            ..Default::default()
        };
        self.data.push(u8::from(del_flag));
        index.kv_offset = self.data.len();
        self.data.extend_from_slice(key);
        if !del_flag {
            index.value_size = value.len() as u32;
            self.data.extend_from_slice(value);
        }
        self.index.push(index);
        self.internal_len += key.len() as u64 + value.len() as u64 + 8;
    }

    /// Appends a put record. It is safe to modify `key` and `value` after
    /// the call returns.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.put_with_ttl(key, value, Duration::ZERO);
    }

    /// Appends a put record with a time-to-live. A TTL under one second
    /// rounds down and expires the record at the current second.
    pub fn put_with_ttl(&mut self, key: &[u8], value: &[u8], ttl: Duration) {
        let expires_at = if ttl.is_zero() {
            0
        } else {
            unix_now().saturating_add(ttl.as_secs().min(u64::from(u32::MAX)) as u32)
        };
        self.append_rec(false, expires_at, key, value);
    }

    /// Appends a delete record.
    pub fn delete(&mut self, key: &[u8]) {
        self.append_rec(true, 0, key, &[]);
    }

    /// Deduplicates the buffered records by fingerprint, keeping the latest
    /// occurrence of each while preserving the survivors' original relative
    /// order.
    fn uniq(&mut self) {
        let mut unique_set: HashMap<u32, (usize, usize)> =
            HashMap::with_capacity(self.index.len());
        let mut new_idx = 0;
        for idx in (0..self.index.len()).rev() {
            let hash = self.index[idx].hash;
            if !unique_set.contains_key(&hash) {
                unique_set.insert(hash, (idx, new_idx));
                new_idx += 1;
            }
        }

        let survivors = unique_set.len();
        self.keys = Vec::with_capacity(survivors);
        self.pending_writes = vec![BatchIndex::default(); survivors];
        for (hash, (idx, new_idx)) in unique_set {
            self.keys.push(hash);
            self.pending_writes[survivors - new_idx - 1] = self.index[idx];
        }
    }

    /// Validates and stages one record.
    fn mput(
        mem: &Memdb,
        seq: &mut u64,
        first_key_hash: &mut Option<u32>,
        del_flag: bool,
        hash: u32,
        expires_at: u32,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        if key.is_empty() {
            return Err(Error::KeyEmpty);
        }
        if key.len() > MAX_KEY_LENGTH {
            return Err(Error::KeyTooLarge(key.len()));
        }
        if value.len() > MAX_VALUE_LENGTH {
            return Err(Error::ValueTooLarge(value.len()));
        }
        if mem.has_conflict(hash) {
            return Err(Error::WriteConflict);
        }

        let ikey = make_internal_key(key, *seq + 1, del_flag, expires_at);
        mem.put(hash, &ikey, value, expires_at)?;
        if mem.needs_split() {
            mem.split()?;
        }
        if first_key_hash.is_none() {
            *first_key_hash = Some(hash);
        }
        *seq += 1;
        Ok(())
    }

    /// Serializes the pending writes under the store's write lock.
    ///
    /// Deduplicates the buffer, fails on a fingerprint overlap with any
    /// other in-flight batch, reserves the batch's sequence range, stages
    /// every record and appends one fsync'd WAL record. A grouped batch only
    /// deduplicates; its group serializes the members together.
    ///
    /// # Panics
    ///
    /// Panics when the batch has already been written.
    pub fn write(&mut self) -> Result<()> {
        assert_eq!(self.state, BatchState::Open, "batch is already written");
        let db = self.db.clone();
        let _write_lock = db.write_lock();

        self.uniq();
        if self.grouped {
            trace!(order = self.order, len = self.pending_writes.len(), "grouped batch staged");
            return Ok(());
        }
        self.write_locked()
    }

    fn write_locked(&mut self) -> Result<()> {
        let seq_before = self.mem.get_seq();
        self.seq = seq_before;
        if self.pending_writes.is_empty() {
            self.state = BatchState::Written;
            return Ok(());
        }

        for i in 0..self.pending_writes.len() {
            let rec = self.pending_writes[i];
            let (key, value) = rec.key_value(&self.data);
            if let Err(e) = Self::mput(
                &self.mem,
                &mut self.seq,
                &mut self.first_key_hash,
                rec.del_flag,
                rec.hash,
                rec.expires_at,
                key,
                value,
            ) {
                // Unstage what this batch already placed; committed state is
                // untouched, so readers fall back to the durable index.
                for j in 0..i {
                    let staged = self.pending_writes[j];
                    self.mem.unput(
                        staged.hash,
                        staged.key(&self.data),
                        seq_before + j as u64 + 1,
                    );
                }
                self.seq = seq_before;
                return Err(e);
            }
        }

        let payload = self.encode_log_payload();
        if let Err(e) =
            self.db
                .wal()
                .append(self.pending_writes.len() as u32, self.seq, &payload)
        {
            for j in 0..self.pending_writes.len() {
                let staged = self.pending_writes[j];
                self.mem
                    .unput(staged.hash, staged.key(&self.data), seq_before + j as u64 + 1);
            }
            self.seq = seq_before;
            return Err(e);
        }

        self.mem.publish(self.seq, self.keys.clone());
        self.mem.set_seq(self.seq);
        self.state = BatchState::Written;
        debug!(
            seq = self.seq,
            len = self.pending_writes.len(),
            "batch written"
        );
        Ok(())
    }

    /// Encodes the pending writes as WAL sub-records:
    /// `[del(1)][expires_at(4)][key_size(2)][key][value]`.
    fn encode_log_payload(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.internal_len as usize + self.pending_writes.len() * 8);
        for rec in &self.pending_writes {
            let (key, value) = rec.key_value(&self.data);
            let total = 4 + 1 + 4 + 2 + key.len() + value.len();
            buf.extend_from_slice(&(total as u32).to_le_bytes());
            buf.push(u8::from(rec.del_flag));
            buf.extend_from_slice(&rec.expires_at.to_le_bytes());
            buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
            buf.extend_from_slice(key);
            buf.extend_from_slice(value);
        }
        buf
    }

    /// Applies the written batch to the durable index.
    ///
    /// Scans the staged range `(seq - len, seq]` starting at the first key's
    /// bucket, applying deletes behind the membership filter and inserting
    /// the rest, then retires the batch's fingerprints and signals the WAL
    /// record applied.
    ///
    /// # Panics
    ///
    /// Panics when called on a managed (group-owned) batch.
    pub fn commit(&mut self) -> Result<()> {
        assert!(!self.managed, "managed batch commit not allowed");
        if self.state != BatchState::Written || self.mem.refs() == 0 {
            return Ok(());
        }
        if self.pending_writes.is_empty() {
            self.state = BatchState::Committed;
            self.release();
            return Ok(());
        }

        let db = self.db.clone();
        let _write_lock = db.write_lock();
        let lower = self.seq - self.pending_writes.len() as u64;
        let mut puts = 0u64;
        let mut dels = 0u64;
        {
            let mut durable = self.db.durable();
            self.mem.scan_range(
                self.first_key_hash.unwrap_or(0),
                lower,
                self.seq,
                |del_flag, hash, key, value, expires_at| {
                    if del_flag {
                        if durable.remove(hash, key)? {
                            dels += 1;
                        }
                    } else {
                        durable.insert(hash, key, value, expires_at)?;
                        puts += 1;
                    }
                    Ok(())
                },
            )?;
            durable.set_seq(self.seq);
            if self.db.sync_writes() {
                durable.sync()?;
            }
        }

        self.mem.retire(self.seq);
        self.db.publish_committed_seq(self.seq);
        self.db.wal().signal_log_applied(self.seq)?;
        self.db.meter().add_puts(puts);
        self.db.meter().add_dels(dels);

        self.state = BatchState::Committed;
        self.release();
        debug!(seq = self.seq, puts, dels, "batch committed");
        Ok(())
    }

    /// Abandons the batch, erasing any staged records. Keeps no durable
    /// effect and never surfaces errors.
    ///
    /// # Panics
    ///
    /// Panics when called on a managed (group-owned) batch.
    pub fn abort(&mut self) {
        assert!(!self.managed, "managed batch abort not allowed");
        self.abort_inner();
    }

    fn abort_inner(&mut self) {
        if matches!(self.state, BatchState::Committed | BatchState::Aborted) {
            return;
        }
        if self.state == BatchState::Written && !self.pending_writes.is_empty() {
            let lower = self.seq - self.pending_writes.len() as u64;
            for (i, rec) in self.pending_writes.iter().enumerate() {
                self.mem
                    .unput(rec.hash, rec.key(&self.data), lower + i as u64 + 1);
            }
            self.mem.retire(self.seq);
            // Best effort: without this the written log would replay the
            // aborted records at the next open.
            if let Err(e) = self.db.wal().signal_log_aborted(self.seq) {
                trace!(error = %e, "could not reclaim aborted batch log");
            }
        }
        self.db.meter().add_aborts(1);
        self.reset();
        self.state = BatchState::Aborted;
        self.release();
    }

    /// Clears the record buffer, retaining its backing capacity.
    pub fn reset(&mut self) {
        self.data.clear();
        self.index.clear();
        self.pending_writes.clear();
        self.keys.clear();
        self.first_key_hash = None;
        self.internal_len = 0;
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.mem.decref();
        }
    }

    /// Number of deduplicated pending records; before `write()`, the number
    /// of buffered records.
    pub fn len(&self) -> usize {
        if self.pending_writes.is_empty() {
            self.index.len()
        } else {
            self.pending_writes.len()
        }
    }

    /// Whether the batch holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The batch's unique fingerprint list, populated by `write()`.
    pub fn keys(&self) -> &[u32] {
        &self.keys
    }

    /// The upper end of the batch's reserved sequence range.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Concatenates another batch's buffer into this one, adjusting record
    /// offsets.
    pub(crate) fn append_from(&mut self, other: &Batch) {
        let offset = self.data.len();
        for rec in &other.index {
            let mut rec = *rec;
            rec.kv_offset += offset;
            self.index.push(rec);
        }
        self.data.extend_from_slice(&other.data);
        self.internal_len += other.internal_len;
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        if !self.released {
            if self.managed {
                self.release();
            } else {
                self.abort_inner();
            }
        }
    }
}

/// A group of sibling batches run as one logical write.
///
/// Members registered with [`add`](BatchGroup::add) execute on fresh grouped
/// batches; [`run`](BatchGroup::run) concatenates them in registration order
/// into a composite batch that writes and commits under one contiguous
/// sequence range. A later member's record supersedes an earlier member's
/// record for the same key.
pub struct BatchGroup {
    db: Db,
    #[allow(clippy::type_complexity)]
    fns: Vec<Box<dyn FnOnce(&mut Batch) -> Result<()>>>,
}

impl BatchGroup {
    pub(crate) fn new(db: Db) -> Self {
        Self {
            db,
            fns: Vec::new(),
        }
    }

    /// Registers a member. The closure fills one batch of the group.
    pub fn add<F>(&mut self, f: F)
    where
        F: FnOnce(&mut Batch) -> Result<()> + 'static,
    {
        self.fns.push(Box::new(f));
    }

    /// Runs all members and commits their records as one batch.
    pub fn run(mut self) -> Result<()> {
        let mut members = Vec::with_capacity(self.fns.len());
        for (order, f) in self.fns.drain(..).enumerate() {
            let mut member = self.db.batch();
            member.set_grouped(order as i32);
            f(&mut member)?;
            member.write()?;
            members.push(member);
        }

        members.sort_by_key(|m| m.order);
        let mut composite = self.db.batch();
        for member in &members {
            composite.append_from(member);
        }
        composite.write()?;
        composite.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use tempfile::TempDir;

    fn open_db(dir: &TempDir) -> Db {
        Db::open(dir.path(), Options::default()).unwrap()
    }

    #[test]
    fn test_uniq_keeps_latest_preserving_order() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        let mut batch = db.batch();
        batch.put(b"a", b"1");
        batch.put(b"b", b"2");
        batch.put(b"a", b"3");
        batch.uniq();

        // The rightmost record per fingerprint survives, in the survivors'
        // original relative order: b, then the latest a.
        let pending: Vec<(Vec<u8>, Vec<u8>)> = batch
            .pending_writes
            .iter()
            .map(|rec| {
                let (key, value) = rec.key_value(&batch.data);
                (key.to_vec(), value.to_vec())
            })
            .collect();
        assert_eq!(
            pending,
            vec![
                (b"b".to_vec(), b"2".to_vec()),
                (b"a".to_vec(), b"3".to_vec())
            ]
        );
        assert_eq!(batch.keys().len(), 2);
    }

    #[test]
    fn test_uniq_without_duplicates_is_identity() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        let mut batch = db.batch();
        batch.put(b"x", b"1");
        batch.delete(b"y");
        batch.put(b"z", b"3");
        batch.uniq();

        let pending: Vec<Vec<u8>> = batch
            .pending_writes
            .iter()
            .map(|rec| rec.key(&batch.data).to_vec())
            .collect();
        assert_eq!(pending, vec![b"x".to_vec(), b"y".to_vec(), b"z".to_vec()]);
        assert!(batch.pending_writes[1].del_flag);
    }

    #[test]
    fn test_uniq_delete_supersedes_put() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        let mut batch = db.batch();
        batch.put(b"k", b"v");
        batch.delete(b"k");
        batch.uniq();

        assert_eq!(batch.pending_writes.len(), 1);
        assert!(batch.pending_writes[0].del_flag);
    }

    #[test]
    fn test_failed_write_rolls_back_staging() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        let mut batch = db.batch();
        batch.put(b"good", b"v");
        batch.put(b"", b"empty key");
        assert!(matches!(batch.write(), Err(Error::KeyEmpty)));

        // Nothing of the failed batch is staged or published.
        assert_eq!(db.get(b"good").unwrap(), None);
        let mut retry = db.batch();
        retry.put(b"good", b"v");
        retry.write().unwrap();
        retry.commit().unwrap();
        assert_eq!(db.get(b"good").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    #[should_panic(expected = "batch is already written")]
    fn test_double_write_panics() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        let mut batch = db.batch();
        batch.put(b"k", b"v");
        batch.write().unwrap();
        let _ = batch.write();
    }

    #[test]
    fn test_append_from_adjusts_offsets() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        let mut left = db.batch();
        left.put(b"one", b"1");
        let mut right = db.batch();
        right.put(b"two", b"22");

        let mut composite = db.batch();
        composite.append_from(&left);
        composite.append_from(&right);

        assert_eq!(composite.index.len(), 2);
        let (key, value) = composite.index[1].key_value(&composite.data);
        assert_eq!(key, b"two");
        assert_eq!(value, b"22");
    }
}

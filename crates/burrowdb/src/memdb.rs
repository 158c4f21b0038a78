//! In-memory staging table.
//!
//! The staging table mirrors the durable index shape — the same bucket and
//! entry layout — over an in-memory arena, so a batch can land writes
//! immediately and readers can see them at the current sequence. Entries hold
//! *internal* keys (user key plus the packed sequence/expiry suffix); the
//! commit scan later decodes them and applies the in-range records to the
//! durable index.
//!
//! The table also owns the process-wide write sequence and the
//! `active_batches` fingerprint map that powers optimistic conflict
//! detection, and it is reference counted: every batch takes a reference on
//! init and releases it on commit or abort.

use crate::bucket::{Bucket, Entry, ENTRIES_PER_BUCKET, LOAD_FACTOR};
use crate::error::{Error, Result};
use crate::key::{is_expired, parse_internal_key, INTERNAL_KEY_SUFFIX};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::RwLock;
use tracing::{debug, warn};

/// Number of base buckets in a fresh staging table.
const INITIAL_BUCKETS: u32 = 16;

/// A record surfaced by a staging-table lookup.
#[derive(Debug, Clone)]
pub(crate) struct StagedEntry {
    /// Sequence the record was staged under.
    pub(crate) seq: u64,
    /// Whether the record is a delete.
    pub(crate) delete: bool,
    /// Expiry in unix seconds, 0 for none.
    pub(crate) expires_at: u32,
    /// The staged value; empty for deletes.
    pub(crate) value: Vec<u8>,
}

struct MemInner {
    arena: Vec<u8>,
    buckets: Vec<Bucket>,
    n_buckets: u32,
    count: u64,
    active_batches: HashMap<u64, Vec<u32>>,
}

impl MemInner {
    fn bucket_index(&self, hash: u32) -> usize {
        (hash % self.n_buckets) as usize
    }

    fn key_at(&self, entry: &Entry) -> &[u8] {
        let off = entry.kv_offset as usize;
        &self.arena[off..off + usize::from(entry.key_size)]
    }

    fn value_at(&self, entry: &Entry) -> &[u8] {
        let off = entry.kv_offset as usize + usize::from(entry.key_size);
        &self.arena[off..off + entry.value_size as usize]
    }

    fn write_arena(&mut self, ikey: &[u8], value: &[u8]) -> i64 {
        let off = self.arena.len() as i64;
        self.arena.extend_from_slice(ikey);
        self.arena.extend_from_slice(value);
        off
    }

    /// Places an entry at the first empty slot of its chain, linking a new
    /// overflow bucket when the chain is exhausted. Used by redistribution,
    /// which guarantees the key is not already present.
    fn place(&mut self, entry: Entry) {
        let mut idx = self.bucket_index(entry.hash);
        loop {
            for i in 0..ENTRIES_PER_BUCKET {
                if self.buckets[idx].entries[i].is_empty() {
                    self.buckets[idx].entries[i] = entry;
                    return;
                }
            }
            if self.buckets[idx].next == 0 {
                let overflow = self.buckets.len();
                self.buckets.push(Bucket::default());
                self.buckets[overflow].entries[0] = entry;
                self.buckets[idx].next = overflow as i64;
                return;
            }
            idx = self.buckets[idx].next as usize;
        }
    }
}

/// The staging table shared by all in-flight batches.
pub(crate) struct Memdb {
    inner: RwLock<MemInner>,
    seq: AtomicU64,
    refs: AtomicI32,
}

impl Memdb {
    /// Creates a staging table, reserving roughly `arena_capacity` bytes for
    /// the data arena.
    pub(crate) fn new(arena_capacity: usize) -> Self {
        let mut arena = Vec::with_capacity(arena_capacity.max(64));
        // Offset 0 marks an empty slot, so the arena never hands it out.
        arena.push(0);
        Self {
            inner: RwLock::new(MemInner {
                arena,
                buckets: vec![Bucket::default(); INITIAL_BUCKETS as usize],
                n_buckets: INITIAL_BUCKETS,
                count: 0,
                active_batches: HashMap::new(),
            }),
            seq: AtomicU64::new(0),
            refs: AtomicI32::new(1),
        }
    }

    /// Takes a reference for a new batch.
    pub(crate) fn incref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Releases a reference, returning the remaining count.
    pub(crate) fn decref(&self) -> i32 {
        self.refs.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Current reference count.
    pub(crate) fn refs(&self) -> i32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Current write sequence.
    pub(crate) fn get_seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Advances the write sequence. Sequences only move forward.
    pub(crate) fn set_seq(&self, seq: u64) {
        self.seq.fetch_max(seq, Ordering::AcqRel);
    }

    /// Number of staged entries.
    pub(crate) fn count(&self) -> u64 {
        self.read().count
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MemInner> {
        self.inner.read().unwrap_or_else(|err| err.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MemInner> {
        self.inner.write().unwrap_or_else(|err| err.into_inner())
    }

    /// Whether any in-flight batch already holds this fingerprint.
    pub(crate) fn has_conflict(&self, hash: u32) -> bool {
        self.read()
            .active_batches
            .values()
            .any(|keys| keys.contains(&hash))
    }

    /// Publishes a written batch's fingerprints for conflict checks.
    pub(crate) fn publish(&self, seq: u64, keys: Vec<u32>) {
        self.write().active_batches.insert(seq, keys);
    }

    /// Retires a committed or aborted batch's fingerprints.
    pub(crate) fn retire(&self, seq: u64) {
        self.write().active_batches.remove(&seq);
    }

    /// Stages an internal-key record.
    ///
    /// A record whose user key already exists in the chain replaces it in
    /// place; otherwise the first empty slot is claimed, linking a new
    /// overflow bucket when the chain is exhausted.
    pub(crate) fn put(&self, hash: u32, ikey: &[u8], value: &[u8], expires_at: u32) -> Result<()> {
        let mut inner = self.write();
        let ukey_len = ikey.len() - INTERNAL_KEY_SUFFIX;

        enum Target {
            Replace(usize, usize),
            Empty(usize, usize),
            Link(usize),
        }

        let target = {
            let mut idx = inner.bucket_index(hash);
            let mut empty = None;
            let mut matched = None;
            loop {
                let bucket = &inner.buckets[idx];
                for (i, entry) in bucket.entries.iter().enumerate() {
                    if entry.is_empty() {
                        if empty.is_none() {
                            empty = Some((idx, i));
                        }
                    } else if entry.hash == hash
                        && usize::from(entry.key_size) == ikey.len()
                        && inner.key_at(entry)[..ukey_len] == ikey[..ukey_len]
                    {
                        matched = Some((idx, i));
                        break;
                    }
                }
                if matched.is_some() || bucket.next == 0 {
                    break;
                }
                idx = bucket.next as usize;
            }
            match (matched, empty) {
                (Some((bi, si)), _) => Target::Replace(bi, si),
                (None, Some((bi, si))) => Target::Empty(bi, si),
                (None, None) => Target::Link(idx),
            }
        };

        let kv_offset = inner.write_arena(ikey, value);
        let entry = Entry {
            hash,
            key_size: ikey.len() as u16,
            value_size: value.len() as u32,
            expires_at,
            kv_offset,
        };

        match target {
            Target::Replace(bi, si) => inner.buckets[bi].entries[si] = entry,
            Target::Empty(bi, si) => {
                inner.buckets[bi].entries[si] = entry;
                inner.count += 1;
            }
            Target::Link(last) => {
                let overflow = inner.buckets.len();
                inner.buckets.push(Bucket::default());
                inner.buckets[overflow].entries[0] = entry;
                inner.buckets[last].next = overflow as i64;
                inner.count += 1;
            }
        }
        Ok(())
    }

    /// Clears the staged record for a user key if it still carries the given
    /// sequence. Used to roll back a batch whose write failed part-way and to
    /// erase the staging of an aborted batch; a record already superseded by
    /// a newer sequence is left alone.
    pub(crate) fn unput(&self, hash: u32, key: &[u8], seq: u64) {
        let mut inner = self.write();
        let ikey_len = key.len() + INTERNAL_KEY_SUFFIX;

        let slot = {
            let mut idx = inner.bucket_index(hash);
            let mut found = None;
            'chain: loop {
                let bucket = &inner.buckets[idx];
                for (i, entry) in bucket.entries.iter().enumerate() {
                    if entry.is_empty() {
                        continue;
                    }
                    if entry.hash == hash && usize::from(entry.key_size) == ikey_len {
                        let ikey = inner.key_at(entry);
                        if &ikey[..key.len()] == key {
                            match parse_internal_key(ikey) {
                                Ok((_, staged_seq, _, _)) if staged_seq == seq => {
                                    found = Some((idx, i));
                                }
                                _ => {}
                            }
                            break 'chain;
                        }
                    }
                }
                if bucket.next == 0 {
                    break;
                }
                idx = bucket.next as usize;
            }
            found
        };

        if let Some((bi, si)) = slot {
            inner.buckets[bi].entries[si] = Entry::default();
            inner.count -= 1;
        }
    }

    /// Whether the fill ratio calls for a split.
    pub(crate) fn needs_split(&self) -> bool {
        let inner = self.read();
        inner.count as f64 / (u64::from(inner.n_buckets) * ENTRIES_PER_BUCKET as u64) as f64
            > LOAD_FACTOR
    }

    /// Doubles the bucket count and redistributes every staged entry by its
    /// fingerprint under the new modulus. Arena offsets are untouched.
    pub(crate) fn split(&self) -> Result<()> {
        let mut inner = self.write();
        let mut entries = Vec::with_capacity(inner.count as usize);
        for root in 0..inner.n_buckets as usize {
            let mut idx = root;
            loop {
                let bucket = &inner.buckets[idx];
                entries.extend(bucket.entries.iter().filter(|e| !e.is_empty()).copied());
                if bucket.next == 0 {
                    break;
                }
                idx = bucket.next as usize;
            }
        }

        inner.n_buckets *= 2;
        let n = inner.n_buckets;
        inner.buckets = vec![Bucket::default(); n as usize];
        for entry in entries {
            inner.place(entry);
        }
        debug!(n_buckets = n, "split staging table");
        Ok(())
    }

    /// Looks up the staged record for a user key, if any.
    pub(crate) fn lookup(&self, hash: u32, key: &[u8]) -> Option<StagedEntry> {
        let inner = self.read();
        let ikey_len = key.len() + INTERNAL_KEY_SUFFIX;
        let mut idx = inner.bucket_index(hash);
        loop {
            let bucket = &inner.buckets[idx];
            for entry in &bucket.entries {
                if entry.is_empty() {
                    continue;
                }
                if entry.hash == hash && usize::from(entry.key_size) == ikey_len {
                    let ikey = inner.key_at(entry);
                    if &ikey[..key.len()] == key {
                        let (_, seq, delete, expires_at) = parse_internal_key(ikey).ok()?;
                        return Some(StagedEntry {
                            seq,
                            delete,
                            expires_at,
                            value: inner.value_at(entry).to_vec(),
                        });
                    }
                }
            }
            if bucket.next == 0 {
                return None;
            }
            idx = bucket.next as usize;
        }
    }

    /// Feeds every staged record with sequence in `(lower, upper]` to
    /// `apply` as `(delete, hash, user_key, value, expires_at)`, scanning
    /// bucket chains starting at the first key's bucket and wrapping over
    /// the whole table. Returns the number of records applied.
    ///
    /// Expired records are skipped; malformed internal keys are logged and
    /// skipped. The scan stops early once `upper - lower` records have been
    /// applied (surfaced internally as [`Error::BatchSeqComplete`]).
    pub(crate) fn scan_range<F>(
        &self,
        first_key_hash: u32,
        lower: u64,
        upper: u64,
        mut apply: F,
    ) -> Result<u64>
    where
        F: FnMut(bool, u32, &[u8], &[u8], u32) -> Result<()>,
    {
        let inner = self.read();
        let target = upper - lower;
        let mut applied = 0u64;
        let start = inner.bucket_index(first_key_hash);
        let n = inner.n_buckets as usize;

        let scan = (|| -> Result<()> {
            for step in 0..n {
                let mut idx = (start + step) % n;
                loop {
                    let bucket = &inner.buckets[idx];
                    for entry in &bucket.entries {
                        if entry.is_empty() || is_expired(entry.expires_at) {
                            continue;
                        }
                        let ikey = inner.key_at(entry);
                        let (ukey, seq, delete, expires_at) = match parse_internal_key(ikey) {
                            Ok(parsed) => parsed,
                            Err(e) => {
                                warn!(error = %e, "skipping malformed staged record");
                                continue;
                            }
                        };
                        if seq <= lower || seq > upper {
                            continue;
                        }
                        apply(delete, entry.hash, ukey, inner.value_at(entry), expires_at)?;
                        applied += 1;
                        if applied == target {
                            return Err(Error::BatchSeqComplete);
                        }
                    }
                    if bucket.next == 0 {
                        break;
                    }
                    idx = bucket.next as usize;
                }
            }
            Ok(())
        })();

        match scan {
            Ok(()) | Err(Error::BatchSeqComplete) => Ok(applied),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{fingerprint, make_internal_key};

    fn staged(mem: &Memdb, key: &[u8], seq: u64, delete: bool, value: &[u8]) {
        let ikey = make_internal_key(key, seq, delete, 0);
        mem.put(fingerprint(key), &ikey, value, 0).unwrap();
    }

    #[test]
    fn test_put_and_lookup() {
        let mem = Memdb::new(1024);
        staged(&mem, b"k1", 1, false, b"v1");

        let hit = mem.lookup(fingerprint(b"k1"), b"k1").unwrap();
        assert_eq!(hit.seq, 1);
        assert!(!hit.delete);
        assert_eq!(hit.value, b"v1");
        assert!(mem.lookup(fingerprint(b"nope"), b"nope").is_none());
    }

    #[test]
    fn test_put_replaces_by_user_key() {
        let mem = Memdb::new(1024);
        staged(&mem, b"k1", 1, false, b"v1");
        staged(&mem, b"k1", 2, false, b"v2");

        let hit = mem.lookup(fingerprint(b"k1"), b"k1").unwrap();
        assert_eq!(hit.seq, 2);
        assert_eq!(hit.value, b"v2");
        assert_eq!(mem.count(), 1);
    }

    #[test]
    fn test_delete_record_staged() {
        let mem = Memdb::new(1024);
        staged(&mem, b"k1", 1, false, b"v1");
        staged(&mem, b"k1", 2, true, b"");

        let hit = mem.lookup(fingerprint(b"k1"), b"k1").unwrap();
        assert!(hit.delete);
    }

    #[test]
    fn test_split_preserves_entries() {
        let mem = Memdb::new(1 << 16);
        for i in 0..500u32 {
            let key = format!("key-{i}").into_bytes();
            staged(&mem, &key, u64::from(i) + 1, false, &i.to_le_bytes());
        }
        assert!(mem.needs_split());
        mem.split().unwrap();

        for i in 0..500u32 {
            let key = format!("key-{i}").into_bytes();
            let hit = mem.lookup(fingerprint(&key), &key).unwrap();
            assert_eq!(hit.value, i.to_le_bytes());
        }
        assert_eq!(mem.count(), 500);
    }

    #[test]
    fn test_conflict_detection() {
        let mem = Memdb::new(1024);
        let hash = fingerprint(b"contested");
        assert!(!mem.has_conflict(hash));

        mem.publish(7, vec![hash]);
        assert!(mem.has_conflict(hash));

        mem.retire(7);
        assert!(!mem.has_conflict(hash));
    }

    #[test]
    fn test_scan_range_bounds() {
        let mem = Memdb::new(1024);
        staged(&mem, b"a", 1, false, b"va");
        staged(&mem, b"b", 2, false, b"vb");
        staged(&mem, b"c", 3, false, b"vc");

        // Range (1, 3] picks up seq 2 and 3 only.
        let mut seen = Vec::new();
        let applied = mem
            .scan_range(fingerprint(b"b"), 1, 3, |_, _, key, value, _| {
                seen.push((key.to_vec(), value.to_vec()));
                Ok(())
            })
            .unwrap();

        assert_eq!(applied, 2);
        seen.sort();
        assert_eq!(
            seen,
            vec![
                (b"b".to_vec(), b"vb".to_vec()),
                (b"c".to_vec(), b"vc".to_vec())
            ]
        );
    }

    #[test]
    fn test_unput_clears_only_matching_seq() {
        let mem = Memdb::new(1024);
        staged(&mem, b"k1", 1, false, b"v1");

        // Wrong sequence leaves the record alone.
        mem.unput(fingerprint(b"k1"), b"k1", 9);
        assert!(mem.lookup(fingerprint(b"k1"), b"k1").is_some());

        mem.unput(fingerprint(b"k1"), b"k1", 1);
        assert!(mem.lookup(fingerprint(b"k1"), b"k1").is_none());
        assert_eq!(mem.count(), 0);
    }

    #[test]
    fn test_refcount_lifecycle() {
        let mem = Memdb::new(64);
        assert_eq!(mem.refs(), 1);
        mem.incref();
        assert_eq!(mem.refs(), 2);
        assert_eq!(mem.decref(), 1);
        assert_eq!(mem.decref(), 0);
    }

    #[test]
    fn test_seq_monotonic() {
        let mem = Memdb::new(64);
        mem.set_seq(5);
        mem.set_seq(3);
        assert_eq!(mem.get_seq(), 5);
    }
}

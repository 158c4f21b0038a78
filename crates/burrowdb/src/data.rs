//! On-disk data heap.
//!
//! The data file is a sequence of variable-length `key || value` blobs
//! addressed by `kv_offset`; blobs carry no self-description — sizes come
//! from the owning bucket entry. Reclaimed extents are tracked only in the
//! lease allocator, whose zones persist in the file header.
//!
//! ## File layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  Header (64 bytes)                            │
//! │  - Magic: "BDAT" (4 bytes)                    │
//! │  - Version: u16 = 1                           │
//! │  - Reserved: 2 bytes                          │
//! │  - Free-block zones (32 bytes)                │
//! ├──────────────────────────────────────────────┤
//! │  key || value blobs                           │
//! └──────────────────────────────────────────────┘
//! ```

use crate::bucket::Entry;
use crate::error::{Error, Result};
use crate::file::{BlockFile, FreeBlock, FREE_BLOCK_SIZE};
use crate::key::is_expired;
use std::path::Path;

/// Magic bytes for the data file header.
const DATA_MAGIC: [u8; 4] = *b"BDAT";

/// Data file format version.
const DATA_VERSION: u16 = 1;

/// Header size; `kv_offset` 0 is never valid because blobs start past it.
const DATA_HEADER_SIZE: u64 = 64;

/// The data heap: blob storage plus the free-space lease.
#[derive(Debug)]
pub(crate) struct DataTable {
    file: BlockFile,
    lease: FreeBlock,
}

impl DataTable {
    /// Opens (creating if absent) the data file at `path`.
    pub(crate) fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = BlockFile::open(path)?;
        let lease = if file.size() == 0 {
            file.allocate(DATA_HEADER_SIZE)?;
            let table = Self {
                file,
                lease: FreeBlock::default(),
            };
            table.write_header()?;
            return Ok(table);
        } else {
            let mut buf = [0u8; DATA_HEADER_SIZE as usize];
            file.read_exact_at(&mut buf, 0)?;
            if buf[0..4] != DATA_MAGIC {
                return Err(Error::InvalidSignature {
                    expected: DATA_MAGIC,
                    actual: buf[0..4].try_into().unwrap(),
                });
            }
            let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
            if version != DATA_VERSION {
                return Err(Error::UnsupportedVersion(version));
            }
            FreeBlock::read_from(&buf[8..8 + FREE_BLOCK_SIZE])
        };
        Ok(Self { file, lease })
    }

    /// Persists the header, including the current lease zones.
    pub(crate) fn write_header(&self) -> Result<()> {
        let mut buf = [0u8; DATA_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&DATA_MAGIC);
        buf[4..6].copy_from_slice(&DATA_VERSION.to_le_bytes());
        self.lease.write_to(&mut buf[8..8 + FREE_BLOCK_SIZE]);
        self.file.write_all_at(&buf, 0)
    }

    /// Writes a `key || value` blob, reusing a leased extent when one fits,
    /// appending otherwise. Returns the blob offset.
    pub(crate) fn write_key_value(&mut self, key: &[u8], value: &[u8]) -> Result<i64> {
        let len = (key.len() + value.len()) as i64;
        let off = match self.lease.allocate(len) {
            Some(off) => off,
            None => self.file.allocate(len as u64)? as i64,
        };
        let mut blob = Vec::with_capacity(len as usize);
        blob.extend_from_slice(key);
        blob.extend_from_slice(value);
        self.file.write_all_at(&blob, off as u64)?;
        Ok(off)
    }

    /// Reads the key portion of an entry's blob.
    pub(crate) fn read_key(&self, entry: &Entry) -> Result<Vec<u8>> {
        let mut key = vec![0u8; usize::from(entry.key_size)];
        self.file.read_exact_at(&mut key, entry.kv_offset as u64)?;
        Ok(key)
    }

    /// Reads an entry's full blob, split into `(key, value)`.
    ///
    /// Returns [`Error::KeyExpired`] when the entry's expiry has passed.
    pub(crate) fn read_key_value(&self, entry: &Entry) -> Result<(Vec<u8>, Vec<u8>)> {
        if is_expired(entry.expires_at) {
            return Err(Error::KeyExpired);
        }
        let mut blob = vec![0u8; entry.kv_size() as usize];
        self.file.read_exact_at(&mut blob, entry.kv_offset as u64)?;
        let value = blob.split_off(usize::from(entry.key_size));
        Ok((blob, value))
    }

    /// Returns a blob extent to the lease.
    pub(crate) fn free(&mut self, size: u32, offset: i64) {
        self.lease.free(offset, i64::from(size));
    }

    /// Flushes the header and contents to stable storage.
    pub(crate) fn sync(&self) -> Result<()> {
        self.write_header()?;
        self.file.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::unix_now;
    use tempfile::TempDir;

    fn entry_for(offset: i64, key: &[u8], value: &[u8], expires_at: u32) -> Entry {
        Entry {
            hash: 0,
            key_size: key.len() as u16,
            value_size: value.len() as u32,
            expires_at,
            kv_offset: offset,
        }
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut table = DataTable::open(dir.path().join("burrow.data")).unwrap();

        let off = table.write_key_value(b"sensor/1", b"23.5").unwrap();
        assert!(off >= DATA_HEADER_SIZE as i64);

        let entry = entry_for(off, b"sensor/1", b"23.5", 0);
        assert_eq!(table.read_key(&entry).unwrap(), b"sensor/1");

        let (key, value) = table.read_key_value(&entry).unwrap();
        assert_eq!(key, b"sensor/1");
        assert_eq!(value, b"23.5");
    }

    #[test]
    fn test_expired_entry_read_fails() {
        let dir = TempDir::new().unwrap();
        let mut table = DataTable::open(dir.path().join("burrow.data")).unwrap();

        let off = table.write_key_value(b"k", b"v").unwrap();
        let entry = entry_for(off, b"k", b"v", unix_now().saturating_sub(10));

        assert!(matches!(
            table.read_key_value(&entry),
            Err(Error::KeyExpired)
        ));
    }

    #[test]
    fn test_freed_extent_is_reused() {
        let dir = TempDir::new().unwrap();
        let mut table = DataTable::open(dir.path().join("burrow.data")).unwrap();

        let off = table.write_key_value(b"abcd", b"efgh").unwrap();
        table.free(8, off);

        // Same-size write lands on the freed extent instead of appending.
        let off2 = table.write_key_value(b"ijkl", b"mnop").unwrap();
        assert_eq!(off2, off);
    }

    #[test]
    fn test_lease_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("burrow.data");
        let off;
        {
            let mut table = DataTable::open(&path).unwrap();
            off = table.write_key_value(b"abcd", b"efgh").unwrap();
            table.free(8, off);
            table.sync().unwrap();
        }

        let mut table = DataTable::open(&path).unwrap();
        let off2 = table.write_key_value(b"wxyz", b"wxyz").unwrap();
        assert_eq!(off2, off);
    }
}

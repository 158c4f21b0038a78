//! Bucket and entry layout shared by the staging table and the durable index.
//!
//! ## On-disk bucket block (512 bytes)
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Entry × 22 (22 bytes each)                                  │
//! │  - hash: u32                                                 │
//! │  - key_size: u16                                             │
//! │  - value_size: u32                                           │
//! │  - expires_at: u32                                           │
//! │  - kv_offset: i64 (0 ⇒ empty slot)                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  next: i64 (absolute offset of the overflow bucket, 0 ⇒ none)│
//! ├─────────────────────────────────────────────────────────────┤
//! │  Reserved: 20 bytes                                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Buckets form a singly-linked chain from `bucket[hash mod N]`; chains grow
//! by appending overflow buckets linked by absolute offset, never by owning
//! pointers.

/// Number of entry slots per bucket.
pub(crate) const ENTRIES_PER_BUCKET: usize = 22;

/// Serialized entry size in bytes.
pub(crate) const ENTRY_SIZE: usize = 22;

/// Serialized bucket block size in bytes, padded to a power of two.
pub(crate) const BUCKET_SIZE: usize = 512;

/// Fill ratio above which the staging table splits its bucket array.
pub(crate) const LOAD_FACTOR: f64 = 0.7;

/// Metadata record locating a `key || value` blob in a data heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Entry {
    /// Fingerprint of the user key.
    pub(crate) hash: u32,
    /// Stored key length. The staging table stores internal keys here; the
    /// durable index stores user keys.
    pub(crate) key_size: u16,
    /// Stored value length.
    pub(crate) value_size: u32,
    /// Expiry time in unix seconds, 0 for no expiry.
    pub(crate) expires_at: u32,
    /// Offset of the `key || value` blob; 0 marks an empty slot.
    pub(crate) kv_offset: i64,
}

impl Entry {
    /// Total blob size addressed by this entry.
    pub(crate) fn kv_size(&self) -> u32 {
        u32::from(self.key_size) + self.value_size
    }

    /// Whether the slot holds no entry.
    pub(crate) fn is_empty(&self) -> bool {
        self.kv_offset == 0
    }

    fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.hash.to_le_bytes());
        buf[4..6].copy_from_slice(&self.key_size.to_le_bytes());
        buf[6..10].copy_from_slice(&self.value_size.to_le_bytes());
        buf[10..14].copy_from_slice(&self.expires_at.to_le_bytes());
        buf[14..22].copy_from_slice(&self.kv_offset.to_le_bytes());
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            hash: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            key_size: u16::from_le_bytes(buf[4..6].try_into().unwrap()),
            value_size: u32::from_le_bytes(buf[6..10].try_into().unwrap()),
            expires_at: u32::from_le_bytes(buf[10..14].try_into().unwrap()),
            kv_offset: i64::from_le_bytes(buf[14..22].try_into().unwrap()),
        }
    }
}

/// A fixed array of entry slots plus the overflow link.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Bucket {
    /// Entry slots, filled front to back.
    pub(crate) entries: [Entry; ENTRIES_PER_BUCKET],
    /// Absolute offset (durable index) or arena index (staging table) of the
    /// overflow bucket; 0 means the chain ends here.
    pub(crate) next: i64,
}

impl Default for Bucket {
    fn default() -> Self {
        Self {
            entries: [Entry::default(); ENTRIES_PER_BUCKET],
            next: 0,
        }
    }
}

impl Bucket {
    /// Serializes the bucket into a 512-byte block.
    pub(crate) fn write_to(&self, buf: &mut [u8; BUCKET_SIZE]) {
        for (i, entry) in self.entries.iter().enumerate() {
            entry.write_to(&mut buf[i * ENTRY_SIZE..(i + 1) * ENTRY_SIZE]);
        }
        let off = ENTRIES_PER_BUCKET * ENTRY_SIZE;
        buf[off..off + 8].copy_from_slice(&self.next.to_le_bytes());
    }

    /// Reads a bucket back from a 512-byte block.
    pub(crate) fn read_from(buf: &[u8; BUCKET_SIZE]) -> Self {
        let mut bucket = Self::default();
        for (i, entry) in bucket.entries.iter_mut().enumerate() {
            *entry = Entry::read_from(&buf[i * ENTRY_SIZE..(i + 1) * ENTRY_SIZE]);
        }
        let off = ENTRIES_PER_BUCKET * ENTRY_SIZE;
        bucket.next = i64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        bucket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_layout_fits_block() {
        assert!(ENTRIES_PER_BUCKET * ENTRY_SIZE + 8 <= BUCKET_SIZE);
    }

    #[test]
    fn test_bucket_round_trip() {
        let mut bucket = Bucket::default();
        bucket.entries[0] = Entry {
            hash: 0xDEAD_BEEF,
            key_size: 12,
            value_size: 345,
            expires_at: 1_700_000_000,
            kv_offset: 8192,
        };
        bucket.entries[ENTRIES_PER_BUCKET - 1] = Entry {
            hash: 7,
            key_size: 1,
            value_size: 1,
            expires_at: 0,
            kv_offset: 64,
        };
        bucket.next = 123_456;

        let mut buf = [0u8; BUCKET_SIZE];
        bucket.write_to(&mut buf);
        let decoded = Bucket::read_from(&buf);

        assert_eq!(decoded.entries[0], bucket.entries[0]);
        assert_eq!(
            decoded.entries[ENTRIES_PER_BUCKET - 1],
            bucket.entries[ENTRIES_PER_BUCKET - 1]
        );
        assert_eq!(decoded.next, 123_456);
        assert!(decoded.entries[1].is_empty());
    }

    #[test]
    fn test_entry_kv_size() {
        let entry = Entry {
            key_size: 10,
            value_size: 90,
            ..Default::default()
        };
        assert_eq!(entry.kv_size(), 100);
    }
}

//! Positioned file I/O and the two-zone free-block lease.
//!
//! [`BlockFile`] wraps a [`std::fs::File`] with pread/pwrite style access,
//! size-tracked allocation at the tail, truncation and fsync. [`FreeBlock`]
//! is a deliberately simple lease allocator over a data file: one *stable*
//! region and one *current* region rotate through reclaimed extents. Adjacent
//! frees coalesce into a zone; non-adjacent frees are dropped, on the
//! expectation that batch-shaped reclaim is predominantly adjacent and the
//! cyclic rotation reabsorbs stragglers when the stable zone collapses into
//! the current one.

use crate::error::Result;
use std::fs::{File, OpenOptions};
use std::path::Path;
use tracing::debug;

/// A file with positioned reads and writes plus tail allocation.
#[derive(Debug)]
pub(crate) struct BlockFile {
    file: File,
    size: u64,
}

impl BlockFile {
    /// Opens (creating if absent) the file at `path`.
    pub(crate) fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }

    /// Current file size in bytes.
    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    /// Extends the file by `n` bytes, returning the old end of file.
    pub(crate) fn allocate(&mut self, n: u64) -> Result<u64> {
        let off = self.size;
        self.size += n;
        self.file.set_len(self.size)?;
        Ok(off)
    }

    /// Truncates the file to `n` bytes.
    pub(crate) fn truncate(&mut self, n: u64) -> Result<()> {
        self.file.set_len(n)?;
        self.size = n;
        Ok(())
    }

    /// Reads exactly `buf.len()` bytes starting at `offset`.
    #[cfg(unix)]
    pub(crate) fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        std::os::unix::fs::FileExt::read_exact_at(&self.file, buf, offset)?;
        Ok(())
    }

    /// Writes the whole of `buf` starting at `offset`.
    #[cfg(unix)]
    pub(crate) fn write_all_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        std::os::unix::fs::FileExt::write_all_at(&self.file, buf, offset)?;
        Ok(())
    }

    /// Reads exactly `buf.len()` bytes starting at `offset`.
    #[cfg(windows)]
    pub(crate) fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> Result<()> {
        while !buf.is_empty() {
            match std::os::windows::fs::FileExt::seek_read(&self.file, buf, offset) {
                Ok(0) => break,
                Ok(n) => {
                    let tmp = buf;
                    buf = &mut tmp[n..];
                    offset += n as u64;
                }
                Err(e) => return Err(e.into()),
            }
        }
        if !buf.is_empty() {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        Ok(())
    }

    /// Writes the whole of `buf` starting at `offset`.
    #[cfg(windows)]
    pub(crate) fn write_all_at(&self, mut buf: &[u8], mut offset: u64) -> Result<()> {
        while !buf.is_empty() {
            match std::os::windows::fs::FileExt::seek_write(&self.file, buf, offset) {
                Ok(0) => {
                    return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
                }
                Ok(n) => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Flushes file contents and metadata to stable storage.
    pub(crate) fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// On-disk size of a serialized [`FreeBlock`]: four 8-byte fields.
pub(crate) const FREE_BLOCK_SIZE: usize = 32;

/// Two-zone cyclic lease allocator over a file's reclaimed extents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct FreeBlock {
    /// Start of the stable free region.
    pub(crate) offset: i64,
    /// Size of the stable free region.
    pub(crate) size: i64,
    /// Start of the current free region used for cyclic rotation.
    pub(crate) curr_offset: i64,
    /// Size of the current free region.
    pub(crate) curr_size: i64,
}

impl FreeBlock {
    /// Carves `n` bytes from the current region's tail, falling back to the
    /// stable region. Returns `None` when neither zone fits, forcing the
    /// caller to append.
    pub(crate) fn allocate(&mut self, n: i64) -> Option<i64> {
        if self.curr_size >= n {
            self.curr_size -= n;
            return Some(self.curr_offset + self.curr_size);
        }
        if self.size >= n {
            self.size -= n;
            return Some(self.offset + self.size);
        }
        None
    }

    /// Returns a freed extent to the lease. Only extents adjacent to one of
    /// the zones coalesce; anything else is dropped.
    pub(crate) fn free(&mut self, off: i64, size: i64) {
        if size == 0 {
            return;
        }
        if off + size == self.curr_offset {
            self.curr_offset = off;
            self.curr_size += size;
        } else if self.curr_offset + self.curr_size == off {
            self.curr_size += size;
        } else if self.offset + self.size == off {
            self.size += size;
        } else if off + size == self.offset {
            self.offset = off;
            self.size += size;
        } else {
            debug!(off, size, "dropping non-adjacent freed extent");
        }
    }

    /// Serializes the zones into their 32-byte on-disk form.
    pub(crate) fn write_to(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..16].copy_from_slice(&self.size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.curr_offset.to_le_bytes());
        buf[24..32].copy_from_slice(&self.curr_size.to_le_bytes());
    }

    /// Reads the zones back from their 32-byte on-disk form.
    pub(crate) fn read_from(buf: &[u8]) -> Self {
        Self {
            offset: i64::from_le_bytes(buf[0..8].try_into().unwrap()),
            size: i64::from_le_bytes(buf[8..16].try_into().unwrap()),
            curr_offset: i64::from_le_bytes(buf[16..24].try_into().unwrap()),
            curr_size: i64::from_le_bytes(buf[24..32].try_into().unwrap()),
        }
    }
}

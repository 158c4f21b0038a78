//! Write-Ahead Log for staged batches.
//!
//! The WAL is the durable record of batches that have been staged in memory
//! but not yet applied to the bucket index. Each batch becomes one log
//! record; a record moves through `reserved → written → applied → reclaimed`:
//! *reserved* while its extent is being carved (in memory only), *written*
//! once the fsync'd header and payload are on disk, *applied* after the
//! commit lands in the index, and *reclaimed* when its extent merges back
//! into the free-block zones for reuse by a later append.
//!
//! # File layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Header (512 bytes)                                          │
//! │  - Magic: "BWAL" (4 bytes)                                   │
//! │  - Version: u16 = 1                                          │
//! │  - Reserved: 2 bytes                                         │
//! │  - Sequence: u64                                             │
//! │  - Free-block zones (32 bytes)                               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Log records, 512-byte aligned (repeated)                    │
//! │  - Log header (48 bytes): status, payload CRC, seq,          │
//! │    upper seq, payload size, own offset, entry count          │
//! │  - Payload: length-prefixed sub-records                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Payload sub-records are self-delimited: a 4-byte little-endian length
//! counting the whole sub-record (prefix included) followed by the record
//! bytes. A crash between *written* and *applied* is the expected recovery
//! case: the replayer re-reads each written log and re-applies its payload,
//! idempotently by sequence and key.

use crate::error::{Error, Result};
use crate::file::{BlockFile, FreeBlock, FREE_BLOCK_SIZE};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

/// Magic bytes for the WAL file header.
const WAL_MAGIC: [u8; 4] = *b"BWAL";

/// WAL format version.
const WAL_VERSION: u16 = 1;

/// Header block size.
const HEADER_SIZE: i64 = 512;

/// Serialized log header size.
const LOG_HEADER_SIZE: i64 = 48;

/// Alignment unit for log records.
const BLOCK_SIZE: i64 = 512;

/// Rounds `n` up to the next block boundary.
fn align_size(n: i64) -> i64 {
    (n + BLOCK_SIZE - 1) & !(BLOCK_SIZE - 1)
}

/// Status of a log record on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
enum LogStatus {
    /// Written and fsync'd, not yet applied to the index. Loaded at
    /// recovery.
    Written = 0,
    /// Applied to the index; the extent is reclaimable.
    Applied = 1,
}

/// In-memory descriptor of one log record.
#[derive(Debug, Clone, Copy)]
struct LogInfo {
    status: LogStatus,
    entry_count: u32,
    crc: u32,
    seq: u64,
    upper_seq: u64,
    size: u64,
    offset: i64,
}

impl LogInfo {
    fn write_to(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&(self.status as u16).to_le_bytes());
        buf[4..8].copy_from_slice(&self.crc.to_le_bytes());
        buf[8..16].copy_from_slice(&self.seq.to_le_bytes());
        buf[16..24].copy_from_slice(&self.upper_seq.to_le_bytes());
        buf[24..32].copy_from_slice(&self.size.to_le_bytes());
        buf[32..40].copy_from_slice(&self.offset.to_le_bytes());
        buf[40..44].copy_from_slice(&self.entry_count.to_le_bytes());
    }

    fn read_from(buf: &[u8]) -> Option<Self> {
        let status = match u16::from_le_bytes(buf[0..2].try_into().unwrap()) {
            0 => LogStatus::Written,
            1 => LogStatus::Applied,
            _ => return None,
        };
        Some(Self {
            status,
            entry_count: u32::from_le_bytes(buf[40..44].try_into().unwrap()),
            crc: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            seq: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            upper_seq: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            size: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            offset: i64::from_le_bytes(buf[32..40].try_into().unwrap()),
        })
    }

    fn extent(&self) -> i64 {
        align_size(self.size as i64 + LOG_HEADER_SIZE)
    }
}

struct WalInner {
    file: BlockFile,
    logs: Vec<LogInfo>,
    fb: FreeBlock,
}

/// Write-ahead log over a single file.
pub struct Wal {
    inner: RwLock<WalInner>,
    seq: AtomicU64,
    count: AtomicI64,
    closed: AtomicBool,
}

impl Wal {
    /// Opens a WAL at `path`, creating it when absent.
    ///
    /// Returns the WAL and whether written-but-unapplied logs were found —
    /// the previous run did not shut down cleanly and the caller should
    /// replay them. With `reset` the file is reinitialized and recovery
    /// skipped.
    pub fn open(path: impl AsRef<Path>, reset: bool) -> Result<(Self, bool)> {
        let mut file = BlockFile::open(path)?;
        if reset && file.size() != 0 {
            warn!("resetting write-ahead log");
            file.truncate(0)?;
        }

        if file.size() == 0 {
            file.allocate(HEADER_SIZE as u64)?;
            let wal = Self {
                inner: RwLock::new(WalInner {
                    file,
                    logs: Vec::new(),
                    fb: FreeBlock {
                        offset: HEADER_SIZE,
                        size: 0,
                        curr_offset: HEADER_SIZE,
                        curr_size: 0,
                    },
                }),
                seq: AtomicU64::new(0),
                count: AtomicI64::new(0),
                closed: AtomicBool::new(false),
            };
            wal.write_header(&mut wal.write_inner())?;
            wal.write_inner().file.sync()?;
            return Ok((wal, false));
        }

        // Existing file: read the header back, then recover log headers.
        let mut buf = [0u8; 48];
        file.read_exact_at(&mut buf, 0)?;
        if buf[0..4] != WAL_MAGIC {
            return Err(Error::InvalidSignature {
                expected: WAL_MAGIC,
                actual: buf[0..4].try_into().unwrap(),
            });
        }
        let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        if version != WAL_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let seq = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let fb = FreeBlock::read_from(&buf[16..16 + FREE_BLOCK_SIZE]);

        let wal = Self {
            inner: RwLock::new(WalInner {
                file,
                logs: Vec::new(),
                fb,
            }),
            seq: AtomicU64::new(seq),
            count: AtomicI64::new(0),
            closed: AtomicBool::new(false),
        };
        wal.recover()?;
        let needs_recovery = !wal.read_inner().logs.is_empty();
        Ok((wal, needs_recovery))
    }

    /// Walks log headers from the end of the file header, collecting written
    /// logs. The file is first truncated to block alignment so iteration
    /// lands on record boundaries; the active free region is skipped.
    fn recover(&self) -> Result<()> {
        let wal_seq = self.seq.load(Ordering::Acquire);
        let mut inner = self.write_inner();

        let aligned = align_size(inner.file.size() as i64);
        inner.file.truncate(aligned as u64)?;

        let mut offset = HEADER_SIZE;
        let mut recovered = Vec::new();
        loop {
            let mut buf = [0u8; LOG_HEADER_SIZE as usize];
            match inner.file.read_exact_at(&mut buf, offset as u64) {
                Ok(()) => {}
                Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let info = match LogInfo::read_from(&buf) {
                Some(info) => info,
                None => break,
            };
            if info.seq == 0 || info.seq > wal_seq {
                break;
            }
            if info.status == LogStatus::Written {
                self.count.fetch_add(1, Ordering::AcqRel);
                recovered.push(info);
            }
            offset = info.offset + info.extent();
            if offset == inner.fb.curr_offset {
                offset += inner.fb.curr_size;
            }
        }

        debug!(logs = recovered.len(), "recovered written log headers");
        inner.logs = recovered;
        Ok(())
    }

    fn read_inner(&self) -> RwLockReadGuard<'_, WalInner> {
        self.inner.read().unwrap_or_else(|err| err.into_inner())
    }

    fn write_inner(&self) -> RwLockWriteGuard<'_, WalInner> {
        self.inner.write().unwrap_or_else(|err| err.into_inner())
    }

    fn write_header(&self, inner: &mut WalInner) -> Result<()> {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&WAL_MAGIC);
        buf[4..6].copy_from_slice(&WAL_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.seq.load(Ordering::Acquire).to_le_bytes());
        inner.fb.write_to(&mut buf[16..16 + FREE_BLOCK_SIZE]);
        inner.file.write_all_at(&buf, 0)
    }

    fn ok(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::WalClosed);
        }
        Ok(())
    }

    /// Allocates the next per-log sequence.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Appends one log record and fsyncs it.
    ///
    /// The extent comes from the free-block zones when a reclaimed one fits,
    /// otherwise from the end of the file. Returns the log's sequence.
    pub fn append(&self, entry_count: u32, upper_seq: u64, payload: &[u8]) -> Result<u64> {
        self.ok()?;
        let seq = self.next_seq();
        let mut inner = self.write_inner();

        let need = align_size(LOG_HEADER_SIZE + payload.len() as i64);
        let offset = match inner.fb.allocate(need) {
            Some(off) => off,
            None => inner.file.allocate(need as u64)? as i64,
        };

        let info = LogInfo {
            status: LogStatus::Written,
            entry_count,
            crc: crc32fast::hash(payload),
            seq,
            upper_seq,
            size: payload.len() as u64,
            offset,
        };

        let mut buf = vec![0u8; need as usize];
        info.write_to(&mut buf[..LOG_HEADER_SIZE as usize]);
        buf[LOG_HEADER_SIZE as usize..LOG_HEADER_SIZE as usize + payload.len()]
            .copy_from_slice(payload);
        inner.file.write_all_at(&buf, offset as u64)?;
        self.write_header(&mut inner)?;
        inner.file.sync()?;

        Self::put(&mut inner, &self.count, info);
        Ok(seq)
    }

    /// Upserts a log descriptor keyed by its offset.
    fn put(inner: &mut WalInner, count: &AtomicI64, info: LogInfo) {
        if let Some(log) = inner.logs.iter_mut().find(|l| l.offset == info.offset) {
            *log = info;
        } else {
            count.fetch_add(1, Ordering::AcqRel);
            inner.logs.push(info);
        }
    }

    /// Returns `(seq, upper_seq)` for every written-but-unapplied log,
    /// ordered by upper sequence. Drives recovery at startup.
    pub fn scan(&self) -> Result<Vec<(u64, u64)>> {
        self.ok()?;
        let inner = self.read_inner();
        let mut seqs: Vec<(u64, u64)> = inner
            .logs
            .iter()
            .filter(|l| l.status == LogStatus::Written)
            .map(|l| (l.seq, l.upper_seq))
            .collect();
        seqs.sort_by_key(|&(_, upper)| upper);
        Ok(seqs)
    }

    /// Reads the payload of the written log with the given sequence,
    /// returning an iterator over its sub-records.
    pub fn read(&self, seq: u64) -> Result<LogReader> {
        self.ok()?;
        let inner = self.read_inner();
        let log = inner
            .logs
            .iter()
            .find(|l| l.seq == seq && l.entry_count > 0)
            .ok_or(Error::LogNotFound(seq))?;

        let mut data = vec![0u8; log.size as usize];
        inner
            .file
            .read_exact_at(&mut data, (log.offset + LOG_HEADER_SIZE) as u64)?;

        let actual = crc32fast::hash(&data);
        if actual != log.crc {
            return Err(Error::ChecksumMismatch {
                expected: log.crc,
                actual,
            });
        }
        Ok(LogReader {
            data,
            entry_count: log.entry_count,
            offset: 0,
        })
    }

    /// Marks every written log with `upper_seq` at or below the given bound
    /// as applied, persists the status in place, and merges the reclaimed
    /// extents into the free-block zones in offset order.
    pub fn signal_log_applied(&self, upper_seq: u64) -> Result<()> {
        self.ok()?;
        let mut inner = self.write_inner();

        // Offset order lets adjacent extents merge as they are released.
        inner.logs.sort_by_key(|l| l.offset);
        for i in 0..inner.logs.len() {
            if inner.logs[i].status == LogStatus::Written && inner.logs[i].upper_seq <= upper_seq {
                inner.logs[i].status = LogStatus::Applied;
                let mut buf = [0u8; LOG_HEADER_SIZE as usize];
                inner.logs[i].write_to(&mut buf);
                let off = inner.logs[i].offset as u64;
                inner.file.write_all_at(&buf, off)?;
                self.log_merge(&mut inner, i)?;
            }
        }
        Ok(())
    }

    /// Reclaims the log of an aborted batch: marks exactly the written log
    /// with the given `upper_seq` applied and merges its extent, leaving
    /// earlier written logs — which may belong to batches still in flight —
    /// untouched.
    pub fn signal_log_aborted(&self, upper_seq: u64) -> Result<()> {
        self.ok()?;
        let mut inner = self.write_inner();

        inner.logs.sort_by_key(|l| l.offset);
        for i in 0..inner.logs.len() {
            if inner.logs[i].status == LogStatus::Written && inner.logs[i].upper_seq == upper_seq {
                inner.logs[i].status = LogStatus::Applied;
                let mut buf = [0u8; LOG_HEADER_SIZE as usize];
                inner.logs[i].write_to(&mut buf);
                let off = inner.logs[i].offset as u64;
                inner.file.write_all_at(&buf, off)?;
                self.log_merge(&mut inner, i)?;
                break;
            }
        }
        Ok(())
    }

    /// Merges applied logs from index `i` upward into the free-block zones:
    /// extents adjacent to the current zone grow it, extents adjacent to the
    /// stable zone grow that, and a stable zone that has come to abut the
    /// current zone collapses into it.
    fn log_merge(&self, inner: &mut WalInner, idx: usize) -> Result<()> {
        for i in idx..inner.logs.len() {
            if inner.logs[i].status != LogStatus::Applied {
                continue;
            }
            let (offset, extent) = (inner.logs[i].offset, inner.logs[i].extent());
            if inner.fb.curr_offset + inner.fb.curr_size == offset {
                inner.fb.curr_size += extent;
            } else {
                if inner.fb.offset + inner.fb.size == offset {
                    inner.fb.size += extent;
                }
                if inner.fb.size != 0 && inner.fb.offset + inner.fb.size >= inner.fb.curr_offset {
                    inner.fb.curr_offset = inner.fb.offset;
                    inner.fb.curr_size += align_size(inner.fb.size);
                    inner.fb.size = 0;
                }
            }
        }
        self.write_header(inner)?;
        inner.file.sync()
    }

    /// Total logs tracked, applied ones included until their descriptors are
    /// recycled by an append reusing the extent.
    pub fn count(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }

    /// Persists the header and fsyncs the log file.
    pub fn sync(&self) -> Result<()> {
        self.ok()?;
        let mut inner = self.write_inner();
        self.write_header(&mut inner)?;
        inner.file.sync()
    }

    /// Closes the WAL. Further operations fail with [`Error::WalClosed`].
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::WalClosed);
        }
        let mut inner = self.write_inner();
        self.write_header(&mut inner)?;
        inner.file.sync()
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(e) = self.close() {
                warn!(error = %e, "failed to close WAL on drop");
            }
        }
    }
}

/// Iterator over the length-prefixed sub-records of one log payload.
pub struct LogReader {
    data: Vec<u8>,
    entry_count: u32,
    offset: usize,
}

impl LogReader {
    /// Remaining sub-records.
    pub fn count(&self) -> u32 {
        self.entry_count
    }

    /// Returns the next sub-record, or `None` when the payload is exhausted.
    pub fn next(&mut self) -> Option<&[u8]> {
        if self.entry_count == 0 {
            return None;
        }
        self.entry_count -= 1;
        let len =
            u32::from_le_bytes(self.data[self.offset..self.offset + 4].try_into().unwrap()) as usize;
        let record = &self.data[self.offset + 4..self.offset + len];
        self.offset += len;
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn frame(records: &[&[u8]]) -> Vec<u8> {
        let mut buf = Vec::new();
        for record in records {
            buf.extend_from_slice(&((record.len() + 4) as u32).to_le_bytes());
            buf.extend_from_slice(record);
        }
        buf
    }

    fn open_wal(dir: &TempDir) -> (Wal, bool) {
        Wal::open(dir.path().join("burrow.log"), false).unwrap()
    }

    #[test]
    fn test_align_size() {
        assert_eq!(align_size(0), 0);
        assert_eq!(align_size(1), 512);
        assert_eq!(align_size(512), 512);
        assert_eq!(align_size(513), 1024);
    }

    #[test]
    fn test_append_and_scan() {
        let dir = TempDir::new().unwrap();
        let (wal, needs_recovery) = open_wal(&dir);
        assert!(!needs_recovery);

        let seq = wal.append(2, 10, &frame(&[b"one", b"two"])).unwrap();
        assert_eq!(seq, 1);
        assert_eq!(wal.scan().unwrap(), vec![(1, 10)]);
        assert_eq!(wal.count(), 1);
    }

    #[test]
    fn test_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let (wal, _) = open_wal(&dir);

        let payload = frame(&[b"alpha", b"bravo", b"charlie"]);
        let seq = wal.append(3, 3, &payload).unwrap();

        let mut reader = wal.read(seq).unwrap();
        assert_eq!(reader.count(), 3);
        assert_eq!(reader.next().unwrap(), b"alpha");
        assert_eq!(reader.next().unwrap(), b"bravo");
        assert_eq!(reader.next().unwrap(), b"charlie");
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_read_unknown_seq_fails() {
        let dir = TempDir::new().unwrap();
        let (wal, _) = open_wal(&dir);
        assert!(matches!(wal.read(99), Err(Error::LogNotFound(99))));
    }

    #[test]
    fn test_signal_applied_clears_scan() {
        let dir = TempDir::new().unwrap();
        let (wal, _) = open_wal(&dir);

        wal.append(1, 5, &frame(&[b"a"])).unwrap();
        wal.append(1, 9, &frame(&[b"b"])).unwrap();

        wal.signal_log_applied(5).unwrap();
        assert_eq!(wal.scan().unwrap(), vec![(2, 9)]);

        wal.signal_log_applied(9).unwrap();
        assert!(wal.scan().unwrap().is_empty());
    }

    #[test]
    fn test_signal_aborted_leaves_earlier_logs() {
        let dir = TempDir::new().unwrap();
        let (wal, _) = open_wal(&dir);

        wal.append(1, 5, &frame(&[b"in-flight"])).unwrap();
        wal.append(1, 9, &frame(&[b"aborted"])).unwrap();

        wal.signal_log_aborted(9).unwrap();
        // The earlier written log is still pending recovery.
        assert_eq!(wal.scan().unwrap(), vec![(1, 5)]);
    }

    #[test]
    fn test_applied_extent_is_reused() {
        let dir = TempDir::new().unwrap();
        let (wal, _) = open_wal(&dir);

        wal.append(1, 1, &frame(&[b"first"])).unwrap();
        wal.signal_log_applied(1).unwrap();

        let size_before = wal.read_inner().file.size();
        wal.append(1, 2, &frame(&[b"second"])).unwrap();
        // The reclaimed extent absorbed the append; the file did not grow.
        assert_eq!(wal.read_inner().file.size(), size_before);
    }

    #[test]
    fn test_recovery_returns_written_only() {
        let dir = TempDir::new().unwrap();
        {
            let (wal, _) = open_wal(&dir);
            wal.append(1, 3, &frame(&[b"staged"])).unwrap();
            wal.append(1, 7, &frame(&[b"applied"])).unwrap();
            wal.signal_log_applied(3).unwrap();
            wal.close().unwrap();
        }

        let (wal, needs_recovery) = open_wal(&dir);
        assert!(needs_recovery);
        assert_eq!(wal.scan().unwrap(), vec![(2, 7)]);

        let mut reader = wal.read(2).unwrap();
        assert_eq!(reader.next().unwrap(), b"applied");
    }

    #[test]
    fn test_recovery_after_all_applied() {
        let dir = TempDir::new().unwrap();
        {
            let (wal, _) = open_wal(&dir);
            wal.append(1, 1, &frame(&[b"x"])).unwrap();
            wal.signal_log_applied(1).unwrap();
            wal.close().unwrap();
        }

        let (_, needs_recovery) = open_wal(&dir);
        assert!(!needs_recovery);
    }

    #[test]
    fn test_reset_skips_recovery() {
        let dir = TempDir::new().unwrap();
        {
            let (wal, _) = open_wal(&dir);
            wal.append(1, 1, &frame(&[b"x"])).unwrap();
            wal.close().unwrap();
        }

        let (wal, needs_recovery) =
            Wal::open(dir.path().join("burrow.log"), true).unwrap();
        assert!(!needs_recovery);
        assert!(wal.scan().unwrap().is_empty());
        // Sequences restart with the reset log.
        assert_eq!(wal.append(1, 1, &frame(&[b"y"])).unwrap(), 1);
    }

    #[test]
    fn test_corrupted_payload_fails_checksum() {
        let dir = TempDir::new().unwrap();
        let (wal, _) = open_wal(&dir);

        let seq = wal.append(1, 1, &frame(&[b"fragile"])).unwrap();
        {
            let inner = wal.read_inner();
            let off = inner.logs[0].offset + LOG_HEADER_SIZE;
            inner.file.write_all_at(&[0xFF], off as u64).unwrap();
        }

        assert!(matches!(
            wal.read(seq),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_closed_wal_rejects_operations() {
        let dir = TempDir::new().unwrap();
        let (wal, _) = open_wal(&dir);
        wal.close().unwrap();

        assert!(matches!(wal.append(1, 1, b""), Err(Error::WalClosed)));
        assert!(matches!(wal.scan(), Err(Error::WalClosed)));
        assert!(matches!(wal.close(), Err(Error::WalClosed)));
    }

    #[test]
    fn test_seq_continues_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let (wal, _) = open_wal(&dir);
            wal.append(1, 1, &frame(&[b"a"])).unwrap();
            wal.append(1, 2, &frame(&[b"b"])).unwrap();
            wal.close().unwrap();
        }

        let (wal, _) = open_wal(&dir);
        assert_eq!(wal.append(1, 3, &frame(&[b"c"])).unwrap(), 3);
    }
}

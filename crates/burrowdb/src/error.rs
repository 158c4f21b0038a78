//! Error and Result types for burrowdb operations.

use std::io;
use thiserror::Error;

/// A convenience `Result` type for burrowdb operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for store operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A batch record carried an empty key.
    #[error("Key is empty")]
    KeyEmpty,

    /// A batch record's key exceeds `MAX_KEY_LENGTH`.
    #[error("Key is too large: {0} bytes")]
    KeyTooLarge(usize),

    /// A batch record's value exceeds `MAX_VALUE_LENGTH`.
    #[error("Value is too large: {0} bytes")]
    ValueTooLarge(usize),

    /// The batch touches a fingerprint held by another in-flight batch.
    ///
    /// The write left no effect; the caller may retry once the conflicting
    /// batch commits or aborts.
    #[error("Write conflict with a concurrent batch")]
    WriteConflict,

    /// An entry was read past its `expires_at` time. Treated as a miss by
    /// the lookup paths.
    #[error("Key has expired")]
    KeyExpired,

    /// The store holds `MAX_KEYS` live entries and cannot accept more.
    #[error("Store is full")]
    Full,

    /// Internal sentinel: a commit scan has applied every record in its
    /// sequence range. Never surfaced to callers.
    #[error("Batch sequence range complete")]
    BatchSeqComplete,

    /// Operation attempted on a closed write-ahead log.
    #[error("WAL is closed")]
    WalClosed,

    /// No written log record exists for the requested sequence.
    #[error("Log for sequence {0} not found")]
    LogNotFound(u64),

    /// Invalid signature bytes in a file header.
    #[error("Invalid signature: expected {expected:?}, got {actual:?}")]
    InvalidSignature {
        /// The signature the file was expected to carry.
        expected: [u8; 4],
        /// The signature actually read.
        actual: [u8; 4],
    },

    /// Unsupported on-disk format version.
    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u16),

    /// Payload checksum does not match the value recorded in the log header.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// An internal key shorter than its fixed 12-byte suffix.
    #[error("Invalid internal key")]
    InvalidInternalKey,

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

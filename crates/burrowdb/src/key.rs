//! Key fingerprints and the internal key encoding.
//!
//! A user key is stored internally as `user_key || packed(8) || expires_at(4)`
//! where the packed little-endian field is `(seq << 8) | delete_bit`. The
//! 32-bit fingerprint of the user key drives bucket selection and conflict
//! detection.

use crate::error::{Error, Result};
use std::time::{SystemTime, UNIX_EPOCH};

/// Length of the fixed suffix appended to every internal key.
pub(crate) const INTERNAL_KEY_SUFFIX: usize = 12;

/// Maximum value possible for a sequence number; the low 8 bits of the
/// packed field carry the delete flag, so both fit a single 64-bit integer.
pub const KEY_MAX_SEQ: u64 = (1 << 56) - 1;

/// Computes the 32-bit fingerprint of a user key.
pub(crate) fn fingerprint(key: &[u8]) -> u32 {
    xxhash_rust::xxh32::xxh32(key, 0)
}

/// Current time in unix seconds, saturated into the 32-bit expiry field.
pub(crate) fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().min(u64::from(u32::MAX)) as u32)
        .unwrap_or(0)
}

/// Whether an expiry timestamp has passed. Zero means no expiry.
pub(crate) fn is_expired(expires_at: u32) -> bool {
    expires_at != 0 && expires_at <= unix_now()
}

/// Composes an internal key from a user key, sequence, delete flag and
/// expiry time.
///
/// # Panics
///
/// Panics if `seq` exceeds [`KEY_MAX_SEQ`]; sequences are assigned by the
/// store, so an overflow is a programmer error.
pub(crate) fn make_internal_key(ukey: &[u8], seq: u64, delete: bool, expires_at: u32) -> Vec<u8> {
    assert!(seq <= KEY_MAX_SEQ, "sequence number out of range: {seq}");

    let packed = (seq << 8) | u64::from(delete);
    let mut ikey = Vec::with_capacity(ukey.len() + INTERNAL_KEY_SUFFIX);
    ikey.extend_from_slice(ukey);
    ikey.extend_from_slice(&packed.to_le_bytes());
    ikey.extend_from_slice(&expires_at.to_le_bytes());
    ikey
}

/// Splits an internal key into `(user_key, seq, delete, expires_at)`.
pub(crate) fn parse_internal_key(ikey: &[u8]) -> Result<(&[u8], u64, bool, u32)> {
    if ikey.len() < INTERNAL_KEY_SUFFIX {
        return Err(Error::InvalidInternalKey);
    }
    let split = ikey.len() - INTERNAL_KEY_SUFFIX;
    let packed = u64::from_le_bytes(ikey[split..split + 8].try_into().unwrap());
    let expires_at = u32::from_le_bytes(ikey[split + 8..].try_into().unwrap());
    Ok((&ikey[..split], packed >> 8, packed & 0xff != 0, expires_at))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_key_round_trip() {
        let ikey = make_internal_key(b"device/7/temp", 42, false, 1234);
        let (ukey, seq, delete, expires_at) = parse_internal_key(&ikey).unwrap();

        assert_eq!(ukey, b"device/7/temp");
        assert_eq!(seq, 42);
        assert!(!delete);
        assert_eq!(expires_at, 1234);
    }

    #[test]
    fn test_internal_key_delete_flag() {
        let ikey = make_internal_key(b"k", KEY_MAX_SEQ, true, 0);
        let (_, seq, delete, expires_at) = parse_internal_key(&ikey).unwrap();

        assert_eq!(seq, KEY_MAX_SEQ);
        assert!(delete);
        assert_eq!(expires_at, 0);
    }

    #[test]
    #[should_panic(expected = "sequence number out of range")]
    fn test_seq_overflow_panics() {
        make_internal_key(b"k", KEY_MAX_SEQ + 1, false, 0);
    }

    #[test]
    fn test_parse_short_key_fails() {
        assert!(matches!(
            parse_internal_key(&[0u8; 11]),
            Err(Error::InvalidInternalKey)
        ));
    }

    #[test]
    fn test_fingerprint_stable() {
        assert_eq!(fingerprint(b"sensor/1"), fingerprint(b"sensor/1"));
        assert_ne!(fingerprint(b"sensor/1"), fingerprint(b"sensor/2"));
    }
}

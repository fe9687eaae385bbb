//! Record key and value codecs for backup mutation-log files.
//!
//! A file is a sequence of fixed-size blocks:
//!
//! ```text
//! [magic:i32-be = 2001]
//! ([keyLen:u32-be][key][valLen:u32-be][value])*
//! 0xFF padding to the block boundary
//! ```
//!
//! Each key is `hash:u8 || version:u64-be || part:u32-be`; the hash byte is
//! the low byte of `hashlittle` over the version's range-block index. Each
//! value is `includeVersion:u64-le || valLength:u32-le || mutations`, where
//! mutations use the standard packed layout and `valLength` counts only the
//! mutation bytes. One version's mutations may be split across consecutive
//! `part` records starting at 0.

use bytes::{BufMut, Bytes, BytesMut};

use tidelog_core::message::Mutation;
use tidelog_core::{Error, Result, Version};

use crate::hash::hashlittle;

/// Magic version at the head of every block. The only accepted value.
pub const BLOCK_MAGIC: i32 = 2001;

/// Versions per key-range block used to derive the key hash byte.
pub const LOG_RANGE_BLOCK_SIZE: u64 = 1_000_000;

/// Byte length of a record key.
pub const KEY_BYTES: usize = 1 + 8 + 4;

/// Fixed prefix of a record value before the mutation bytes.
pub const VALUE_HEADER_BYTES: usize = 8 + 4;

/// Protocol stamp written as the value's `includeVersion`.
pub const INCLUDE_VERSION: u64 = 0x0400_0001;

/// The hash byte pinned into a version's record keys.
#[must_use]
pub fn version_hash(version: Version) -> u8 {
    let block = (version / LOG_RANGE_BLOCK_SIZE) as u32;
    (hashlittle(&block.to_le_bytes(), 0) & 0xFF) as u8
}

/// Encodes a record key for `(version, part)`.
#[must_use]
pub fn encode_key(version: Version, part: u32) -> [u8; KEY_BYTES] {
    let mut key = [0u8; KEY_BYTES];
    key[0] = version_hash(version);
    key[1..9].copy_from_slice(&version.to_be_bytes());
    key[9..13].copy_from_slice(&part.to_be_bytes());
    key
}

/// Decodes and validates a record key.
///
/// # Errors
///
/// `corrupt_data` on a wrong length or a hash byte that does not match the
/// version.
pub fn decode_key(key: &[u8]) -> Result<(Version, u32)> {
    if key.len() != KEY_BYTES {
        return Err(Error::CorruptData("record key length"));
    }
    let hash = key[0];
    let version = Version::from_be_bytes(key[1..9].try_into().expect("8 bytes"));
    let part = u32::from_be_bytes(key[9..13].try_into().expect("4 bytes"));
    if hash != version_hash(version) {
        return Err(Error::CorruptData("record key hash"));
    }
    Ok((version, part))
}

/// Packs mutations into one (unsplit) record value.
#[must_use]
pub fn encode_value(mutations: &[Mutation]) -> Bytes {
    let body_len: usize = mutations.iter().map(Mutation::encoded_len).sum();
    let mut out = BytesMut::with_capacity(VALUE_HEADER_BYTES + body_len);
    out.put_u64_le(INCLUDE_VERSION);
    out.put_u32_le(body_len as u32);
    for mutation in mutations {
        mutation.encode_into(&mut out);
    }
    out.freeze()
}

/// Unpacks a (stitched) record value into its mutations.
///
/// # Errors
///
/// `corrupt_data` if the declared length disagrees with the buffer or a
/// mutation is truncated.
pub fn decode_value(value: &Bytes) -> Result<Vec<Mutation>> {
    if value.len() < VALUE_HEADER_BYTES {
        return Err(Error::CorruptData("record value header"));
    }
    let declared =
        u32::from_le_bytes(value[8..12].try_into().expect("4 bytes")) as usize;
    if declared != value.len() - VALUE_HEADER_BYTES {
        return Err(Error::CorruptData("record value length"));
    }
    let mut body = value.slice(VALUE_HEADER_BYTES..);
    let mut mutations = Vec::new();
    while !body.is_empty() {
        mutations.push(Mutation::decode(&mut body)?);
    }
    Ok(mutations)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_roundtrip() {
        for version in [0, 1, 999_999, 1_000_000, u64::from(u32::MAX) * 7] {
            for part in [0u32, 1, 250] {
                let key = encode_key(version, part);
                assert_eq!(decode_key(&key).unwrap(), (version, part));
            }
        }
    }

    #[test]
    fn key_orders_by_version_within_a_range_block() {
        // Within one range block the hash byte is constant, so keys sort by
        // version then part.
        let a = encode_key(10, 0);
        let b = encode_key(10, 1);
        let c = encode_key(500, 0);
        assert!(a < b && b < c);
    }

    #[test]
    fn tampered_hash_is_rejected() {
        let mut key = encode_key(123, 0);
        key[0] ^= 0x01;
        assert_eq!(decode_key(&key).unwrap_err().code(), "corrupt_data");
    }

    #[test]
    fn value_roundtrip() {
        let mutations = vec![
            Mutation::set(&b"key"[..], &b"value"[..]),
            Mutation::clear(&b"a"[..], &b"b"[..]),
        ];
        let value = encode_value(&mutations);
        assert_eq!(decode_value(&value).unwrap(), mutations);
    }

    #[test]
    fn value_length_mismatch_is_corrupt() {
        let value = encode_value(&[Mutation::set(&b"k"[..], &b"v"[..])]);
        let truncated = value.slice(..value.len() - 1);
        assert_eq!(decode_value(&truncated).unwrap_err().code(), "corrupt_data");
    }
}

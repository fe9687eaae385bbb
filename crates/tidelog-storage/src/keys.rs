//! Persistent key families used by the log server.
//!
//! All keys are byte strings in one ordered keyspace:
//!
//! ```text
//! Format                                      -- store format marker
//! ProtocolVersion/<logId>                     -- wire protocol of the writer
//! TLogSpillType/<logId>                       -- spill mode of the generation
//! DbRecoveryCount/<logId>                     -- epoch that recruited the generation
//! version/<logId>                             -- last persisted version
//! knownCommitted/<logId>                      -- last persisted known-committed version
//! Locality/<logId>                            -- data-center locality
//! recoveryLocation                            -- disk-queue replay start
//! TagMsg/<logId><tag><version:u64-be>         -- spilled-by-value message blob
//! TagMsgRef/<logId><tag><version:u64-be>      -- spilled-by-reference queue locations
//! TagPop/<logId><tag>                         -- popped-through version
//! ```
//!
//! Versions inside keys are big-endian so that byte-lexicographic key order
//! matches version order.

use serde::{Deserialize, Serialize};

use tidelog_core::{LogId, Tag, Version};

use crate::disk_queue::Location;

/// Store format marker key.
pub const FORMAT_KEY: &[u8] = b"Format";
/// Store format marker value accepted by this build.
pub const FORMAT_VALUE: &[u8] = b"Tidelog/LogServer/1/0";
/// Disk-queue replay location key.
pub const RECOVERY_LOCATION_KEY: &[u8] = b"recoveryLocation";

/// Wire protocol version persisted per generation.
pub const LOG_PROTOCOL_VERSION: u64 = 0x0400_0001;

const PROTOCOL_VERSION_PREFIX: &[u8] = b"ProtocolVersion/";
const SPILL_TYPE_PREFIX: &[u8] = b"TLogSpillType/";
const RECOVERY_COUNT_PREFIX: &[u8] = b"DbRecoveryCount/";
const VERSION_PREFIX: &[u8] = b"version/";
const KNOWN_COMMITTED_PREFIX: &[u8] = b"knownCommitted/";
const LOCALITY_PREFIX: &[u8] = b"Locality/";
const TAG_MESSAGES_PREFIX: &[u8] = b"TagMsg/";
const TAG_MESSAGE_REFS_PREFIX: &[u8] = b"TagMsgRef/";
const TAG_POPPED_PREFIX: &[u8] = b"TagPop/";

fn log_key(prefix: &[u8], log_id: LogId) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 16);
    key.extend_from_slice(prefix);
    key.extend_from_slice(log_id.as_bytes());
    key
}

fn tag_key(prefix: &[u8], log_id: LogId, tag: Tag) -> Vec<u8> {
    let mut key = log_key(prefix, log_id);
    key.extend_from_slice(&tag.to_key_bytes());
    key
}

fn tag_version_key(prefix: &[u8], log_id: LogId, tag: Tag, version: Version) -> Vec<u8> {
    let mut key = tag_key(prefix, log_id, tag);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

/// `ProtocolVersion/<logId>`.
#[must_use]
pub fn protocol_version_key(log_id: LogId) -> Vec<u8> {
    log_key(PROTOCOL_VERSION_PREFIX, log_id)
}

/// `TLogSpillType/<logId>`.
#[must_use]
pub fn spill_type_key(log_id: LogId) -> Vec<u8> {
    log_key(SPILL_TYPE_PREFIX, log_id)
}

/// `DbRecoveryCount/<logId>`.
#[must_use]
pub fn recovery_count_key(log_id: LogId) -> Vec<u8> {
    log_key(RECOVERY_COUNT_PREFIX, log_id)
}

/// `version/<logId>`.
#[must_use]
pub fn version_key(log_id: LogId) -> Vec<u8> {
    log_key(VERSION_PREFIX, log_id)
}

/// `knownCommitted/<logId>`.
#[must_use]
pub fn known_committed_key(log_id: LogId) -> Vec<u8> {
    log_key(KNOWN_COMMITTED_PREFIX, log_id)
}

/// `Locality/<logId>`.
#[must_use]
pub fn locality_key(log_id: LogId) -> Vec<u8> {
    log_key(LOCALITY_PREFIX, log_id)
}

/// `TagMsg/<logId><tag><version>`.
#[must_use]
pub fn tag_messages_key(log_id: LogId, tag: Tag, version: Version) -> Vec<u8> {
    tag_version_key(TAG_MESSAGES_PREFIX, log_id, tag, version)
}

/// `TagMsgRef/<logId><tag><version>`.
#[must_use]
pub fn tag_message_refs_key(log_id: LogId, tag: Tag, version: Version) -> Vec<u8> {
    tag_version_key(TAG_MESSAGE_REFS_PREFIX, log_id, tag, version)
}

/// `TagPop/<logId><tag>`.
#[must_use]
pub fn tag_popped_key(log_id: LogId, tag: Tag) -> Vec<u8> {
    tag_key(TAG_POPPED_PREFIX, log_id, tag)
}

/// Range of `TagMsg/` keys for `(log, tag)` covering versions
/// `[begin, end)`.
#[must_use]
pub fn tag_messages_range(
    log_id: LogId,
    tag: Tag,
    begin: Version,
    end: Version,
) -> (Vec<u8>, Vec<u8>) {
    (
        tag_version_key(TAG_MESSAGES_PREFIX, log_id, tag, begin),
        tag_version_key(TAG_MESSAGES_PREFIX, log_id, tag, end),
    )
}

/// Range of `TagMsgRef/` keys for `(log, tag)` covering versions
/// `[begin, end)`.
#[must_use]
pub fn tag_message_refs_range(
    log_id: LogId,
    tag: Tag,
    begin: Version,
    end: Version,
) -> (Vec<u8>, Vec<u8>) {
    (
        tag_version_key(TAG_MESSAGE_REFS_PREFIX, log_id, tag, begin),
        tag_version_key(TAG_MESSAGE_REFS_PREFIX, log_id, tag, end),
    )
}

/// Extracts the version from the tail of a `TagMsg/`/`TagMsgRef/` key.
#[must_use]
pub fn version_from_spill_key(key: &[u8]) -> Option<Version> {
    if key.len() < 8 {
        return None;
    }
    let bytes: [u8; 8] = key[key.len() - 8..].try_into().ok()?;
    Some(Version::from_be_bytes(bytes))
}

/// The smallest key strictly greater than every key prefixed by `prefix`.
#[must_use]
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return end;
        }
        end.pop();
    }
    // All-0xFF prefix: no finite upper bound, use the longest possible key.
    vec![0xFF; prefix.len() + 1]
}

/// Every per-log key range that must be cleared when a generation is
/// removed, in no particular order.
#[must_use]
pub fn all_log_ranges(log_id: LogId) -> Vec<(Vec<u8>, Vec<u8>)> {
    let ranges: Vec<(Vec<u8>, Vec<u8>)> = [
        PROTOCOL_VERSION_PREFIX,
        SPILL_TYPE_PREFIX,
        RECOVERY_COUNT_PREFIX,
        VERSION_PREFIX,
        KNOWN_COMMITTED_PREFIX,
        LOCALITY_PREFIX,
        TAG_MESSAGES_PREFIX,
        TAG_MESSAGE_REFS_PREFIX,
        TAG_POPPED_PREFIX,
    ]
    .iter()
    .map(|prefix| {
        let begin = log_key(prefix, log_id);
        let end = prefix_end(&begin);
        (begin, end)
    })
    .collect();
    // recoveryLocation is group-level, not per-log, and is left alone here.
    ranges
}

/// Value stored under a `TagMsgRef/` key: where the spilled entry lives in
/// the disk queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpilledMessageRef {
    /// Start location of the framed queue entry.
    pub start: Location,
    /// End location of the framed queue entry.
    pub end: Location,
    /// Message payload size in bytes.
    pub message_bytes: u32,
}

/// Encodes a version for storage as a KV value.
#[must_use]
pub fn version_value(version: Version) -> Vec<u8> {
    version.to_le_bytes().to_vec()
}

/// Decodes a version stored with [`version_value`].
#[must_use]
pub fn decode_version_value(value: &[u8]) -> Option<Version> {
    Some(Version::from_le_bytes(value.try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spill_keys_order_by_version() {
        let log = LogId::from_u128(7);
        let tag = Tag::new(0, 1);
        let k10 = tag_messages_key(log, tag, 10);
        let k2 = tag_messages_key(log, tag, 2);
        let k300 = tag_messages_key(log, tag, 300);
        assert!(k2 < k10 && k10 < k300);
        assert_eq!(version_from_spill_key(&k300), Some(300));
    }

    #[test]
    fn ranges_cover_exactly_their_versions() {
        let log = LogId::from_u128(7);
        let tag = Tag::new(0, 1);
        let (begin, end) = tag_messages_range(log, tag, 5, 20);
        assert!(tag_messages_key(log, tag, 5) >= begin);
        assert!(tag_messages_key(log, tag, 19) < end);
        assert!(tag_messages_key(log, tag, 20) >= end);
        assert!(tag_messages_key(log, tag, 4) < begin);
    }

    #[test]
    fn prefix_end_handles_trailing_ff() {
        assert_eq!(prefix_end(b"ab"), b"ac".to_vec());
        assert_eq!(prefix_end(&[0x61, 0xFF]), vec![0x62]);
        assert_eq!(prefix_end(&[0xFF, 0xFF]), vec![0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn version_value_roundtrip() {
        assert_eq!(decode_version_value(&version_value(123_456)), Some(123_456));
        assert_eq!(decode_version_value(b"short"), None);
    }

    #[test]
    fn log_ranges_cover_tag_keys() {
        let log = LogId::from_u128(9);
        let tag = Tag::new(-1, 4);
        let key = tag_popped_key(log, tag);
        let covered = all_log_ranges(log)
            .iter()
            .any(|(begin, end)| key.as_slice() >= begin.as_slice() && key.as_slice() < end.as_slice());
        assert!(covered);
    }
}

// Copyright 2026 The Tidelog Authors
// SPDX-License-Identifier: Apache-2.0

//! Common types used throughout Tidelog.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A commit version assigned by the cluster sequencer.
///
/// Versions are 64-bit, strictly increasing per TLog group, and immutable
/// once assigned. Version 0 is the state of a freshly recruited generation
/// before any commit.
pub type Version = u64;

/// Ordering of a message within a single version.
pub type Subsequence = u32;

/// A generation counter. Incremented by every cluster recovery.
pub type Epoch = u64;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(Uuid);

        impl $name {
            /// Wraps an existing 128-bit id.
            #[must_use]
            pub const fn new(id: Uuid) -> Self {
                Self(id)
            }

            /// Generates a fresh random id.
            #[must_use]
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            /// Builds an id from a raw 128-bit value. Useful for well-known
            /// ids and tests.
            #[must_use]
            pub const fn from_u128(raw: u128) -> Self {
                Self(Uuid::from_u128(raw))
            }

            /// Returns the big-endian byte representation.
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            /// Reconstructs an id from its byte representation.
            #[must_use]
            pub const fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }

            /// Full 32-digit hex form, for file and directory names.
            /// `Display` is shortened for logs and is not unique.
            #[must_use]
            pub fn to_hex(&self) -> String {
                self.0.simple().to_string()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                // Short form: first 8 hex digits, enough to tell ids apart in logs.
                let s = self.0.simple().to_string();
                write!(f, "{}", &s[..8])
            }
        }
    };
}

uuid_id! {
    /// Identifies a storage team: a shard of key space replicated on a fixed
    /// set of storage servers. Each team maps to exactly one group within a
    /// generation.
    StorageTeamId
}

uuid_id! {
    /// Identifies a TLog group: the set of teams co-located on one log
    /// worker. Persistence (KV store and disk queue) is per-group.
    TLogGroupId
}

uuid_id! {
    /// Identifies one log generation's interface. All groups recruited in
    /// the same generation on the same worker share a log id.
    LogId
}

/// The reserved team carrying transaction-subsystem state. Always spilled
/// by value so recovery can read it without replaying the disk queue.
pub const TXS_TEAM: StorageTeamId = StorageTeamId::from_u128(0x0000_0001_0000_0002);

/// A storage server tag: `(locality, id)` addressing one member of a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    /// Data-center locality of the tagged server. Negative values are
    /// reserved for system tags.
    pub locality: i8,
    /// Server index within the locality.
    pub id: u16,
}

impl Tag {
    /// Creates a tag.
    #[must_use]
    pub const fn new(locality: i8, id: u16) -> Self {
        Self { locality, id }
    }

    /// Encodes the tag for use inside persistent KV keys.
    #[must_use]
    pub fn to_key_bytes(&self) -> [u8; 3] {
        let mut out = [0u8; 3];
        out[0] = self.locality as u8;
        out[1..3].copy_from_slice(&self.id.to_be_bytes());
        out
    }

    /// Decodes a tag from its persistent key encoding.
    #[must_use]
    pub fn from_key_bytes(bytes: [u8; 3]) -> Self {
        Self { locality: bytes[0] as i8, id: u16::from_be_bytes([bytes[1], bytes[2]]) }
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.locality, self.id)
    }
}

/// How a generation moves in-memory messages to the durable KV store once
/// memory pressure crosses the spill threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpillType {
    /// Write the raw message bytes under `TagMsg/` keys.
    Value,
    /// Write only the disk-queue location range under `TagMsgRef/` keys;
    /// the bytes stay in the queue until popped.
    #[default]
    Reference,
}

impl std::str::FromStr for SpillType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "value" => Ok(Self::Value),
            "reference" => Ok(Self::Reference),
            other => Err(format!("unknown spill type: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_key_roundtrip() {
        for tag in [Tag::new(0, 0), Tag::new(-1, 2), Tag::new(3, 65535)] {
            assert_eq!(Tag::from_key_bytes(tag.to_key_bytes()), tag);
        }
    }

    #[test]
    fn tag_key_orders_by_id() {
        // Big-endian id bytes keep byte-lexicographic KV ordering aligned
        // with numeric tag order within a locality.
        let a = Tag::new(1, 5).to_key_bytes();
        let b = Tag::new(1, 300).to_key_bytes();
        assert!(a < b);
    }

    #[test]
    fn id_display_is_short() {
        let id = StorageTeamId::from_u128(0xabcd_ef01_2345_6789_abcd_ef01_2345_6789);
        assert_eq!(id.to_string().len(), 8);
    }

    #[test]
    fn spill_type_parse() {
        assert_eq!("value".parse::<SpillType>().unwrap(), SpillType::Value);
        assert_eq!("reference".parse::<SpillType>().unwrap(), SpillType::Reference);
        assert!("gzip".parse::<SpillType>().is_err());
    }
}

//! The packed mutation codec carried inside commit payloads.
//!
//! A commit pushes one byte payload per `(team, version)`. The payload is a
//! sequence of subsequenced mutations:
//!
//! ```text
//! [subsequence:u32][kind:u32][p1len:u32][p2len:u32][p1][p2] ...
//! ```
//!
//! All integers little-endian. Subsequences give mutations a total order
//! within a version, which recovery and backup restore rely on. The backup
//! log file format (tidelog-backup) reuses the trailing mutation layout
//! without the subsequence.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::types::Subsequence;

/// A single mutation: an operation kind plus two length-prefixed parameters
/// (key and value for sets, range begin and end for clears).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    /// Raw operation kind. Well-known kinds have associated constants;
    /// unknown kinds pass through undisturbed.
    pub kind: u32,
    /// First parameter (key, or range begin).
    pub param1: Bytes,
    /// Second parameter (value, or range end).
    pub param2: Bytes,
}

impl Mutation {
    /// Kind of a point write.
    pub const SET_VALUE: u32 = 0;
    /// Kind of a range clear.
    pub const CLEAR_RANGE: u32 = 1;

    /// Fixed per-mutation header size: kind + two length fields.
    pub const HEADER_BYTES: usize = 12;

    /// Creates a point write.
    #[must_use]
    pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self { kind: Self::SET_VALUE, param1: key.into(), param2: value.into() }
    }

    /// Creates a range clear.
    #[must_use]
    pub fn clear(begin: impl Into<Bytes>, end: impl Into<Bytes>) -> Self {
        Self { kind: Self::CLEAR_RANGE, param1: begin.into(), param2: end.into() }
    }

    /// Size of this mutation once encoded.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        Self::HEADER_BYTES + self.param1.len() + self.param2.len()
    }

    /// Appends the encoded mutation to `out`.
    pub fn encode_into(&self, out: &mut BytesMut) {
        out.put_u32_le(self.kind);
        out.put_u32_le(self.param1.len() as u32);
        out.put_u32_le(self.param2.len() as u32);
        out.put_slice(&self.param1);
        out.put_slice(&self.param2);
    }

    /// Decodes one mutation from the front of `buf`, advancing it.
    ///
    /// # Errors
    ///
    /// Returns `corrupt_data` if the buffer ends inside the mutation.
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.remaining() < Self::HEADER_BYTES {
            return Err(Error::CorruptData("truncated mutation header"));
        }
        let kind = buf.get_u32_le();
        let p1len = buf.get_u32_le() as usize;
        let p2len = buf.get_u32_le() as usize;
        if buf.remaining() < p1len + p2len {
            return Err(Error::CorruptData("truncated mutation parameters"));
        }
        let param1 = buf.split_to(p1len);
        let param2 = buf.split_to(p2len);
        Ok(Self { kind, param1, param2 })
    }
}

/// A mutation paired with its order within a version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsequencedMessage {
    /// Position of the mutation within its version.
    pub subsequence: Subsequence,
    /// The mutation itself.
    pub mutation: Mutation,
}

/// Packs subsequenced messages into one commit payload.
#[must_use]
pub fn encode_messages(messages: &[SubsequencedMessage]) -> Bytes {
    let total = messages.iter().map(|m| 4 + m.mutation.encoded_len()).sum();
    let mut out = BytesMut::with_capacity(total);
    for message in messages {
        out.put_u32_le(message.subsequence);
        message.mutation.encode_into(&mut out);
    }
    out.freeze()
}

/// Unpacks a commit payload into its subsequenced messages.
///
/// # Errors
///
/// Returns `corrupt_data` on any truncation.
pub fn decode_messages(payload: impl Into<Bytes>) -> Result<Vec<SubsequencedMessage>> {
    let mut buf: Bytes = payload.into();
    let mut messages = Vec::new();
    while buf.has_remaining() {
        if buf.remaining() < 4 {
            return Err(Error::CorruptData("truncated subsequence"));
        }
        let subsequence = buf.get_u32_le();
        let mutation = Mutation::decode(&mut buf)?;
        messages.push(SubsequencedMessage { subsequence, mutation });
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<SubsequencedMessage> {
        vec![
            SubsequencedMessage { subsequence: 1, mutation: Mutation::set(&b"k1"[..], &b"v1"[..]) },
            SubsequencedMessage {
                subsequence: 2,
                mutation: Mutation::clear(&b"a"[..], &b"z"[..]),
            },
            SubsequencedMessage {
                subsequence: 7,
                mutation: Mutation { kind: 20, param1: Bytes::new(), param2: Bytes::new() },
            },
        ]
    }

    #[test]
    fn roundtrip() {
        let messages = sample();
        let packed = encode_messages(&messages);
        assert_eq!(decode_messages(packed).unwrap(), messages);
    }

    #[test]
    fn truncation_is_corrupt_data() {
        let packed = encode_messages(&sample());
        for cut in [1, 5, packed.len() - 1] {
            let err = decode_messages(packed.slice(..cut)).unwrap_err();
            assert_eq!(err.code(), "corrupt_data");
        }
    }

    #[test]
    fn empty_payload_is_empty() {
        assert!(decode_messages(Bytes::new()).unwrap().is_empty());
    }
}

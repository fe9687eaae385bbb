//! Block-by-block decoder for backup mutation-log files.

use std::collections::VecDeque;
use std::io::Read;

use bytes::{Bytes, BytesMut};

use tidelog_core::message::Mutation;
use tidelog_core::{Error, Result, Version};

use crate::format;

/// All mutations of one version, in subsequence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedMutations {
    /// The commit version.
    pub version: Version,
    /// Its mutations.
    pub mutations: Vec<Mutation>,
}

/// Streaming decoder over a mutation-log file.
///
/// Decoding works block by block: each block yields key/value records,
/// which are then grouped into versions. Because one version's mutations
/// can be split across records (ascending `part` starting at 0), grouping
/// looks ahead one record, so up to two blocks of data may be buffered.
pub struct LogFileDecoder<R> {
    reader: R,
    block_size: usize,
    records: VecDeque<(Vec<u8>, Bytes)>,
    eof: bool,
}

impl<R: Read> LogFileDecoder<R> {
    /// Wraps `reader`, which must yield whole blocks of `block_size` bytes
    /// (the final block may be short).
    #[must_use]
    pub fn new(reader: R, block_size: usize) -> Self {
        Self { reader, block_size, records: VecDeque::new(), eof: false }
    }

    /// Whether every record has been consumed.
    #[must_use]
    pub fn finished(&self) -> bool {
        self.eof && self.records.is_empty()
    }

    /// Returns the next version's mutations, stitching split records.
    ///
    /// # Errors
    ///
    /// - `unsupported_version` on an unknown block magic
    /// - `corrupt_padding` on non-`0xFF` block padding
    /// - `corrupt_data` on malformed keys/values or a broken part sequence
    pub fn next_batch(&mut self) -> Result<Option<VersionedMutations>> {
        while self.records.is_empty() && !self.eof {
            self.read_block()?;
        }
        let Some((first_key, first_value)) = self.records.front().cloned() else {
            return Ok(None);
        };

        let (version, first_part) = format::decode_key(&first_key)?;
        if first_part != 0 {
            return Err(Error::CorruptData("version group starts at nonzero part"));
        }

        // Collect the version's parts, pulling more blocks as needed.
        let mut taken = 1;
        let mut last_part = 0;
        let mut stitched_len = first_value.len();
        loop {
            if taken == self.records.len() {
                self.read_block()?;
            }
            let Some((key, value)) = self.records.get(taken) else {
                break;
            };
            let (next_version, next_part) = format::decode_key(key)?;
            if next_version != version {
                break;
            }
            if next_part != last_part + 1 {
                tracing::warn!(version, last_part, next_part, "broken part sequence");
                return Err(Error::CorruptData("gap in version part sequence"));
            }
            stitched_len += value.len();
            last_part = next_part;
            taken += 1;
        }

        // Parts are raw slices of one serialized value; stitching is plain
        // concatenation in part order.
        let mutations = if taken == 1 {
            format::decode_value(&first_value)?
        } else {
            let mut stitched = BytesMut::with_capacity(stitched_len);
            for (_, value) in self.records.iter().take(taken) {
                stitched.extend_from_slice(value);
            }
            format::decode_value(&stitched.freeze())?
        };

        self.records.drain(..taken);
        Ok(Some(VersionedMutations { version, mutations }))
    }

    /// Reads and decodes one block into `records`.
    fn read_block(&mut self) -> Result<()> {
        if self.eof {
            return Ok(());
        }
        let mut block = vec![0u8; self.block_size];
        let mut filled = 0;
        while filled < block.len() {
            match self.reader.read(&mut block[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        if filled == 0 {
            self.eof = true;
            return Ok(());
        }
        block.truncate(filled);
        self.decode_block(&block)
    }

    fn decode_block(&mut self, block: &[u8]) -> Result<()> {
        let mut cursor = BlockCursor { block, offset: 0 };

        let magic = cursor.read_i32_be()?;
        if magic != format::BLOCK_MAGIC {
            return Err(Error::UnsupportedVersion(magic as u32));
        }

        // Records end at the block boundary or at the first 0xFF key byte.
        loop {
            if cursor.remaining().is_empty() || cursor.remaining()[0] == 0xFF {
                break;
            }
            let key_len = cursor.read_u32_be()? as usize;
            let key = cursor.read_bytes(key_len)?.to_vec();
            let value_len = cursor.read_u32_be()? as usize;
            let value = Bytes::copy_from_slice(cursor.read_bytes(value_len)?);
            self.records.push_back((key, value));
        }

        if cursor.remaining().iter().any(|b| *b != 0xFF) {
            return Err(Error::CorruptPadding);
        }
        Ok(())
    }
}

struct BlockCursor<'a> {
    block: &'a [u8],
    offset: usize,
}

impl<'a> BlockCursor<'a> {
    fn remaining(&self) -> &'a [u8] {
        &self.block[self.offset..]
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining().len() < len {
            return Err(Error::CorruptData("truncated block record"));
        }
        let out = &self.block[self.offset..self.offset + len];
        self.offset += len;
        Ok(out)
    }

    fn read_u32_be(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.read_bytes(4)?.try_into().expect("4 bytes")))
    }

    fn read_i32_be(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.read_bytes(4)?.try_into().expect("4 bytes")))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::encode::LogFileWriter;
    use crate::format::{encode_key, encode_value};

    const BLOCK: usize = 4096;

    fn mutations(n: usize) -> Vec<Mutation> {
        (0..n)
            .map(|i| Mutation::set(format!("key-{i}").into_bytes(), format!("val-{i}").into_bytes()))
            .collect()
    }

    fn decode_all(file: Vec<u8>) -> Result<Vec<VersionedMutations>> {
        let mut decoder = LogFileDecoder::new(Cursor::new(file), BLOCK);
        let mut out = Vec::new();
        while let Some(batch) = decoder.next_batch()? {
            out.push(batch);
        }
        assert!(decoder.finished());
        Ok(out)
    }

    #[test]
    fn encode_then_decode_roundtrips() {
        let mut writer = LogFileWriter::new(Vec::new(), BLOCK);
        writer.append(100, &mutations(3)).unwrap();
        writer.append(200, &mutations(1)).unwrap();
        writer.append(350, &mutations(7)).unwrap();
        let file = writer.finish().unwrap();

        let batches = decode_all(file).unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0], VersionedMutations { version: 100, mutations: mutations(3) });
        assert_eq!(batches[1].version, 200);
        assert_eq!(batches[2], VersionedMutations { version: 350, mutations: mutations(7) });
    }

    #[test]
    fn split_values_stitch_in_part_order() {
        // Force tiny parts so one version spans several records.
        let mut writer = LogFileWriter::with_part_size(Vec::new(), BLOCK, 32);
        let big = mutations(10);
        writer.append(100, &big).unwrap();
        let file = writer.finish().unwrap();

        let batches = decode_all(file).unwrap();
        assert_eq!(batches, vec![VersionedMutations { version: 100, mutations: big }]);
    }

    #[test]
    fn unknown_magic_is_unsupported() {
        let mut block = vec![0xFF; BLOCK];
        block[0..4].copy_from_slice(&1999i32.to_be_bytes());
        let err = decode_all(block).unwrap_err();
        assert_eq!(err.code(), "unsupported_version");
    }

    #[test]
    fn bad_padding_is_corrupt_padding() {
        let mut writer = LogFileWriter::new(Vec::new(), BLOCK);
        writer.append(100, &mutations(1)).unwrap();
        let mut file = writer.finish().unwrap();
        let last = file.len() - 1;
        file[last] = 0x00;

        let err = decode_all(file).unwrap_err();
        assert_eq!(err.code(), "corrupt_padding");
    }

    #[test]
    fn nonzero_first_part_is_corrupt_data() {
        let mut block = Vec::new();
        block.extend_from_slice(&format::BLOCK_MAGIC.to_be_bytes());
        let key = encode_key(100, 1);
        let value = encode_value(&mutations(1));
        block.extend_from_slice(&(key.len() as u32).to_be_bytes());
        block.extend_from_slice(&key);
        block.extend_from_slice(&(value.len() as u32).to_be_bytes());
        block.extend_from_slice(&value);
        block.resize(BLOCK, 0xFF);

        let err = decode_all(block).unwrap_err();
        assert_eq!(err.code(), "corrupt_data");
    }

    #[test]
    fn part_gap_is_corrupt_data() {
        // Build parts 0 and 2 by writing with a tiny part size and then
        // renumbering the second record's part in place.
        let mut writer = LogFileWriter::with_part_size(Vec::new(), BLOCK, 32);
        writer.append(100, &mutations(4)).unwrap();
        let mut file = writer.finish().unwrap();

        let part1_key = encode_key(100, 1);
        let part2_key = encode_key(100, 2);
        let at = file
            .windows(part1_key.len())
            .position(|w| w == part1_key)
            .expect("split produced part 1");
        file[at..at + part2_key.len()].copy_from_slice(&part2_key);

        let err = decode_all(file).unwrap_err();
        assert_eq!(err.code(), "corrupt_data");
    }

    #[test]
    fn empty_file_decodes_to_nothing() {
        assert!(decode_all(Vec::new()).unwrap().is_empty());
    }
}

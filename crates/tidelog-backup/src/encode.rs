//! Block writer for backup mutation-log files.

use std::io::Write;

use tidelog_core::message::Mutation;
use tidelog_core::{Error, Result, Version};

use crate::format;

/// Value bytes per record before splitting into parts.
const DEFAULT_PART_BYTES: usize = 10_000;

/// Per-record framing overhead: two length fields plus the key.
const RECORD_OVERHEAD: usize = 4 + format::KEY_BYTES + 4;

/// Writes versions of mutations into fixed-size blocks.
///
/// Versions must be appended in ascending order; record keys then sort the
/// way readers expect. Values larger than the part size are split into
/// consecutive `part` records holding raw slices of the serialized value.
pub struct LogFileWriter<W> {
    writer: W,
    block_size: usize,
    part_size: usize,
    block: Vec<u8>,
    last_version: Option<Version>,
}

impl<W: Write> LogFileWriter<W> {
    /// Creates a writer emitting `block_size`-byte blocks.
    #[must_use]
    pub fn new(writer: W, block_size: usize) -> Self {
        Self::with_part_size(writer, block_size, DEFAULT_PART_BYTES)
    }

    /// Creates a writer with an explicit value part size. The part size is
    /// clamped so a record always fits one block.
    #[must_use]
    pub fn with_part_size(writer: W, block_size: usize, part_size: usize) -> Self {
        debug_assert!(block_size > 4 + RECORD_OVERHEAD);
        let part_size = part_size.min(block_size - 4 - RECORD_OVERHEAD);
        Self { writer, block_size, part_size, block: Vec::new(), last_version: None }
    }

    /// Appends one version's mutations.
    ///
    /// # Errors
    ///
    /// `corrupt_data` on out-of-order versions; I/O errors from the sink.
    pub fn append(&mut self, version: Version, mutations: &[Mutation]) -> Result<()> {
        if self.last_version.is_some_and(|last| version <= last) {
            return Err(Error::CorruptData("versions must be appended in order"));
        }
        self.last_version = Some(version);

        let value = format::encode_value(mutations);
        for (part, chunk) in value.chunks(self.part_size).enumerate() {
            self.write_record(&format::encode_key(version, part as u32), chunk)?;
        }
        Ok(())
    }

    /// Pads the final block and returns the sink.
    ///
    /// # Errors
    ///
    /// I/O errors from the sink.
    pub fn finish(mut self) -> Result<W> {
        self.flush_block()?;
        Ok(self.writer)
    }

    fn write_record(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let needed = RECORD_OVERHEAD - format::KEY_BYTES + key.len() + value.len();
        if !self.block.is_empty() && self.block.len() + needed > self.block_size {
            self.flush_block()?;
        }
        if self.block.is_empty() {
            self.block.extend_from_slice(&format::BLOCK_MAGIC.to_be_bytes());
        }
        self.block.extend_from_slice(&(key.len() as u32).to_be_bytes());
        self.block.extend_from_slice(key);
        self.block.extend_from_slice(&(value.len() as u32).to_be_bytes());
        self.block.extend_from_slice(value);
        debug_assert!(self.block.len() <= self.block_size);
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        self.block.resize(self.block_size, 0xFF);
        self.writer.write_all(&self.block)?;
        self.block.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_are_fixed_size_and_padded() {
        let mut writer = LogFileWriter::new(Vec::new(), 256);
        for version in 1..=20u64 {
            writer
                .append(version, &[Mutation::set(&b"some-key"[..], &b"some-value"[..])])
                .unwrap();
        }
        let file = writer.finish().unwrap();
        assert!(file.len() > 256);
        assert_eq!(file.len() % 256, 0);
        // Every block leads with the magic.
        for block in file.chunks(256) {
            assert_eq!(&block[0..4], &format::BLOCK_MAGIC.to_be_bytes());
        }
    }

    #[test]
    fn out_of_order_versions_are_rejected() {
        let mut writer = LogFileWriter::new(Vec::new(), 4096);
        writer.append(10, &[Mutation::set(&b"k"[..], &b"v"[..])]).unwrap();
        assert!(writer.append(10, &[Mutation::set(&b"k"[..], &b"v"[..])]).is_err());
        assert!(writer.append(5, &[Mutation::set(&b"k"[..], &b"v"[..])]).is_err());
    }

    #[test]
    fn empty_writer_emits_nothing() {
        let writer = LogFileWriter::new(Vec::new(), 4096);
        assert!(writer.finish().unwrap().is_empty());
    }
}

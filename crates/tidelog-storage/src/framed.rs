//! Record framing over the disk queue.
//!
//! Each record is framed as:
//!
//! ```text
//! [length:u32-le][payload][valid:u8]
//! ```
//!
//! where `length` counts only the payload. The valid byte turns the disk
//! queue's byte-prefix durability into record-atomic durability: a commit
//! that completed makes whole records durable, and a crash mid-record leaves
//! a tail whose valid byte never reads 1. Recovery zero-fills such a tail
//! out to a record boundary (so later pushes start cleanly) and reports end
//! of stream. Records with a zero valid byte are skipped, which is how the
//! zero-filled region reads on any subsequent recovery.

use bytes::Bytes;

use tidelog_core::{Error, Result};

use crate::disk_queue::{DiskQueue, Location};

const LENGTH_BYTES: usize = 4;
const VALID_BYTES: usize = 1;

/// Sanity cap on a single framed record.
const MAX_RECORD_BYTES: usize = 100 << 20;

/// A record yielded during recovery, with the queue locations it occupies.
#[derive(Debug, Clone)]
pub struct FramedRecord {
    /// The record payload.
    pub payload: Bytes,
    /// Location of the frame's first byte.
    pub start: Location,
    /// Location one past the frame's valid byte.
    pub end: Location,
}

/// Atomic record framing over a [`DiskQueue`].
pub struct FramedQueue {
    queue: DiskQueue,
}

impl FramedQueue {
    /// Opens the framed queue in `dir`.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or corrupt queue files.
    pub fn open(dir: &std::path::Path) -> Result<Self> {
        Ok(Self { queue: DiskQueue::open(dir)? })
    }

    /// Positions the replay cursor; see [`DiskQueue::initialize_recovery`].
    /// Returns `true` if there are no records to replay.
    pub fn initialize_recovery(&mut self, recover_at: Location) -> bool {
        self.queue.initialize_recovery(recover_at)
    }

    /// Frames and appends a record. Returns the `[start, end)` location
    /// range of the whole frame. Durable after the next [`commit`](Self::commit).
    pub fn push(&mut self, payload: &[u8]) -> (Location, Location) {
        debug_assert!(payload.len() < MAX_RECORD_BYTES);
        let (start, _) = self.queue.push(&(payload.len() as u32).to_le_bytes());
        self.queue.push(payload);
        let (_, end) = self.queue.push(&[1u8]);
        (start, end)
    }

    /// Makes every previously pushed record durable.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn commit(&mut self) -> Result<()> {
        self.queue.commit()
    }

    /// Authorizes reclaiming bytes strictly before `up_to`.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors while deleting a fully-popped file.
    pub fn pop(&mut self, up_to: Location) -> Result<()> {
        self.queue.pop(up_to)
    }

    /// Consumes the next intact record from the replay cursor.
    ///
    /// Returns `Ok(None)` at end of stream. A partial tail (truncated length
    /// field, truncated payload, or missing valid byte) is zero-filled out
    /// to a record boundary and treated as end of stream; it never surfaces
    /// as a record.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or an impossibly large declared length.
    pub fn read_next(&mut self) -> Result<Option<FramedRecord>> {
        let mut zero_fill = 0usize;
        let record = loop {
            let start = self.queue.next_read_location();
            let header = self.queue.read_next(LENGTH_BYTES)?;
            if header.len() != LENGTH_BYTES {
                if !header.is_empty() {
                    // The crash landed inside the length field itself. Pad
                    // the field and the payload it implies.
                    let mut length = [0u8; LENGTH_BYTES];
                    length[..header.len()].copy_from_slice(&header);
                    let payload_len = u32::from_le_bytes(length) as usize;
                    zero_fill = (LENGTH_BYTES - header.len()) + payload_len + VALID_BYTES;
                }
                break None;
            }

            let payload_len = u32::from_le_bytes(header.try_into().expect("4 bytes")) as usize;
            if payload_len >= MAX_RECORD_BYTES {
                return Err(Error::CorruptLog("framed record length out of range"));
            }

            let mut body = self.queue.read_next(payload_len + VALID_BYTES)?;
            if body.len() != payload_len + VALID_BYTES {
                zero_fill = payload_len + VALID_BYTES - body.len();
                break None;
            }

            match body[payload_len] {
                1 => {
                    body.truncate(payload_len);
                    let end = self.queue.next_read_location();
                    break Some(FramedRecord { payload: Bytes::from(body), start, end });
                }
                // A zero valid byte marks a previously zero-filled tail;
                // skip it and keep reading.
                0 => continue,
                _ => return Err(Error::CorruptLog("framed record valid byte out of range")),
            }
        };

        if record.is_none() && zero_fill > 0 {
            tracing::info!(bytes = zero_fill, "padding partial record at queue tail");
            self.queue.push(&vec![0u8; zero_fill]);
        }
        Ok(record)
    }

    /// Reads back one previously committed frame by its `[start, end)`
    /// locations, as returned from [`push`](Self::push).
    ///
    /// # Errors
    ///
    /// `corrupt_log` if the range does not hold a single intact frame.
    pub fn read_record_at(&mut self, start: Location, end: Location) -> Result<Bytes> {
        let framed_len = (end - start) as usize;
        if framed_len < LENGTH_BYTES + VALID_BYTES {
            return Err(Error::CorruptLog("frame range too short"));
        }
        let raw = self.queue.read_range(start, end)?;
        let declared =
            u32::from_le_bytes(raw[..LENGTH_BYTES].try_into().expect("4 bytes")) as usize;
        if declared != framed_len - LENGTH_BYTES - VALID_BYTES {
            return Err(Error::CorruptLog("frame length mismatch"));
        }
        if raw[framed_len - 1] != 1 {
            return Err(Error::CorruptLog("frame valid byte unset"));
        }
        Ok(Bytes::from(raw).slice(LENGTH_BYTES..framed_len - VALID_BYTES))
    }

    /// Location the next push will start at.
    #[must_use]
    pub fn next_push_location(&self) -> Location {
        self.queue.next_push_location()
    }

    /// End of the durable region.
    #[must_use]
    pub fn durable_end(&self) -> Location {
        self.queue.durable_end()
    }

    /// Total payload bytes currently on disk.
    #[must_use]
    pub fn on_disk_bytes(&self) -> u64 {
        self.queue.on_disk_bytes()
    }

    /// Location before which bytes are reclaimable.
    #[must_use]
    pub fn popped(&self) -> Location {
        self.queue.popped()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn reopen_and_read_all(dir: &std::path::Path) -> Vec<Bytes> {
        let mut queue = FramedQueue::open(dir).unwrap();
        queue.initialize_recovery(0);
        let mut records = Vec::new();
        while let Some(record) = queue.read_next().unwrap() {
            records.push(record.payload);
        }
        records
    }

    #[test]
    fn records_survive_commit_in_push_order() {
        let dir = TempDir::new().unwrap();
        let mut queue = FramedQueue::open(dir.path()).unwrap();
        assert!(queue.initialize_recovery(0));
        queue.push(b"first");
        queue.push(b"second");
        queue.push(b"");
        queue.commit().unwrap();

        let records = reopen_and_read_all(dir.path());
        assert_eq!(records, vec![&b"first"[..], &b"second"[..], &b""[..]]);
    }

    #[test]
    fn read_record_at_returns_committed_payloads() {
        let dir = TempDir::new().unwrap();
        let mut queue = FramedQueue::open(dir.path()).unwrap();
        let (a_start, a_end) = queue.push(b"alpha");
        let (b_start, b_end) = queue.push(b"beta");
        queue.commit().unwrap();

        assert_eq!(&queue.read_record_at(a_start, a_end).unwrap()[..], b"alpha");
        assert_eq!(&queue.read_record_at(b_start, b_end).unwrap()[..], b"beta");
        // A range spanning both frames is not one record.
        assert!(queue.read_record_at(a_start, b_end).is_err());
    }

    #[test]
    fn locations_cover_the_frame() {
        let dir = TempDir::new().unwrap();
        let mut queue = FramedQueue::open(dir.path()).unwrap();
        let (start, end) = queue.push(b"abc");
        assert_eq!(start, 0);
        assert_eq!(end, (4 + 3 + 1) as Location);
        queue.commit().unwrap();

        let mut queue = FramedQueue::open(dir.path()).unwrap();
        queue.initialize_recovery(0);
        let record = queue.read_next().unwrap().unwrap();
        assert_eq!((record.start, record.end), (start, end));
    }

    #[test]
    fn torn_valid_byte_is_not_a_record() {
        let dir = TempDir::new().unwrap();
        {
            let mut queue = FramedQueue::open(dir.path()).unwrap();
            queue.push(b"keep");
            queue.commit().unwrap();
        }
        // Truncate the file by one byte: the last record loses its valid byte.
        let path = dir.path().join("queue-a.tdq");
        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 1).unwrap();

        assert!(reopen_and_read_all(dir.path()).is_empty());
    }

    #[test]
    fn pushes_after_partial_tail_recovery_read_back() {
        let dir = TempDir::new().unwrap();
        {
            let mut queue = FramedQueue::open(dir.path()).unwrap();
            queue.push(b"one");
            queue.commit().unwrap();
            queue.push(b"torn");
            queue.commit().unwrap();
        }
        // Tear the second record mid-payload.
        let path = dir.path().join("queue-a.tdq");
        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        {
            let mut queue = FramedQueue::open(dir.path()).unwrap();
            queue.initialize_recovery(0);
            let record = queue.read_next().unwrap().unwrap();
            assert_eq!(&record.payload[..], b"one");
            assert!(queue.read_next().unwrap().is_none());
            // The tail was padded; a fresh record lands after it.
            queue.push(b"two");
            queue.commit().unwrap();
        }

        let records = reopen_and_read_all(dir.path());
        assert_eq!(records, vec![&b"one"[..], &b"two"[..]]);
    }
}

//! Append-only, crash-safe byte queue over two physical files.
//!
//! The queue assigns every appended byte a [`Location`]: a monotonically
//! increasing offset that survives restarts. Data lives in two alternating
//! files; the queue appends to the newer one and reclaims the older one as a
//! whole once every byte in it has been popped. Each file starts with a
//! fixed header recording its sequence number and the location of its first
//! payload byte, so recovery can order the files and resume location math
//! without replaying anything.
//!
//! Durability: [`DiskQueue::commit`] flushes buffered appends and fdatasyncs
//! the active file. After a crash, every byte appended before a completed
//! commit is readable again; bytes after the last commit may be missing or
//! truncated mid-record. The framing layer above recovers from such tails.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tidelog_core::{Error, Result};

/// An opaque ordered handle into the queue identifying a byte position.
pub type Location = u64;

const FILE_MAGIC: &[u8; 4] = b"TDQ1";
const FILE_VERSION: u32 = 1;
const FILE_HEADER_BYTES: u64 = 24;

/// Roll to the other file once the active one carries this much payload.
const TARGET_FILE_BYTES: u64 = 100 * 1024 * 1024;

/// One of the queue's two physical files.
struct QueueFile {
    path: PathBuf,
    file: File,
    seq: u64,
    /// Location of the first payload byte in this file.
    base: Location,
    /// Durable payload bytes currently in the file.
    len: u64,
}

impl QueueFile {
    fn end(&self) -> Location {
        self.base + self.len
    }

    fn create(path: &Path, seq: u64, base: Location) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut header = [0u8; FILE_HEADER_BYTES as usize];
        header[0..4].copy_from_slice(FILE_MAGIC);
        header[4..8].copy_from_slice(&FILE_VERSION.to_le_bytes());
        header[8..16].copy_from_slice(&seq.to_le_bytes());
        header[16..24].copy_from_slice(&base.to_le_bytes());
        file.write_all(&header)?;
        file.sync_all()?;
        Ok(Self { path: path.to_path_buf(), file, seq, base, len: 0 })
    }

    /// Opens an existing file, returning `None` for files too short to carry
    /// a complete header (a crash while creating the file).
    fn open(path: &Path) -> Result<Option<Self>> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len();
        if size < FILE_HEADER_BYTES {
            return Ok(None);
        }
        let mut header = [0u8; FILE_HEADER_BYTES as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        if &header[0..4] != FILE_MAGIC {
            return Err(Error::CorruptLog("bad queue file magic"));
        }
        let version = u32::from_le_bytes(header[4..8].try_into().expect("4 bytes"));
        if version != FILE_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let seq = u64::from_le_bytes(header[8..16].try_into().expect("8 bytes"));
        let base = u64::from_le_bytes(header[16..24].try_into().expect("8 bytes"));
        Ok(Some(Self { path: path.to_path_buf(), file, seq, base, len: size - FILE_HEADER_BYTES }))
    }
}

/// Append-only byte queue with durable prefix truncation.
pub struct DiskQueue {
    dir: PathBuf,
    /// The fully-written predecessor of `active`, if not yet reclaimed.
    older: Option<QueueFile>,
    active: QueueFile,
    /// Appended but not yet committed bytes.
    write_buf: Vec<u8>,
    /// Location the next push will receive.
    next_push: Location,
    /// Callers have authorized reclaiming bytes strictly before this.
    popped: Location,
    /// Replay cursor for recovery reads.
    read_pos: Location,
    /// Replayable bytes end here (durable end as of open).
    read_end: Location,
}

impl DiskQueue {
    /// Opens the queue in `dir`, creating it if empty.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or a corrupt/unsupported file header.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path_a = dir.join("queue-a.tdq");
        let path_b = dir.join("queue-b.tdq");

        let mut files = Vec::new();
        for path in [&path_a, &path_b] {
            if path.exists() {
                if let Some(file) = QueueFile::open(path)? {
                    files.push(file);
                }
            }
        }
        files.sort_by_key(|f| f.seq);
        if files.len() == 2 && files[0].seq == files[1].seq {
            return Err(Error::CorruptLog("queue files share a sequence number"));
        }

        let (older, active) = match files.len() {
            0 => {
                let active = QueueFile::create(&path_a, 1, 0)?;
                sync_dir(dir)?;
                (None, active)
            }
            1 => (None, files.pop().expect("one file")),
            _ => {
                let active = files.pop().expect("two files");
                (files.pop(), active)
            }
        };

        let next_push = active.end();
        let oldest_base = older.as_ref().map_or(active.base, |f| f.base);
        Ok(Self {
            dir: dir.to_path_buf(),
            older,
            active,
            write_buf: Vec::new(),
            next_push,
            popped: oldest_base,
            read_pos: oldest_base,
            read_end: next_push,
        })
    }

    /// Positions the replay cursor. Bytes before the oldest retained file
    /// were already reclaimed and are skipped. Returns `true` if there is
    /// nothing left to replay.
    pub fn initialize_recovery(&mut self, recover_at: Location) -> bool {
        let oldest_base = self.older.as_ref().map_or(self.active.base, |f| f.base);
        self.read_pos = recover_at.max(oldest_base);
        self.read_pos >= self.read_end
    }

    /// Location the next [`push`](Self::push) will start at.
    #[must_use]
    pub fn next_push_location(&self) -> Location {
        self.next_push
    }

    /// End of the durable region.
    #[must_use]
    pub fn durable_end(&self) -> Location {
        self.next_push - self.write_buf.len() as u64
    }

    /// Total payload bytes currently on disk, for queuing metrics.
    #[must_use]
    pub fn on_disk_bytes(&self) -> u64 {
        self.older.as_ref().map_or(0, |f| f.len) + self.active.len
    }

    /// Appends `bytes`, returning its `[start, end)` location range. The
    /// bytes become durable at the next successful [`commit`](Self::commit).
    pub fn push(&mut self, bytes: &[u8]) -> (Location, Location) {
        let start = self.next_push;
        self.write_buf.extend_from_slice(bytes);
        self.next_push += bytes.len() as u64;
        (start, self.next_push)
    }

    /// Writes buffered appends to the active file and makes them durable.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors; the queue must not be used further after a
    /// failed commit.
    pub fn commit(&mut self) -> Result<()> {
        self.maybe_roll()?;
        if self.write_buf.is_empty() {
            return Ok(());
        }
        let offset = FILE_HEADER_BYTES + self.active.len;
        self.active.file.seek(SeekFrom::Start(offset))?;
        self.active.file.write_all(&self.write_buf)?;
        self.active.file.sync_data()?;
        self.active.len += self.write_buf.len() as u64;
        self.write_buf.clear();
        Ok(())
    }

    /// Authorizes reclaiming every byte strictly before `up_to`. The older
    /// file is deleted once wholly popped.
    pub fn pop(&mut self, up_to: Location) -> Result<()> {
        self.popped = self.popped.max(up_to.min(self.durable_end()));
        let fully_popped = self.older.as_ref().is_some_and(|older| older.end() <= self.popped);
        if fully_popped {
            let older = self.older.take().expect("checked above");
            tracing::debug!(path = %older.path.display(), end = older.end(), "reclaiming queue file");
            std::fs::remove_file(&older.path)?;
            sync_dir(&self.dir)?;
        }
        Ok(())
    }

    /// Location before which all bytes are reclaimable.
    #[must_use]
    pub fn popped(&self) -> Location {
        self.popped
    }

    /// Reads up to `len` bytes from the replay cursor, spanning the file
    /// boundary if needed. A short (or empty) result means the durable
    /// region ended.
    pub fn read_next(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len && self.read_pos < self.read_end {
            // A reclaimed gap between the files cannot hold the cursor.
            if self.read_pos < self.active.base {
                match &mut self.older {
                    Some(older) if self.read_pos < older.end() => {
                        let offset = FILE_HEADER_BYTES + (self.read_pos - older.base);
                        let available = (older.end() - self.read_pos) as usize;
                        let take = available.min(len - out.len());
                        read_chunk(&mut older.file, offset, take, &mut out)?;
                        self.read_pos += take as u64;
                    }
                    _ => {
                        self.read_pos = self.active.base;
                    }
                }
            } else {
                let offset = FILE_HEADER_BYTES + (self.read_pos - self.active.base);
                let available = (self.read_end.min(self.active.end()) - self.read_pos) as usize;
                let take = available.min(len - out.len());
                read_chunk(&mut self.active.file, offset, take, &mut out)?;
                self.read_pos += take as u64;
            }
        }
        Ok(out)
    }

    /// Current replay cursor position.
    #[must_use]
    pub fn next_read_location(&self) -> Location {
        self.read_pos
    }

    /// Reads the durable bytes in `[start, end)` without disturbing the
    /// replay cursor. Used to resolve spilled-by-reference records.
    ///
    /// # Errors
    ///
    /// `corrupt_log` if the range was reclaimed or extends past the durable
    /// region.
    pub fn read_range(&mut self, start: Location, end: Location) -> Result<Vec<u8>> {
        let oldest_base = self.older.as_ref().map_or(self.active.base, |f| f.base);
        if start < oldest_base || end > self.durable_end() || start > end {
            return Err(Error::CorruptLog("read range outside retained region"));
        }
        let mut out = Vec::with_capacity((end - start) as usize);
        let mut pos = start;
        while pos < end {
            if let Some(older) = &mut self.older {
                if pos < older.end() {
                    let offset = FILE_HEADER_BYTES + (pos - older.base);
                    let take = ((older.end().min(end)) - pos) as usize;
                    read_chunk(&mut older.file, offset, take, &mut out)?;
                    pos += take as u64;
                    continue;
                }
            }
            let offset = FILE_HEADER_BYTES + (pos - self.active.base);
            let take = (end - pos) as usize;
            read_chunk(&mut self.active.file, offset, take, &mut out)?;
            pos += take as u64;
        }
        Ok(out)
    }

    /// Switches to the other file once the active one is large enough and
    /// its predecessor has been reclaimed.
    fn maybe_roll(&mut self) -> Result<()> {
        if self.older.is_some() || self.active.len < TARGET_FILE_BYTES {
            return Ok(());
        }
        let free_path = if self.active.path.ends_with("queue-a.tdq") {
            self.dir.join("queue-b.tdq")
        } else {
            self.dir.join("queue-a.tdq")
        };
        let next = QueueFile::create(&free_path, self.active.seq + 1, self.durable_end())?;
        sync_dir(&self.dir)?;
        self.older = Some(std::mem::replace(&mut self.active, next));
        Ok(())
    }
}

fn read_chunk(file: &mut File, offset: u64, len: usize, out: &mut Vec<u8>) -> Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    let start = out.len();
    out.resize(start + len, 0);
    file.read_exact(&mut out[start..])?;
    Ok(())
}

fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn push_commit_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut queue = DiskQueue::open(dir.path()).unwrap();

        let (start, end) = queue.push(b"hello");
        assert_eq!((start, end), (0, 5));
        let (start, end) = queue.push(b" world");
        assert_eq!((start, end), (5, 11));
        queue.commit().unwrap();

        let mut queue = DiskQueue::open(dir.path()).unwrap();
        assert!(!queue.initialize_recovery(0));
        assert_eq!(queue.read_next(11).unwrap(), b"hello world");
        assert!(queue.read_next(1).unwrap().is_empty());
        assert_eq!(queue.next_push_location(), 11);
    }

    #[test]
    fn uncommitted_pushes_are_not_durable() {
        let dir = TempDir::new().unwrap();
        {
            let mut queue = DiskQueue::open(dir.path()).unwrap();
            queue.push(b"durable");
            queue.commit().unwrap();
            queue.push(b"lost");
            // No commit; simulated crash.
        }
        let mut queue = DiskQueue::open(dir.path()).unwrap();
        assert!(!queue.initialize_recovery(0));
        assert_eq!(queue.read_next(64).unwrap(), b"durable");
        assert_eq!(queue.next_push_location(), 7);
    }

    #[test]
    fn recovery_location_skips_prefix() {
        let dir = TempDir::new().unwrap();
        let mut queue = DiskQueue::open(dir.path()).unwrap();
        queue.push(b"abcdef");
        queue.commit().unwrap();

        assert!(!queue.initialize_recovery(4));
        assert_eq!(queue.read_next(16).unwrap(), b"ef");
        assert!(queue.initialize_recovery(6));
    }

    #[test]
    fn empty_queue_recovery_is_finished() {
        let dir = TempDir::new().unwrap();
        let mut queue = DiskQueue::open(dir.path()).unwrap();
        assert!(queue.initialize_recovery(0));
    }

    #[test]
    fn pop_is_clamped_to_durable_region() {
        let dir = TempDir::new().unwrap();
        let mut queue = DiskQueue::open(dir.path()).unwrap();
        queue.push(b"12345678");
        queue.commit().unwrap();
        queue.push(b"buffered");
        queue.pop(1_000_000).unwrap();
        assert_eq!(queue.popped(), 8);
    }
}

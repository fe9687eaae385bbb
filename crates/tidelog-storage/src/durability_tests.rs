//! Durability testing for disk-queue crash recovery.
//!
//! Exercises the framed queue's core guarantee: after a crash at any byte
//! offset, recovery yields exactly the records whose commit completed, in
//! push order, and no partial record ever surfaces.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tempfile::TempDir;

use crate::framed::FramedQueue;

/// Isolated directory plus helpers for tearing queue files.
struct QueueTestHarness {
    _temp_dir: TempDir,
    dir: PathBuf,
}

impl QueueTestHarness {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("queue");
        Self { _temp_dir: temp_dir, dir }
    }

    fn open(&self) -> FramedQueue {
        FramedQueue::open(&self.dir).unwrap()
    }

    /// Truncates the single queue file down to `keep` bytes of content,
    /// simulating a crash that lost the tail.
    fn truncate_file_to(&self, keep: u64) {
        let path = self.file_path();
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_len(keep).unwrap();
    }

    fn file_len(&self) -> u64 {
        std::fs::metadata(self.file_path()).unwrap().len()
    }

    fn file_path(&self) -> PathBuf {
        self.dir.join("queue-a.tdq")
    }
}

fn read_all(dir: &Path) -> Vec<Bytes> {
    let mut queue = FramedQueue::open(dir).unwrap();
    queue.initialize_recovery(0);
    let mut records = Vec::new();
    while let Some(record) = queue.read_next().unwrap() {
        records.push(record.payload);
    }
    records
}

#[test]
fn crash_at_every_offset_never_surfaces_partial_records() {
    let records: Vec<Vec<u8>> = vec![b"alpha".to_vec(), b"bravo-longer".to_vec(), b"c".to_vec()];

    // Frame sizes: 4 (length) + payload + 1 (valid byte).
    let frame_len = |payload: &[u8]| 4 + payload.len() as u64 + 1;
    let header = {
        let harness = QueueTestHarness::new();
        let _ = harness.open();
        harness.file_len()
    };

    let total: u64 = header + records.iter().map(|r| frame_len(r)).sum::<u64>();

    for cut in header..=total {
        let harness = QueueTestHarness::new();
        {
            let mut queue = harness.open();
            assert!(queue.initialize_recovery(0));
            for record in &records {
                queue.push(record);
            }
            queue.commit().unwrap();
        }
        harness.truncate_file_to(cut);

        // Recovery must yield exactly the records wholly below the cut.
        let mut expected = Vec::new();
        let mut offset = header;
        for record in &records {
            offset += frame_len(record);
            if offset <= cut {
                expected.push(Bytes::from(record.clone()));
            }
        }

        let recovered = read_all(&harness.dir);
        assert_eq!(recovered, expected, "crash at offset {cut}");
    }
}

#[test]
fn recovery_then_append_then_recovery_is_consistent() {
    let harness = QueueTestHarness::new();
    {
        let mut queue = harness.open();
        queue.initialize_recovery(0);
        queue.push(b"one");
        queue.push(b"two");
        queue.commit().unwrap();
    }
    // Lose half of "two"'s frame.
    harness.truncate_file_to(harness.file_len() - 4);

    {
        let mut queue = harness.open();
        queue.initialize_recovery(0);
        let first = queue.read_next().unwrap().unwrap();
        assert_eq!(&first.payload[..], b"one");
        assert!(queue.read_next().unwrap().is_none());
        queue.push(b"three");
        queue.commit().unwrap();
    }

    let recovered = read_all(&harness.dir);
    assert_eq!(recovered, vec![Bytes::from_static(b"one"), Bytes::from_static(b"three")]);
}

#[test]
fn read_all_after_push_all_matches_input() {
    let harness = QueueTestHarness::new();
    let inputs: Vec<Vec<u8>> =
        (0..50).map(|i| format!("record-{i}").into_bytes().repeat(i % 7 + 1)).collect();
    {
        let mut queue = harness.open();
        queue.initialize_recovery(0);
        for input in &inputs {
            queue.push(input);
        }
        queue.commit().unwrap();
    }
    let expected: Vec<Bytes> = inputs.into_iter().map(Bytes::from).collect();
    assert_eq!(read_all(&harness.dir), expected);
}

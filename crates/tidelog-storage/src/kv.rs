//! Redb-backed ordered key/value store.
//!
//! Holds the log server's durable metadata (formats, versions, popped
//! offsets) and spilled message blobs. Keys order byte-lexicographically.
//! `set` and `clear_range` buffer; [`KeyValueStore::commit`] applies the
//! buffered batch in one write transaction, so readers only ever observe
//! the latest committed snapshot.

use std::path::Path;
use std::sync::Mutex;

use redb::{Database, ReadableTable, TableDefinition};

use tidelog_core::{Error, Result};

const DATA_TABLE: TableDefinition<'_, &[u8], &[u8]> = TableDefinition::new("tlog_data");

enum WriteOp {
    Set(Vec<u8>, Vec<u8>),
    ClearRange(Vec<u8>, Vec<u8>),
}

/// Durable ordered key/value store with buffered, atomic commits.
pub struct KeyValueStore {
    db: Database,
    pending: Mutex<Vec<WriteOp>>,
}

impl KeyValueStore {
    /// Opens or creates the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns a database error if the file cannot be opened or the table
    /// cannot be created.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(from_redb)?;
        let write_txn = db.begin_write().map_err(from_redb)?;
        {
            let _ = write_txn.open_table(DATA_TABLE).map_err(from_redb)?;
        }
        write_txn.commit().map_err(from_redb)?;
        Ok(Self { db, pending: Mutex::new(Vec::new()) })
    }

    /// Buffers a write of `key -> value`.
    pub fn set(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.pending.lock().expect("kv batch lock").push(WriteOp::Set(key.into(), value.into()));
    }

    /// Buffers a clear of every key in `[begin, end)`.
    pub fn clear_range(&self, begin: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) {
        self.pending
            .lock()
            .expect("kv batch lock")
            .push(WriteOp::ClearRange(begin.into(), end.into()));
    }

    /// Applies all buffered operations in one atomic transaction.
    ///
    /// # Errors
    ///
    /// Returns a database error; buffered operations are not lost on error
    /// and a retry will reapply them.
    pub async fn commit(&self) -> Result<()> {
        let ops = std::mem::take(&mut *self.pending.lock().expect("kv batch lock"));
        if ops.is_empty() {
            return Ok(());
        }
        let result = self.apply(&ops);
        if result.is_err() {
            let mut pending = self.pending.lock().expect("kv batch lock");
            let retained = std::mem::take(&mut *pending);
            *pending = ops.into_iter().chain(retained).collect();
        }
        tokio::task::yield_now().await;
        result
    }

    fn apply(&self, ops: &[WriteOp]) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(from_redb)?;
        {
            let mut table = write_txn.open_table(DATA_TABLE).map_err(from_redb)?;
            for op in ops {
                match op {
                    WriteOp::Set(key, value) => {
                        table.insert(key.as_slice(), value.as_slice()).map_err(from_redb)?;
                    }
                    WriteOp::ClearRange(begin, end) => {
                        let mut doomed = Vec::new();
                        for entry in
                            table.range(begin.as_slice()..end.as_slice()).map_err(from_redb)?
                        {
                            let (key, _) = entry.map_err(from_redb)?;
                            doomed.push(key.value().to_vec());
                        }
                        for key in doomed {
                            table.remove(key.as_slice()).map_err(from_redb)?;
                        }
                    }
                }
            }
        }
        write_txn.commit().map_err(from_redb)?;
        Ok(())
    }

    /// Reads the latest committed value for `key`.
    ///
    /// # Errors
    ///
    /// Returns a database error on read failure.
    pub fn read_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read().map_err(from_redb)?;
        let table = read_txn.open_table(DATA_TABLE).map_err(from_redb)?;
        let value = table.get(key).map_err(from_redb)?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    /// Reads committed pairs in `[begin, end)`, ascending, up to `limit`.
    ///
    /// # Errors
    ///
    /// Returns a database error on read failure.
    pub fn read_range(
        &self,
        begin: &[u8],
        end: &[u8],
        limit: Option<usize>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let read_txn = self.db.begin_read().map_err(from_redb)?;
        let table = read_txn.open_table(DATA_TABLE).map_err(from_redb)?;
        let mut out = Vec::new();
        for entry in table.range(begin..end).map_err(from_redb)? {
            let (key, value) = entry.map_err(from_redb)?;
            out.push((key.value().to_vec(), value.value().to_vec()));
            if limit.is_some_and(|l| out.len() >= l) {
                break;
            }
        }
        Ok(out)
    }
}

fn from_redb<E: std::error::Error>(e: E) -> Error {
    Error::Database(e.to_string())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn set_is_invisible_until_commit() {
        let dir = TempDir::new().unwrap();
        let kv = KeyValueStore::open(&dir.path().join("meta.redb")).unwrap();

        kv.set(&b"k"[..], &b"v"[..]);
        assert_eq!(kv.read_value(b"k").unwrap(), None);

        kv.commit().await.unwrap();
        assert_eq!(kv.read_value(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn clear_range_is_half_open() {
        let dir = TempDir::new().unwrap();
        let kv = KeyValueStore::open(&dir.path().join("meta.redb")).unwrap();

        for key in [b"a", b"b", b"c"] {
            kv.set(&key[..], &b"x"[..]);
        }
        kv.commit().await.unwrap();

        kv.clear_range(&b"a"[..], &b"c"[..]);
        kv.commit().await.unwrap();

        assert_eq!(kv.read_value(b"a").unwrap(), None);
        assert_eq!(kv.read_value(b"b").unwrap(), None);
        assert_eq!(kv.read_value(b"c").unwrap(), Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn read_range_orders_and_limits() {
        let dir = TempDir::new().unwrap();
        let kv = KeyValueStore::open(&dir.path().join("meta.redb")).unwrap();

        for key in [&b"t/3"[..], &b"t/1"[..], &b"t/2"[..], &b"u/1"[..]] {
            kv.set(key, key);
        }
        kv.commit().await.unwrap();

        let pairs = kv.read_range(b"t/", b"t0", None).unwrap();
        let keys: Vec<_> = pairs.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![&b"t/1"[..], &b"t/2"[..], &b"t/3"[..]]);

        let pairs = kv.read_range(b"t/", b"t0", Some(2)).unwrap();
        assert_eq!(pairs.len(), 2);
    }

    #[tokio::test]
    async fn committed_data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta.redb");
        {
            let kv = KeyValueStore::open(&path).unwrap();
            kv.set(&b"version"[..], 42u64.to_le_bytes().to_vec());
            kv.commit().await.unwrap();
        }
        let kv = KeyValueStore::open(&path).unwrap();
        assert_eq!(kv.read_value(b"version").unwrap(), Some(42u64.to_le_bytes().to_vec()));
    }
}

/// Storage layer implementation using RocksDB
///
/// Every record kind lives in its own column family. Reads and writes go
/// through a `Txn`: an overlay over the database that buffers writes and
/// commits them as one `WriteBatch`. Write transactions are serialized by a
/// process-wide lock so a tick and a message admission never interleave.

use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use thiserror::Error;

pub mod store;

pub use store::init_genesis;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Write lock poisoned")]
    LockPoisoned,

    #[error("Write attempted in a read-only transaction")]
    ReadOnly,

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Column family names
pub(crate) const CF_OWN_STATE: &str = "own_state";
pub(crate) const CF_OWN_VALIDATING_STATE: &str = "own_validating_state";
pub(crate) const CF_ROUND_STATES: &str = "round_states";
pub(crate) const CF_VALIDATOR_SETS: &str = "validator_sets";
pub(crate) const CF_VALIDATOR_SETS_POST_APP: &str = "validator_sets_post_app";
pub(crate) const CF_BLOCK_HEADERS: &str = "block_headers";
pub(crate) const CF_HEADER_ROOTS: &str = "header_roots";
pub(crate) const CF_BROADCAST: &str = "broadcast";
pub(crate) const CF_SNAPSHOTS: &str = "snapshots";

const COLUMN_FAMILIES: [&str; 9] = [
    CF_OWN_STATE,
    CF_OWN_VALIDATING_STATE,
    CF_ROUND_STATES,
    CF_VALIDATOR_SETS,
    CF_VALIDATOR_SETS_POST_APP,
    CF_BLOCK_HEADERS,
    CF_HEADER_ROOTS,
    CF_BROADCAST,
    CF_SNAPSHOTS,
];

/// Shared handle to the node database
#[derive(Clone)]
pub struct Storage {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
    _temp_dir: Option<Arc<TempDir>>,
}

impl Storage {
    /// Open or create the database at `path`
    pub fn new(path: &Path) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, cfs)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
            _temp_dir: None,
        })
    }

    /// Database in a temporary directory that lives as long as the handle
    pub fn new_temp() -> Result<Self> {
        let temp_dir = tempfile::tempdir().map_err(|e| StorageError::InvalidData(e.to_string()))?;
        let mut storage = Self::new(temp_dir.path())?;
        storage._temp_dir = Some(Arc::new(temp_dir));
        Ok(storage)
    }

    /// Run `f` in a write transaction. Writes are committed atomically
    /// when `f` succeeds and discarded when it fails.
    pub fn update<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Txn<'_>) -> std::result::Result<T, E>,
        E: From<StorageError>,
    {
        let _guard = self.write_lock.lock().map_err(|_| StorageError::LockPoisoned)?;
        let mut txn = Txn::new(&self.db, false);
        let out = f(&mut txn)?;
        txn.commit()?;
        Ok(out)
    }

    /// Run `f` in a read-only transaction
    pub fn view<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Txn<'_>) -> std::result::Result<T, E>,
        E: From<StorageError>,
    {
        let txn = Txn::new(&self.db, true);
        f(&txn)
    }
}

/// Buffered view of the database with read-your-writes semantics
pub struct Txn<'a> {
    db: &'a DB,
    writes: BTreeMap<(&'static str, Vec<u8>), Option<Vec<u8>>>,
    read_only: bool,
}

impl<'a> Txn<'a> {
    fn new(db: &'a DB, read_only: bool) -> Self {
        Self {
            db,
            writes: BTreeMap::new(),
            read_only,
        }
    }

    fn cf(&self, name: &str) -> Result<&'a ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::InvalidData(format!("Column family not found: {}", name)))
    }

    pub fn get(&self, cf: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(pending) = self.writes.get(&(cf, key.to_vec())) {
            return Ok(pending.clone());
        }
        Ok(self.db.get_cf(self.cf(cf)?, key)?)
    }

    pub fn put(&mut self, cf: &'static str, key: &[u8], value: Vec<u8>) -> Result<()> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        self.writes.insert((cf, key.to_vec()), Some(value));
        Ok(())
    }

    pub fn delete(&mut self, cf: &'static str, key: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        self.writes.insert((cf, key.to_vec()), None);
        Ok(())
    }

    pub fn get_value<T: DeserializeOwned>(&self, cf: &'static str, key: &[u8]) -> Result<Option<T>> {
        self.get(cf, key)?.map(|bytes| decode(&bytes)).transpose()
    }

    pub fn put_value<T: Serialize + ?Sized>(&mut self, cf: &'static str, key: &[u8], value: &T) -> Result<()> {
        let bytes = bincode::serialize(value).map_err(|e| StorageError::SerializationError(e.to_string()))?;
        self.put(cf, key, bytes)
    }

    /// Entry with the greatest key at or below `key`
    pub fn seek_prev(&self, cf: &'static str, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let from_overlay = self
            .writes
            .range((cf, Vec::new())..=(cf, key.to_vec()))
            .rev()
            .find_map(|((_, k), v)| v.as_ref().map(|v| (k.clone(), v.clone())));

        let mut from_db = None;
        for item in self.db.iterator_cf(self.cf(cf)?, IteratorMode::From(key, Direction::Reverse)) {
            let (k, v) = item?;
            if self.writes.contains_key(&(cf, k.to_vec())) {
                continue;
            }
            from_db = Some((k.to_vec(), v.to_vec()));
            break;
        }

        Ok(match (from_overlay, from_db) {
            (Some(a), Some(b)) => Some(if a.0 >= b.0 { a } else { b }),
            (a, b) => a.or(b),
        })
    }

    fn commit(self) -> Result<()> {
        if self.writes.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::default();
        for ((cf, key), value) in &self.writes {
            let handle = self.cf(cf)?;
            match value {
                Some(value) => batch.put_cf(handle, key, value),
                None => batch.delete_cf(handle, key),
            }
        }
        self.db.write(batch)?;
        Ok(())
    }
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| StorageError::SerializationError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_creation() {
        let storage = Storage::new_temp();
        assert!(storage.is_ok());
    }

    #[test]
    fn test_update_commits_and_view_reads() {
        let storage = Storage::new_temp().unwrap();
        storage
            .update(|txn| txn.put_value(CF_HEADER_ROOTS, b"k", &7u32))
            .unwrap();
        let value: Option<u32> = storage.view(|txn| txn.get_value(CF_HEADER_ROOTS, b"k")).unwrap();
        assert_eq!(value, Some(7));
    }

    #[test]
    fn test_failed_update_discards_writes() {
        let storage = Storage::new_temp().unwrap();
        let result: Result<()> = storage.update(|txn| {
            txn.put_value(CF_HEADER_ROOTS, b"k", &1u32)?;
            Err(StorageError::InvalidData("abort".into()))
        });
        assert!(result.is_err());
        let value: Option<u32> = storage.view(|txn| txn.get_value(CF_HEADER_ROOTS, b"k")).unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn test_read_your_writes_and_delete() {
        let storage = Storage::new_temp().unwrap();
        storage.update(|txn| txn.put(CF_SNAPSHOTS, b"a", vec![1])).unwrap();
        storage
            .update(|txn| {
                assert_eq!(txn.get(CF_SNAPSHOTS, b"a")?, Some(vec![1]));
                txn.delete(CF_SNAPSHOTS, b"a")?;
                assert_eq!(txn.get(CF_SNAPSHOTS, b"a")?, None);
                Ok::<_, StorageError>(())
            })
            .unwrap();
        assert_eq!(storage.view(|txn| txn.get(CF_SNAPSHOTS, b"a")).unwrap(), None);
    }

    #[test]
    fn test_view_is_read_only() {
        let storage = Storage::new_temp().unwrap();
        let result = storage.view(|txn| {
            let mut txn = Txn::new(txn.db, true);
            txn.put(CF_SNAPSHOTS, b"a", vec![1])
        });
        assert!(matches!(result, Err(StorageError::ReadOnly)));
    }

    #[test]
    fn test_seek_prev_merges_overlay() {
        let storage = Storage::new_temp().unwrap();
        storage
            .update(|txn| {
                txn.put(CF_VALIDATOR_SETS, &1u32.to_be_bytes(), vec![1])?;
                txn.put(CF_VALIDATOR_SETS, &10u32.to_be_bytes(), vec![10])
            })
            .unwrap();
        storage
            .update(|txn| {
                let found = txn.seek_prev(CF_VALIDATOR_SETS, &9u32.to_be_bytes())?;
                assert_eq!(found.map(|(_, v)| v), Some(vec![1]));

                txn.put(CF_VALIDATOR_SETS, &5u32.to_be_bytes(), vec![5])?;
                let found = txn.seek_prev(CF_VALIDATOR_SETS, &9u32.to_be_bytes())?;
                assert_eq!(found.map(|(_, v)| v), Some(vec![5]));

                txn.delete(CF_VALIDATOR_SETS, &10u32.to_be_bytes())?;
                let found = txn.seek_prev(CF_VALIDATOR_SETS, &20u32.to_be_bytes())?;
                assert_eq!(found.map(|(_, v)| v), Some(vec![5]));
                Ok::<_, StorageError>(())
            })
            .unwrap();
    }

    #[test]
    fn test_storage_persistence() {
        let temp_dir = tempfile::tempdir().unwrap();
        {
            let storage = Storage::new(temp_dir.path()).unwrap();
            storage.update(|txn| txn.put(CF_BLOCK_HEADERS, b"h", vec![9])).unwrap();
        }
        let storage = Storage::new(temp_dir.path()).unwrap();
        assert_eq!(storage.view(|txn| txn.get(CF_BLOCK_HEADERS, b"h")).unwrap(), Some(vec![9]));
    }

    #[test]
    fn test_concurrent_updates_serialize() {
        use std::thread;

        let storage = Storage::new_temp().unwrap();
        let handles: Vec<_> = (0..8u32)
            .map(|_| {
                let storage = storage.clone();
                thread::spawn(move || {
                    storage
                        .update(|txn| {
                            let n: u32 = txn.get_value(CF_HEADER_ROOTS, b"n")?.unwrap_or(0);
                            txn.put_value(CF_HEADER_ROOTS, b"n", &(n + 1))
                        })
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let n: Option<u32> = storage.view(|txn| txn.get_value(CF_HEADER_ROOTS, b"n")).unwrap();
        assert_eq!(n, Some(8));
    }
}

//! RocksDB-backed persistent index storage.
//!
//! Implements [`KeyValueStore`] with one column family per [`Keyspace`]:
//! transaction records, block records, and service metadata (sync cursor,
//! last-close timestamp).

use std::path::Path;

use rocksdb::{ColumnFamilyDescriptor, Options, DB};

use gxb_core::error::GxbError;
use gxb_core::store::{KeyValueStore, Keyspace};

/// RocksDB-backed index storage.
pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    /// Open or create a RocksDB database at the given path.
    ///
    /// Creates all column families if they don't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, GxbError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = Keyspace::ALL
            .iter()
            .map(|space| ColumnFamilyDescriptor::new(space.name(), Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(|e| GxbError::Storage(e.to_string()))?;

        Ok(Self { db })
    }

    fn cf_handle(&self, space: Keyspace) -> Result<&rocksdb::ColumnFamily, GxbError> {
        self.db
            .cf_handle(space.name())
            .ok_or_else(|| GxbError::Storage(format!("missing column family: {}", space.name())))
    }
}

impl KeyValueStore for RocksStore {
    fn get(&self, space: Keyspace, key: &[u8]) -> Result<Option<Vec<u8>>, GxbError> {
        let cf = self.cf_handle(space)?;
        self.db
            .get_cf(cf, key)
            .map_err(|e| GxbError::Storage(e.to_string()))
    }

    fn put(&self, space: Keyspace, key: &[u8], value: &[u8]) -> Result<(), GxbError> {
        let cf = self.cf_handle(space)?;
        self.db
            .put_cf(cf, key, value)
            .map_err(|e| GxbError::Storage(e.to_string()))
    }

    fn delete(&self, space: Keyspace, key: &[u8]) -> Result<(), GxbError> {
        let cf = self.cf_handle(space)?;
        self.db
            .delete_cf(cf, key)
            .map_err(|e| GxbError::Storage(e.to_string()))
    }

    /// Flush the memtables of every column family to disk.
    fn flush(&self) -> Result<(), GxbError> {
        for space in Keyspace::ALL {
            let cf = self.cf_handle(space)?;
            self.db
                .flush_cf(cf)
                .map_err(|e| GxbError::Storage(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gxb_core::constants::META_SYNC_CURSOR;
    use gxb_core::store::height_key;
    use gxb_core::types::SyncCursor;

    fn temp_store() -> (RocksStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path().join("index")).unwrap();
        (store, dir)
    }

    #[test]
    fn open_creates_empty_store() {
        let (store, _dir) = temp_store();
        assert!(store.get(Keyspace::Metadata, META_SYNC_CURSOR).unwrap().is_none());
    }

    #[test]
    fn put_get_delete() {
        let (store, _dir) = temp_store();
        store.put(Keyspace::Transactions, b"ab01", b"{}").unwrap();
        assert_eq!(store.get(Keyspace::Transactions, b"ab01").unwrap().unwrap(), b"{}");

        store.delete(Keyspace::Transactions, b"ab01").unwrap();
        assert!(store.get(Keyspace::Transactions, b"ab01").unwrap().is_none());

        // Deleting again is fine.
        store.delete(Keyspace::Transactions, b"ab01").unwrap();
    }

    #[test]
    fn keyspaces_are_isolated() {
        let (store, _dir) = temp_store();
        store.put(Keyspace::Blocks, &height_key(7), b"block").unwrap();
        assert!(store.get(Keyspace::Transactions, &height_key(7)).unwrap().is_none());
        assert!(store.get(Keyspace::Metadata, &height_key(7)).unwrap().is_none());
        assert_eq!(store.get(Keyspace::Blocks, &height_key(7)).unwrap().unwrap(), b"block");
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index");
        {
            let store = RocksStore::open(&path).unwrap();
            store
                .put(Keyspace::Metadata, META_SYNC_CURSOR, &SyncCursor::new(995).to_bytes())
                .unwrap();
            store.flush().unwrap();
        }

        let store = RocksStore::open(&path).unwrap();
        let bytes = store.get(Keyspace::Metadata, META_SYNC_CURSOR).unwrap().unwrap();
        assert_eq!(SyncCursor::from_bytes(&bytes).unwrap(), SyncCursor::new(995));
    }
}

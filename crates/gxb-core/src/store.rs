//! Key-value storage interface and in-memory implementation.
//!
//! Provides the [`KeyValueStore`] trait the indexer persists through. The
//! [`MemoryStore`] is suitable for testing; the production service uses
//! RocksDB (gxb-node).
//!
//! Keys are grouped into [`Keyspace`]s so that a backend can place each
//! group in its own column family.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::GxbError;

/// Logical key groups.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Keyspace {
    /// Transaction id (lowercase hex, UTF-8 bytes) → JSON `TxRecord`.
    Transactions,
    /// Block height (big-endian u64) → JSON `BlockRecord`.
    Blocks,
    /// Service metadata: sync cursor, last close timestamp.
    Metadata,
}

impl Keyspace {
    pub const ALL: [Keyspace; 3] = [Keyspace::Transactions, Keyspace::Blocks, Keyspace::Metadata];

    /// Stable name, used as the column family name.
    pub fn name(&self) -> &'static str {
        match self {
            Keyspace::Transactions => "transactions",
            Keyspace::Blocks => "blocks",
            Keyspace::Metadata => "metadata",
        }
    }
}

/// Encode a height as big-endian bytes for ordered iteration.
pub fn height_key(height: u64) -> [u8; 8] {
    height.to_be_bytes()
}

/// Durable key → bytes storage.
///
/// Single-key writes only; callers that need crash-safe ordering must
/// sequence their writes themselves.
pub trait KeyValueStore: Send + Sync {
    /// Look up a value. `Ok(None)` if the key is absent.
    fn get(&self, space: Keyspace, key: &[u8]) -> Result<Option<Vec<u8>>, GxbError>;

    /// Insert or overwrite a value.
    fn put(&self, space: Keyspace, key: &[u8], value: &[u8]) -> Result<(), GxbError>;

    /// Remove a key. Removing an absent key is not an error.
    fn delete(&self, space: Keyspace, key: &[u8]) -> Result<(), GxbError>;

    /// Flush buffered writes to durable media.
    fn flush(&self) -> Result<(), GxbError> {
        Ok(())
    }
}

/// In-memory key-value store for testing.
///
/// Counts successful writes so tests can assert that an operation was a
/// no-op.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<(Keyspace, Vec<u8>), Vec<u8>>>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys in a keyspace.
    pub fn len(&self, space: Keyspace) -> usize {
        self.entries.read().keys().filter(|(s, _)| *s == space).count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Total successful `put` and `delete` calls.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, space: Keyspace, key: &[u8]) -> Result<Option<Vec<u8>>, GxbError> {
        Ok(self.entries.read().get(&(space, key.to_vec())).cloned())
    }

    fn put(&self, space: Keyspace, key: &[u8], value: &[u8]) -> Result<(), GxbError> {
        self.entries.write().insert((space, key.to_vec()), value.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete(&self, space: Keyspace, key: &[u8]) -> Result<(), GxbError> {
        self.entries.write().remove(&(space, key.to_vec()));
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

//! Shared helpers for the integration tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use gxb_core::constants::META_SYNC_CURSOR;
use gxb_core::error::GxbError;
use gxb_core::store::{KeyValueStore, Keyspace, MemoryStore};
use gxb_core::types::{Endpoint, SyncCursor};
use gxb_node_lib::config::ExplorerConfig;
use gxb_node_lib::service::Explorer;
use gxb_node_lib::session::WitnessConnector;

/// Config for the given mock endpoints with short timeouts.
pub fn witness_config(endpoints: &[&str]) -> ExplorerConfig {
    ExplorerConfig {
        witnesses: endpoints.iter().map(|e| Endpoint::from(*e)).collect(),
        probe_timeout_ms: 500,
        request_timeout_ms: 500,
        retry_interval_ms: 50,
        shutdown_timeout_ms: 2_000,
        ..ExplorerConfig::default()
    }
}

/// A memory store whose cursor is already at `height`.
pub fn store_at(height: u64) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store
        .put(Keyspace::Metadata, META_SYNC_CURSOR, &SyncCursor::new(height).to_bytes())
        .unwrap();
    store
}

/// Build an explorer and run it in the background. Does not wait for ready.
pub fn spawn_explorer(
    config: ExplorerConfig,
    connector: Arc<dyn WitnessConnector>,
    store: Arc<dyn KeyValueStore>,
) -> Arc<Explorer> {
    let explorer = Explorer::new(config, connector, store).unwrap();
    let runner = Arc::clone(&explorer);
    tokio::spawn(async move { runner.run().await });
    explorer
}

/// Build, run, and wait until the explorer is ready.
pub async fn start_explorer(
    config: ExplorerConfig,
    connector: Arc<dyn WitnessConnector>,
    store: Arc<dyn KeyValueStore>,
) -> Arc<Explorer> {
    let explorer = spawn_explorer(config, connector, store);
    tokio::time::timeout(Duration::from_secs(5), explorer.wait_ready())
        .await
        .expect("explorer never became ready")
        .unwrap();
    explorer
}

/// Poll `cond` until it holds, panicking after five seconds.
pub async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn cursor_of(explorer: &Explorer) -> Option<u64> {
    explorer.indexer().cursor().map(|c| c.last_synced_block)
}

pub async fn wait_for_cursor(explorer: &Explorer, height: u64) {
    eventually(&format!("cursor {height}"), || cursor_of(explorer) == Some(height)).await;
}

/// Memory store that fails the cursor write for one chosen height, as if the
/// process died right after that block's records were written.
pub struct CrashingStore {
    inner: Arc<MemoryStore>,
    crash_at: Mutex<Option<u64>>,
}

impl CrashingStore {
    pub fn new(inner: Arc<MemoryStore>, crash_at: u64) -> Self {
        Self {
            inner,
            crash_at: Mutex::new(Some(crash_at)),
        }
    }
}

impl KeyValueStore for CrashingStore {
    fn get(&self, space: Keyspace, key: &[u8]) -> Result<Option<Vec<u8>>, GxbError> {
        self.inner.get(space, key)
    }

    fn put(&self, space: Keyspace, key: &[u8], value: &[u8]) -> Result<(), GxbError> {
        if space == Keyspace::Metadata && key == META_SYNC_CURSOR {
            let height = SyncCursor::from_bytes(value)?.last_synced_block;
            let mut crash_at = self.crash_at.lock();
            if *crash_at == Some(height) {
                crash_at.take();
                return Err(GxbError::Storage(format!("crash before cursor {height}")));
            }
        }
        self.inner.put(space, key, value)
    }

    fn delete(&self, space: Keyspace, key: &[u8]) -> Result<(), GxbError> {
        self.inner.delete(space, key)
    }
}

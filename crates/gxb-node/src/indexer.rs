//! Incremental block indexer.
//!
//! For each height above the persisted [`SyncCursor`] the indexer fetches
//! the block, writes one [`TxRecord`] per transaction (keyed by id) and one
//! [`BlockRecord`] (keyed by height), and only then advances and persists
//! the cursor. A crash between the record writes and the cursor write
//! re-indexes that block on the next run, producing identical bytes.
//!
//! Runs are serialized. [`spawn_sync_worker`] puts a single-slot queue in
//! front of the indexer so that a burst of height notifications collapses
//! into one run toward the highest target.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gxb_core::constants::{META_PRUNED_THROUGH, META_SYNC_CURSOR};
use gxb_core::error::{GxbError, IndexError};
use gxb_core::store::{height_key, KeyValueStore, Keyspace};
use gxb_core::types::{BlockRecord, SyncCursor, TxRecord};

use crate::config::ExplorerConfig;
use crate::session::BlockSource;

#[derive(Debug, Clone, Copy, Default)]
pub struct IndexerSettings {
    /// Cursor to start from when none is persisted.
    pub initial_block: Option<u64>,
    /// Keep records only for this many blocks below the cursor.
    pub retain_blocks: Option<u64>,
}

impl IndexerSettings {
    pub fn from_config(config: &ExplorerConfig) -> Self {
        Self {
            initial_block: config.initial_block,
            retain_blocks: config.retain_blocks,
        }
    }
}

pub struct BlockIndexer {
    db: Arc<dyn KeyValueStore>,
    source: RwLock<Option<Arc<dyn BlockSource>>>,
    cursor: Mutex<Option<SyncCursor>>,
    run_lock: tokio::sync::Mutex<()>,
    settings: IndexerSettings,
}

impl BlockIndexer {
    pub fn new(db: Arc<dyn KeyValueStore>, settings: IndexerSettings) -> Self {
        Self {
            db,
            source: RwLock::new(None),
            cursor: Mutex::new(None),
            run_lock: tokio::sync::Mutex::new(()),
            settings,
        }
    }

    /// Load the persisted cursor, creating it on first run.
    ///
    /// Returns immediately if already loaded.
    pub async fn init(&self) -> Result<SyncCursor, GxbError> {
        if let Some(cursor) = *self.cursor.lock() {
            return Ok(cursor);
        }
        let _run = self.run_lock.lock().await;
        if let Some(cursor) = *self.cursor.lock() {
            return Ok(cursor);
        }

        let cursor = match self.db.get(Keyspace::Metadata, META_SYNC_CURSOR)? {
            Some(bytes) => {
                let cursor = SyncCursor::from_bytes(&bytes)?;
                info!(cursor = cursor.last_synced_block, "resuming block index");
                cursor
            }
            None => {
                let cursor = SyncCursor::new(self.settings.initial_block.unwrap_or(0));
                // Nothing at or below the starting cursor is ever indexed.
                self.db.put(
                    Keyspace::Metadata,
                    META_PRUNED_THROUGH,
                    &height_key(cursor.last_synced_block),
                )?;
                self.db.put(Keyspace::Metadata, META_SYNC_CURSOR, &cursor.to_bytes())?;
                info!(cursor = cursor.last_synced_block, "created block index");
                cursor
            }
        };
        *self.cursor.lock() = Some(cursor);
        Ok(cursor)
    }

    /// Fetch blocks through `source` from now on.
    pub fn attach(&self, source: Arc<dyn BlockSource>) {
        *self.source.write() = Some(source);
    }

    /// Stop fetching. A run already in progress keeps its source.
    pub fn detach(&self) {
        self.source.write().take();
    }

    pub fn cursor(&self) -> Option<SyncCursor> {
        *self.cursor.lock()
    }

    /// Index every block up to and including `target`.
    ///
    /// A no-op when `target` is at or below the cursor. On a failure at
    /// height N the cursor stays at N-1 and the error is returned.
    /// Returns the cursor height after the run.
    pub async fn sync_to_block(&self, target: u64) -> Result<u64, GxbError> {
        if let Some(cursor) = self.cursor() {
            if target <= cursor.last_synced_block {
                return Ok(cursor.last_synced_block);
            }
        }

        let _run = self.run_lock.lock().await;
        let start = self.cursor().ok_or(IndexError::NotInitialized)?;
        if target <= start.last_synced_block {
            return Ok(start.last_synced_block);
        }
        let source = self.source.read().clone().ok_or(IndexError::NoBlockSource)?;

        debug!(from = start.next_block(), to = target, "sync run");
        let mut cursor = start;
        let result = self.index_range(source.as_ref(), &mut cursor, target).await;

        if cursor != start {
            info!(
                indexed = cursor.last_synced_block - start.last_synced_block,
                cursor = cursor.last_synced_block,
                "blocks indexed"
            );
            if let Some(retain) = self.settings.retain_blocks {
                if let Err(e) = self.prune(cursor.last_synced_block, retain) {
                    warn!(error = %e, "pruning failed, retrying after the next run");
                }
            }
        }

        result.map(|()| cursor.last_synced_block)
    }

    async fn index_range(
        &self,
        source: &dyn BlockSource,
        cursor: &mut SyncCursor,
        target: u64,
    ) -> Result<(), GxbError> {
        for height in cursor.next_block()..=target {
            let block = match source.fetch_block(height).await {
                Ok(Some(block)) => block,
                Ok(None) => return Err(IndexError::BlockNotFound(height).into()),
                Err(e) => {
                    return Err(IndexError::BlockFetch {
                        height,
                        reason: e.to_string(),
                    }
                    .into());
                }
            };

            let (summary, txs) = block.records(height)?;
            for tx in &txs {
                self.db.put(Keyspace::Transactions, tx.txid.as_bytes(), &serde_json::to_vec(tx)?)?;
            }
            self.db.put(Keyspace::Blocks, &height_key(height), &serde_json::to_vec(&summary)?)?;

            let mut next = *cursor;
            next.advance(height);
            self.db.put(Keyspace::Metadata, META_SYNC_CURSOR, &next.to_bytes())?;
            *cursor = next;
            *self.cursor.lock() = Some(next);
        }
        Ok(())
    }

    /// Delete records of every height from the pruned-through marker up to
    /// `current - retain`, then advance the marker.
    ///
    /// The marker moves only after the whole window is gone, so a failed or
    /// interrupted prune is picked up again by the next run.
    fn prune(&self, current: u64, retain: u64) -> Result<u64, GxbError> {
        let floor = self.pruned_through()?;
        let to = current.saturating_sub(retain);
        if to <= floor {
            return Ok(0);
        }
        let mut pruned = 0;
        for height in floor + 1..=to {
            let key = height_key(height);
            let Some(bytes) = self.db.get(Keyspace::Blocks, &key)? else {
                continue;
            };
            let summary: BlockRecord = serde_json::from_slice(&bytes)?;
            for txid in &summary.transaction_ids {
                self.db.delete(Keyspace::Transactions, txid.as_bytes())?;
            }
            self.db.delete(Keyspace::Blocks, &key)?;
            pruned += 1;
        }
        self.db.put(Keyspace::Metadata, META_PRUNED_THROUGH, &height_key(to))?;
        if pruned > 0 {
            debug!(pruned, below = to + 1, "pruned block records");
        }
        Ok(pruned)
    }

    /// Highest height known to hold no records. Stores created before the
    /// marker existed start from zero.
    fn pruned_through(&self) -> Result<u64, GxbError> {
        match self.db.get(Keyspace::Metadata, META_PRUNED_THROUGH)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| GxbError::Storage("invalid pruned-through length".into()))?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(0),
        }
    }

    /// Persist the cursor and flush. Safe at any time.
    pub fn store(&self) -> Result<(), GxbError> {
        if let Some(cursor) = self.cursor() {
            self.db.put(Keyspace::Metadata, META_SYNC_CURSOR, &cursor.to_bytes())?;
        }
        self.db.flush()
    }

    /// Look up an indexed transaction by (normalized) id.
    pub fn transaction(&self, txid: &str) -> Result<Option<TxRecord>, GxbError> {
        match self.db.get(Keyspace::Transactions, txid.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn block_record(&self, height: u64) -> Result<Option<BlockRecord>, GxbError> {
        match self.db.get(Keyspace::Blocks, &height_key(height))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// Requests sync runs from the worker started by [`spawn_sync_worker`].
#[derive(Clone)]
pub struct SyncHandle {
    target: Arc<watch::Sender<u64>>,
}

impl SyncHandle {
    /// Ask the worker to index up to `target`. Lower or equal targets than
    /// the pending one are dropped.
    pub fn request(&self, target: u64) {
        self.target.send_if_modified(|pending| {
            if target > *pending {
                *pending = target;
                true
            } else {
                false
            }
        });
    }

    /// Highest target requested so far.
    pub fn pending(&self) -> u64 {
        *self.target.borrow()
    }
}

/// Run `indexer` in a background task fed by a coalescing target slot.
///
/// A failed run is logged and dropped; the next request above the cursor
/// retries from the failed height.
pub fn spawn_sync_worker(indexer: Arc<BlockIndexer>) -> (SyncHandle, JoinHandle<()>) {
    let floor = indexer.cursor().map(|c| c.last_synced_block).unwrap_or(0);
    let (tx, mut rx) = watch::channel(floor);
    let target = Arc::new(tx);
    let handle = SyncHandle {
        target: Arc::clone(&target),
    };

    let task = tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let requested = *rx.borrow_and_update();
            match indexer.sync_to_block(requested).await {
                Ok(cursor) => debug!(cursor, "sync run complete"),
                Err(e) => {
                    warn!(height = requested, error = %e, "sync run aborted");
                    let cursor = indexer.cursor().map(|c| c.last_synced_block).unwrap_or(0);
                    // Lower the slot back to the cursor so the same target
                    // is accepted again. Does not wake the worker.
                    target.send_if_modified(|pending| {
                        if *pending == requested {
                            *pending = cursor;
                        }
                        false
                    });
                }
            }
        }
    });

    (handle, task)
}

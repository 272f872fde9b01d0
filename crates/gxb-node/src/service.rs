//! The explorer service: connection, mirror, and indexer wired together.
//!
//! [`Explorer::run`] drives the startup sequence on every new session:
//! initialize the mirror and the indexer, attach the session as the block
//! source, subscribe, then mark the service ready. Losing the session marks
//! it not ready until the next startup completes. Queries fail fast with
//! [`GxbError::ServiceUnavailable`] while not ready.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use gxb_core::constants::{CORE_ASSET_DYNAMIC_DATA_ID, CORE_ASSET_PRECISION, META_LAST_CLOSE};
use gxb_core::error::GxbError;
use gxb_core::store::{KeyValueStore, Keyspace};
use gxb_core::types::{
    normalize_txid, ChainObject, ConnectionState, Endpoint, SignedBlock, TxRecord,
};

use crate::config::ExplorerConfig;
use crate::connection::{ConnectionManager, ConnectionSettings, LinkEvent};
use crate::indexer::{spawn_sync_worker, BlockIndexer, IndexerSettings, SyncHandle};
use crate::mirror::{ChainMirror, HeightListener};
use crate::session::{SessionBlockSource, WitnessConnector, WitnessSession};

/// Point-in-time view of the service, served by `/api/status`.
#[derive(Serialize, Debug, Clone)]
pub struct ExplorerStatus {
    pub state: ConnectionState,
    pub ready: bool,
    pub endpoint: Option<Endpoint>,
    pub last_synced_block: Option<u64>,
    pub last_irreversible_block: Option<u64>,
    pub head_block_number: Option<u64>,
    pub provisional: bool,
    pub subscribed: bool,
    pub sync_enabled: bool,
    pub previous_close: Option<DateTime<Utc>>,
}

/// Core asset supply in whole GXC.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Supply {
    pub total_supply: f64,
}

pub struct Explorer {
    config: ExplorerConfig,
    store: Arc<dyn KeyValueStore>,
    connection: Arc<ConnectionManager>,
    mirror: Arc<ChainMirror>,
    indexer: Arc<BlockIndexer>,
    sync: SyncHandle,
    sync_task: Mutex<Option<JoinHandle<()>>>,
    links: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
    ready: watch::Sender<bool>,
    previous_close: Option<DateTime<Utc>>,
}

impl Explorer {
    /// Build the service. Must be called inside a tokio runtime.
    pub fn new(
        config: ExplorerConfig,
        connector: Arc<dyn WitnessConnector>,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Arc<Self>, GxbError> {
        let previous_close = read_last_close(store.as_ref())?;
        if let Some(at) = previous_close {
            info!(at = %at, "previous shutdown");
        }

        let mirror = ChainMirror::new();
        let (connection, links) = ConnectionManager::start(
            ConnectionSettings::from_config(&config),
            connector,
            Arc::clone(&mirror),
        );
        let indexer = Arc::new(BlockIndexer::new(
            Arc::clone(&store),
            IndexerSettings::from_config(&config),
        ));
        let (sync, sync_task) = spawn_sync_worker(Arc::clone(&indexer));
        let (ready, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            store,
            connection,
            mirror,
            indexer,
            sync,
            sync_task: Mutex::new(Some(sync_task)),
            links: tokio::sync::Mutex::new(Some(links)),
            ready,
            previous_close,
        }))
    }

    /// Connect and keep the service up until the connection manager stops.
    pub async fn run(&self) -> Result<(), GxbError> {
        let Some(mut links) = self.links.lock().await.take() else {
            warn!("explorer already running");
            return Ok(());
        };

        self.connection.connect();
        while let Some(event) = links.recv().await {
            match event {
                LinkEvent::Up { generation, session } => {
                    if !self.connection.is_current(generation) {
                        debug!(generation, "skipping startup for superseded session");
                        continue;
                    }
                    match self.start_up(generation, session).await {
                        Ok(()) => {}
                        Err(e) if !self.connection.is_current(generation) => {
                            debug!(generation, error = %e, "superseded session failed startup");
                        }
                        Err(e) => {
                            error!(error = %e, "startup sequence failed, reconnecting");
                            self.ready.send_replace(false);
                            self.connection.report_failure(generation);
                        }
                    }
                }
                LinkEvent::Down => {
                    self.ready.send_replace(false);
                    self.indexer.detach();
                    warn!("explorer not ready, waiting for witness");
                }
            }
        }
        Ok(())
    }

    async fn start_up(&self, generation: u64, session: Arc<dyn WitnessSession>) -> Result<(), GxbError> {
        let (cursor, ()) = tokio::try_join!(self.indexer.init(), self.mirror.init(Arc::clone(&session)))?;
        self.indexer
            .attach(Arc::new(SessionBlockSource::new(Arc::clone(&session))));

        let listener: HeightListener = if self.config.sync_enabled {
            let sync = self.sync.clone();
            Arc::new(move |lib| sync.request(lib))
        } else {
            Arc::new(|_| {})
        };
        self.mirror.subscribe(listener).await?;

        // The session may have dropped while starting; its Down event is queued.
        if !self.connection.is_current(generation) {
            return Err(GxbError::ServiceUnavailable);
        }
        self.ready.send_replace(true);
        info!(
            endpoint = %session.endpoint(),
            cursor = cursor.last_synced_block,
            lib = self.mirror.last_irreversible_block_num().unwrap_or(0),
            "explorer ready"
        );
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait for the first (or next) completed startup.
    pub async fn wait_ready(&self) -> Result<(), GxbError> {
        let mut rx = self.ready.subscribe();
        rx.wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .map_err(|_| GxbError::ServiceUnavailable)
    }

    fn ensure_ready(&self) -> Result<(), GxbError> {
        if self.is_ready() && self.connection.state().is_connected() {
            Ok(())
        } else {
            Err(GxbError::ServiceUnavailable)
        }
    }

    pub fn status(&self) -> ExplorerStatus {
        let dgp = self.mirror.dynamic_global_properties();
        ExplorerStatus {
            state: self.connection.state(),
            ready: self.is_ready(),
            endpoint: self.connection.endpoint(),
            last_synced_block: self.indexer.cursor().map(|c| c.last_synced_block),
            last_irreversible_block: dgp.as_ref().map(|d| d.last_irreversible_block_num),
            head_block_number: dgp.as_ref().map(|d| d.head_block_number),
            provisional: self.mirror.is_provisional(),
            subscribed: self.mirror.is_subscribed(),
            sync_enabled: self.config.sync_enabled,
            previous_close: self.previous_close,
        }
    }

    pub async fn object(&self, id: &str) -> Result<ChainObject, GxbError> {
        self.ensure_ready()?;
        self.mirror.get(id).await
    }

    /// Fetch a block live from the witness.
    pub async fn block(&self, height: u64) -> Result<SignedBlock, GxbError> {
        self.ensure_ready()?;
        let session = self.connection.session().ok_or(GxbError::ServiceUnavailable)?;
        session
            .get_block(height)
            .await?
            .ok_or_else(|| GxbError::NotFound(format!("block {height}")))
    }

    /// Look up an indexed transaction. Ids are case-insensitive.
    pub async fn transaction(&self, txid: &str) -> Result<TxRecord, GxbError> {
        self.ensure_ready()?;
        let not_found = || GxbError::NotFound(format!("transaction {txid}"));
        let normalized = normalize_txid(txid).ok_or_else(not_found)?;
        self.indexer.transaction(&normalized)?.ok_or_else(not_found)
    }

    pub async fn supply(&self) -> Result<Supply, GxbError> {
        let object = self.object(CORE_ASSET_DYNAMIC_DATA_ID).await?;
        let raw = match object.payload.get("current_supply") {
            Some(Value::String(s)) => s
                .parse::<u64>()
                .map_err(|e| GxbError::Decode(format!("current_supply: {e}")))?,
            Some(Value::Number(n)) => n
                .as_u64()
                .ok_or_else(|| GxbError::Decode("current_supply out of range".into()))?,
            _ => return Err(GxbError::Decode("missing current_supply".into())),
        };
        Ok(Supply {
            total_supply: raw as f64 / CORE_ASSET_PRECISION as f64,
        })
    }

    /// Stop the connection and sync tasks, then flush the cursor and the
    /// last-close timestamp within the configured timeout.
    ///
    /// Returns whether the flush completed.
    pub async fn shutdown(&self, reason: &str) -> bool {
        info!(reason, "shutting down");
        self.ready.send_replace(false);
        self.connection.shutdown();
        if let Some(task) = self.sync_task.lock().take() {
            task.abort();
        }

        let indexer = Arc::clone(&self.indexer);
        let store = Arc::clone(&self.store);
        let flush = tokio::task::spawn_blocking(move || -> Result<(), GxbError> {
            indexer.store()?;
            let now = Utc::now().timestamp_millis();
            store.put(Keyspace::Metadata, META_LAST_CLOSE, &now.to_le_bytes())?;
            store.flush()
        });

        let timeout = self.config.shutdown_timeout();
        match tokio::time::timeout(timeout, flush).await {
            Ok(Ok(Ok(()))) => {
                info!(cursor = self.indexer.cursor().map(|c| c.last_synced_block).unwrap_or(0), "index flushed");
                true
            }
            Ok(Ok(Err(e))) => {
                error!(error = %e, "shutdown flush failed");
                false
            }
            Ok(Err(e)) => {
                error!(error = %e, "shutdown flush task failed");
                false
            }
            Err(_) => {
                error!(timeout_ms = timeout.as_millis() as u64, "shutdown flush timed out");
                false
            }
        }
    }

    pub fn previous_close(&self) -> Option<DateTime<Utc>> {
        self.previous_close
    }

    pub fn config(&self) -> &ExplorerConfig {
        &self.config
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn mirror(&self) -> &Arc<ChainMirror> {
        &self.mirror
    }

    pub fn indexer(&self) -> &Arc<BlockIndexer> {
        &self.indexer
    }
}

/// Last-close timestamp written by a previous shutdown.
pub fn read_last_close(store: &dyn KeyValueStore) -> Result<Option<DateTime<Utc>>, GxbError> {
    let Some(bytes) = store.get(Keyspace::Metadata, META_LAST_CLOSE)? else {
        return Ok(None);
    };
    let raw: [u8; 8] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| GxbError::Storage("invalid last-close length".into()))?;
    Ok(DateTime::from_timestamp_millis(i64::from_le_bytes(raw)))
}

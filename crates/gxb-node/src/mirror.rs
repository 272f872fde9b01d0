//! In-process mirror of chain objects, kept current by push notifications.
//!
//! The mirror owns the id → object cache. Entries are replaced wholesale on
//! every update. Each update of `2.1.0` invokes the registered height
//! listener with the new last irreversible block number; that callback is
//! the only input edge into the indexer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gxb_core::constants::DYNAMIC_GLOBAL_PROPERTY_ID;
use gxb_core::error::GxbError;
use gxb_core::types::{ChainObject, DynamicGlobalProperties};

use crate::session::WitnessSession;

/// Called with the finalized height on every `2.1.0` update.
pub type HeightListener = Arc<dyn Fn(u64) + Send + Sync>;

pub struct ChainMirror {
    objects: RwLock<HashMap<String, ChainObject>>,
    session: RwLock<Option<Arc<dyn WitnessSession>>>,
    listener: RwLock<Option<HeightListener>>,
    subscription: Mutex<Option<JoinHandle<()>>>,
    subscribed: AtomicBool,
    provisional: AtomicBool,
    subscription_error: Mutex<Option<String>>,
    /// Bumped on every reset so a stale notification task stops applying.
    epoch: AtomicU64,
}

impl ChainMirror {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            objects: RwLock::new(HashMap::new()),
            session: RwLock::new(None),
            listener: RwLock::new(None),
            subscription: Mutex::new(None),
            subscribed: AtomicBool::new(false),
            provisional: AtomicBool::new(false),
            subscription_error: Mutex::new(None),
            epoch: AtomicU64::new(0),
        })
    }

    /// Attach a session and prime the cache with `2.1.0`.
    pub async fn init(&self, session: Arc<dyn WitnessSession>) -> Result<(), GxbError> {
        *self.session.write() = Some(Arc::clone(&session));
        let dgp = fetch_one(session.as_ref(), DYNAMIC_GLOBAL_PROPERTY_ID).await?;
        info!(
            endpoint = %session.endpoint(),
            lib = dgp.dynamic_global_properties()?.last_irreversible_block_num,
            "chain mirror primed"
        );
        self.store(dgp);
        Ok(())
    }

    /// Register the height listener and start consuming notifications.
    ///
    /// Queries `2.1.0` once afterwards so the listener observes the current
    /// height without waiting for the next block. Subscribing twice is a
    /// no-op until the next [`reset_cache`](Self::reset_cache).
    pub async fn subscribe(self: &Arc<Self>, on_height: HeightListener) -> Result<(), GxbError> {
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let session = match self.session() {
            Some(session) => session,
            None => {
                self.subscribed.store(false, Ordering::SeqCst);
                return Err(GxbError::ServiceUnavailable);
            }
        };
        *self.listener.write() = Some(on_height);

        let notices = match session.subscribe_objects().await {
            Ok(rx) => rx,
            Err(e) => {
                *self.subscription_error.lock() = Some(e.to_string());
                self.subscribed.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let epoch = self.epoch.load(Ordering::SeqCst);
        let handle = tokio::spawn(consume(Arc::downgrade(self), notices, epoch));
        if let Some(old) = self.subscription.lock().replace(handle) {
            old.abort();
        }

        let dgp = fetch_one(session.as_ref(), DYNAMIC_GLOBAL_PROPERTY_ID).await?;
        self.apply(dgp);
        Ok(())
    }

    /// Cached object, or fetch it from the witness and cache it. A fetch
    /// does not clear the provisional flag; only a notification does.
    pub async fn get(&self, id: &str) -> Result<ChainObject, GxbError> {
        if let Some(object) = self.cached(id) {
            return Ok(object);
        }
        let session = self.session().ok_or(GxbError::ServiceUnavailable)?;
        let object = fetch_one(session.as_ref(), id).await?;
        self.apply(object.clone());
        Ok(object)
    }

    pub fn cached(&self, id: &str) -> Option<ChainObject> {
        self.objects.read().get(id).cloned()
    }

    pub fn dynamic_global_properties(&self) -> Option<DynamicGlobalProperties> {
        self.cached(DYNAMIC_GLOBAL_PROPERTY_ID)
            .and_then(|o| o.dynamic_global_properties().ok())
    }

    /// Finalized height from the cached `2.1.0`.
    pub fn last_irreversible_block_num(&self) -> Option<u64> {
        self.dynamic_global_properties()
            .map(|dgp| dgp.last_irreversible_block_num)
    }

    /// Drop every cached object, the subscription, the listener, and the
    /// session.
    pub fn reset_cache(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.subscription.lock().take() {
            handle.abort();
        }
        self.objects.write().clear();
        self.session.write().take();
        self.listener.write().take();
        self.subscribed.store(false, Ordering::SeqCst);
        self.provisional.store(false, Ordering::SeqCst);
        self.subscription_error.lock().take();
        info!("chain mirror reset");
    }

    /// Drop every cached object, keeping the subscription.
    pub fn clear_cache(&self) {
        self.objects.write().clear();
    }

    /// Flag the cache as possibly stale until the next notification.
    pub fn mark_provisional(&self) {
        if !self.provisional.swap(true, Ordering::SeqCst) {
            warn!("witness reconnecting, mirror marked provisional");
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.provisional.load(Ordering::SeqCst)
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    pub fn subscription_error(&self) -> Option<String> {
        self.subscription_error.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    fn session(&self) -> Option<Arc<dyn WitnessSession>> {
        self.session.read().clone()
    }

    fn store(&self, object: ChainObject) {
        self.objects.write().insert(object.id.clone(), object);
    }

    /// Replace the cached entry and notify the listener for `2.1.0`.
    fn apply(&self, object: ChainObject) {
        let lib = if object.is_dynamic_global_properties() {
            match object.dynamic_global_properties() {
                Ok(dgp) => Some(dgp.last_irreversible_block_num),
                Err(e) => {
                    warn!(error = %e, "undecodable dynamic global properties");
                    None
                }
            }
        } else {
            None
        };
        self.store(object);

        if let Some(lib) = lib {
            let listener = self.listener.read().clone();
            if let Some(listener) = listener {
                listener(lib);
            }
        }
    }

    fn apply_batch(&self, batch: Vec<Value>) {
        for raw in batch {
            match ChainObject::from_value(raw) {
                Ok(object) => self.apply(object),
                Err(e) => debug!(error = %e, "skipping notification entry"),
            }
        }
        self.provisional.store(false, Ordering::SeqCst);
    }
}

async fn consume(mirror: Weak<ChainMirror>, mut notices: mpsc::UnboundedReceiver<Vec<Value>>, epoch: u64) {
    while let Some(batch) = notices.recv().await {
        let Some(mirror) = mirror.upgrade() else { return };
        if mirror.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        mirror.apply_batch(batch);
    }
    if let Some(mirror) = mirror.upgrade() {
        if mirror.epoch.load(Ordering::SeqCst) == epoch {
            *mirror.subscription_error.lock() = Some("notification stream ended".into());
            debug!("notification stream ended");
        }
    }
}

async fn fetch_one(session: &dyn WitnessSession, id: &str) -> Result<ChainObject, GxbError> {
    let mut found = session.get_objects(&[id.to_string()]).await?;
    match found.pop().flatten() {
        Some(raw) => ChainObject::from_value(raw),
        None => Err(GxbError::NotFound(format!("object {id}"))),
    }
}

//! Scripted witness for tests.
//!
//! [`MockChain`] generates deterministic blocks for any height and holds the
//! chain objects. [`MockConnector`] hands out [`MockSession`]s over it with
//! per-endpoint latency and acceptance that tests can change at runtime.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};

use gxb_core::constants::{CORE_ASSET_DYNAMIC_DATA_ID, DYNAMIC_GLOBAL_PROPERTY_ID};
use gxb_core::error::{ConnectionError, GxbError};
use gxb_core::types::{Endpoint, SessionStatus, SignedBlock};

use crate::session::{BlockSource, StatusSink, WitnessConnector, WitnessSession};

/// Deterministic chain state shared by every mock session.
pub struct MockChain {
    objects: Mutex<HashMap<String, Value>>,
    failing: Mutex<HashSet<u64>>,
    missing: Mutex<HashSet<u64>>,
    fetched: Mutex<Vec<u64>>,
}

impl MockChain {
    /// A chain at LIB 0 with the core asset at 1,000,000,000 GXC.
    pub fn new() -> Arc<Self> {
        let chain = Self {
            objects: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            missing: Mutex::new(HashSet::new()),
            fetched: Mutex::new(Vec::new()),
        };
        chain.put_object(json!({
            "id": CORE_ASSET_DYNAMIC_DATA_ID,
            "current_supply": "100000000000000",
            "confidential_supply": "0",
            "accumulated_fees": "0",
            "fee_pool": "0"
        }));
        chain.set_irreversible(0);
        Arc::new(chain)
    }

    /// Transaction id of the `index`-th transaction in block `height`.
    pub fn txid(height: u64, index: usize) -> String {
        format!("{height:016x}{index:08x}")
    }

    /// The block at `height`: `height % 3 + 1` transactions.
    pub fn block(height: u64) -> SignedBlock {
        let count = (height % 3 + 1) as usize;
        let ids: Vec<String> = (0..count).map(|i| Self::txid(height, i)).collect();
        SignedBlock {
            previous: format!("{:08x}", height.saturating_sub(1)),
            timestamp: format!("2018-06-01T00:{:02}:{:02}", (height / 20) % 60, (height * 3) % 60),
            witness: format!("1.6.{}", height % 11 + 1),
            transaction_merkle_root: format!("{height:040x}"),
            block_id: Some(format!("{height:08x}{:032x}", height * 7)),
            transactions: ids
                .iter()
                .enumerate()
                .map(|(i, id)| {
                    json!({
                        "ref_block_num": height & 0xffff,
                        "operations": [[0, { "amount": { "amount": i, "asset_id": "1.3.1" } }]],
                        "signatures": [id]
                    })
                })
                .collect(),
            transaction_ids: ids,
        }
    }

    /// Update `2.1.0` to the given LIB (head two blocks ahead) and return it.
    pub fn set_irreversible(&self, lib: u64) -> Value {
        let dgp = json!({
            "id": DYNAMIC_GLOBAL_PROPERTY_ID,
            "head_block_number": lib + 2,
            "head_block_id": format!("{:08x}", lib + 2),
            "time": "2018-06-01T00:00:00",
            "last_irreversible_block_num": lib
        });
        self.put_object(dgp.clone());
        dgp
    }

    pub fn put_object(&self, object: Value) {
        if let Some(id) = object.get("id").and_then(Value::as_str) {
            self.objects.lock().insert(id.to_string(), object.clone());
        }
    }

    pub fn object(&self, id: &str) -> Option<Value> {
        self.objects.lock().get(id).cloned()
    }

    /// Make fetches of `height` fail until [`heal_block`](Self::heal_block).
    pub fn fail_block(&self, height: u64) {
        self.failing.lock().insert(height);
    }

    pub fn heal_block(&self, height: u64) {
        self.failing.lock().remove(&height);
    }

    /// Make `height` unknown to the witness.
    pub fn drop_block(&self, height: u64) {
        self.missing.lock().insert(height);
    }

    /// Every height fetched so far, failed attempts included.
    pub fn fetched(&self) -> Vec<u64> {
        self.fetched.lock().clone()
    }

    fn fetch(&self, height: u64) -> Result<Option<SignedBlock>, GxbError> {
        self.fetched.lock().push(height);
        if self.failing.lock().contains(&height) {
            return Err(ConnectionError::Rpc(format!("get_block {height}: scripted failure")).into());
        }
        if self.missing.lock().contains(&height) {
            return Ok(None);
        }
        Ok(Some(Self::block(height)))
    }
}

#[async_trait]
impl BlockSource for MockChain {
    async fn fetch_block(&self, height: u64) -> Result<Option<SignedBlock>, GxbError> {
        self.fetch(height)
    }
}

/// How an endpoint answers probes and connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointBehavior {
    /// Probe latency; `None` means unreachable.
    pub latency: Option<Duration>,
    /// Whether connects succeed.
    pub accept: bool,
}

impl EndpointBehavior {
    pub fn up(latency_ms: u64) -> Self {
        Self {
            latency: Some(Duration::from_millis(latency_ms)),
            accept: true,
        }
    }

    pub fn down() -> Self {
        Self {
            latency: None,
            accept: false,
        }
    }

    /// Answers probes but refuses sessions.
    pub fn refusing(latency_ms: u64) -> Self {
        Self {
            latency: Some(Duration::from_millis(latency_ms)),
            accept: false,
        }
    }
}

pub struct MockConnector {
    chain: Arc<MockChain>,
    behaviors: Mutex<HashMap<String, EndpointBehavior>>,
    attempts: Mutex<Vec<Endpoint>>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    next_gate: Mutex<Option<watch::Receiver<bool>>>,
}

impl MockConnector {
    pub fn new(chain: Arc<MockChain>) -> Self {
        Self {
            chain,
            behaviors: Mutex::new(HashMap::new()),
            attempts: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
            next_gate: Mutex::new(None),
        }
    }

    /// Hold `get_objects` on the next session until `true` is sent on the
    /// returned gate (or the gate is dropped).
    pub fn hold_next_session(&self) -> watch::Sender<bool> {
        let (tx, rx) = watch::channel(false);
        *self.next_gate.lock() = Some(rx);
        tx
    }

    pub fn chain(&self) -> &Arc<MockChain> {
        &self.chain
    }

    pub fn set(&self, endpoint: &str, behavior: EndpointBehavior) {
        self.behaviors.lock().insert(endpoint.to_string(), behavior);
    }

    /// Endpoints passed to `connect`, in call order.
    pub fn connect_attempts(&self) -> Vec<Endpoint> {
        self.attempts.lock().clone()
    }

    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.sessions.lock().clone()
    }

    pub fn last_session(&self) -> Option<Arc<MockSession>> {
        self.sessions.lock().last().cloned()
    }

    fn behavior(&self, endpoint: &Endpoint) -> EndpointBehavior {
        self.behaviors
            .lock()
            .get(&endpoint.url)
            .copied()
            .unwrap_or_else(EndpointBehavior::down)
    }
}

#[async_trait]
impl WitnessConnector for MockConnector {
    async fn probe(&self, endpoint: &Endpoint) -> Result<Duration, GxbError> {
        match self.behavior(endpoint).latency {
            Some(latency) => {
                tokio::time::sleep(latency).await;
                Ok(latency)
            }
            None => Err(ConnectionError::ProbeTimeout(endpoint.url.clone()).into()),
        }
    }

    async fn connect(
        &self,
        endpoint: &Endpoint,
        status: StatusSink,
    ) -> Result<Arc<dyn WitnessSession>, GxbError> {
        self.attempts.lock().push(endpoint.clone());
        if !self.behavior(endpoint).accept {
            return Err(ConnectionError::ConnectFailed {
                endpoint: endpoint.url.clone(),
                reason: "refused".into(),
            }
            .into());
        }
        let mut session = MockSession::new(endpoint.clone(), Arc::clone(&self.chain), Some(status));
        session.gate = self.next_gate.lock().take();
        let session = Arc::new(session);
        session.emit(SessionStatus::Open);
        self.sessions.lock().push(Arc::clone(&session));
        let session: Arc<dyn WitnessSession> = session;
        Ok(session)
    }
}

pub struct MockSession {
    endpoint: Endpoint,
    chain: Arc<MockChain>,
    status: Option<StatusSink>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Vec<Value>>>>,
    closed: AtomicBool,
    gate: Option<watch::Receiver<bool>>,
}

impl MockSession {
    fn new(endpoint: Endpoint, chain: Arc<MockChain>, status: Option<StatusSink>) -> Self {
        Self {
            endpoint,
            chain,
            status,
            subscribers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            gate: None,
        }
    }

    /// A session not owned by any connection manager.
    pub fn detached(endpoint: &str, chain: Arc<MockChain>) -> Arc<Self> {
        Arc::new(Self::new(Endpoint::from(endpoint), chain, None))
    }

    /// Advance the chain's LIB and notify this session's subscribers.
    pub fn push_irreversible(&self, lib: u64) {
        let dgp = self.chain.set_irreversible(lib);
        self.notify(vec![dgp]);
    }

    /// Deliver one notification batch.
    pub fn notify(&self, objects: Vec<Value>) {
        for object in &objects {
            self.chain.put_object(object.clone());
        }
        self.subscribers
            .lock()
            .retain(|tx| tx.send(objects.clone()).is_ok());
    }

    /// Report a status to the owning manager.
    pub fn emit(&self, status: SessionStatus) {
        if let Some(sink) = &self.status {
            sink.emit(status);
        }
    }

    /// Drop the transport: requests fail, notification streams end, and
    /// `closed` is reported.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.subscribers.lock().clear();
        self.emit(SessionStatus::Closed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn check_open(&self) -> Result<(), GxbError> {
        if self.is_closed() {
            return Err(ConnectionError::SessionClosed.into());
        }
        Ok(())
    }
}

#[async_trait]
impl WitnessSession for MockSession {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn get_objects(&self, ids: &[String]) -> Result<Vec<Option<Value>>, GxbError> {
        if let Some(gate) = &self.gate {
            let mut gate = gate.clone();
            let _ = gate.wait_for(|open| *open).await;
        }
        self.check_open()?;
        Ok(ids.iter().map(|id| self.chain.object(id)).collect())
    }

    async fn get_block(&self, height: u64) -> Result<Option<SignedBlock>, GxbError> {
        self.check_open()?;
        self.chain.fetch(height)
    }

    async fn subscribe_objects(&self) -> Result<mpsc::UnboundedReceiver<Vec<Value>>, GxbError> {
        self.check_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        Ok(rx)
    }
}

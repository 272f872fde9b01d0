//! Contracts between the explorer core and the witness RPC transport.
//!
//! - [`WitnessConnector`]: probes endpoints and opens sessions
//! - [`WitnessSession`]: object queries, block fetches, change notifications
//! - [`BlockSource`]: the narrow view the indexer fetches blocks through
//!
//! Sessions report `open | closed | error | reconnect` through the
//! [`StatusSink`] they were created with. Each sink carries the generation of
//! the connection attempt that created it, so reports from a superseded
//! session can be told apart from the current one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use gxb_core::error::GxbError;
use gxb_core::types::{Endpoint, SessionStatus, SignedBlock};

/// Where a session sends its status reports.
#[derive(Clone, Debug)]
pub struct StatusSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, SessionStatus)>,
}

impl StatusSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, SessionStatus)>) -> Self {
        Self { generation, tx }
    }

    /// Report a status change. Dropped silently once the manager is gone.
    pub fn emit(&self, status: SessionStatus) {
        let _ = self.tx.send((self.generation, status));
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Opens sessions against witness endpoints.
#[async_trait]
pub trait WitnessConnector: Send + Sync {
    /// Measure round-trip latency to `endpoint`. An error means unreachable.
    async fn probe(&self, endpoint: &Endpoint) -> Result<Duration, GxbError>;

    /// Open a session. The session reports its status through `status`.
    async fn connect(
        &self,
        endpoint: &Endpoint,
        status: StatusSink,
    ) -> Result<Arc<dyn WitnessSession>, GxbError>;
}

/// An open RPC session with one witness.
#[async_trait]
pub trait WitnessSession: Send + Sync {
    /// The endpoint this session is connected to.
    fn endpoint(&self) -> &Endpoint;

    /// Fetch objects by id. Unknown ids yield `None` at their position.
    async fn get_objects(&self, ids: &[String]) -> Result<Vec<Option<Value>>, GxbError>;

    /// Fetch a block by height. `None` if the witness does not have it.
    async fn get_block(&self, height: u64) -> Result<Option<SignedBlock>, GxbError>;

    /// Start object-change notifications. Each item is one batch of changed
    /// objects; the channel closes when the session ends.
    async fn subscribe_objects(&self) -> Result<mpsc::UnboundedReceiver<Vec<Value>>, GxbError>;
}

/// Blocks by height, as the indexer needs them.
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn fetch_block(&self, height: u64) -> Result<Option<SignedBlock>, GxbError>;
}

/// [`BlockSource`] backed by a witness session.
pub struct SessionBlockSource {
    session: Arc<dyn WitnessSession>,
}

impl SessionBlockSource {
    pub fn new(session: Arc<dyn WitnessSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl BlockSource for SessionBlockSource {
    async fn fetch_block(&self, height: u64) -> Result<Option<SignedBlock>, GxbError> {
        self.session.get_block(height).await
    }
}

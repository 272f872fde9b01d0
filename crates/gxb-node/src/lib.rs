//! # gxb-node: witness connectivity, chain mirror, and block indexing.
//!
//! Composes the explorer core:
//! - [`probe::EndpointProbe`] and [`connection::ConnectionManager`]: endpoint
//!   selection and the reconnecting session state machine
//! - [`mirror::ChainMirror`]: push-updated cache of chain objects
//! - [`indexer::BlockIndexer`]: incremental, cursor-tracked block indexing
//! - [`storage::RocksStore`]: persistent index storage backed by RocksDB
//! - [`service::Explorer`]: startup sequencing and the query surface
//! - [`ws::WsConnector`]: Graphene JSON-RPC over WebSocket
//! - [`config::ExplorerConfig`]: service configuration

pub mod config;
pub mod connection;
pub mod indexer;
pub mod mirror;
pub mod probe;
pub mod service;
pub mod session;
pub mod storage;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod ws;

pub use config::ExplorerConfig;
pub use connection::{ConnectionManager, ConnectionSettings, LinkEvent};
pub use indexer::{BlockIndexer, IndexerSettings, SyncHandle};
pub use mirror::ChainMirror;
pub use service::{Explorer, ExplorerStatus, Supply};
pub use storage::RocksStore;
pub use ws::WsConnector;

//! Core types: endpoints, connection states, chain objects, blocks, and the
//! records the indexer derives from them.
//!
//! Chain payloads arrive as JSON from the witness and are kept as
//! [`serde_json::Value`] wherever the explorer only passes them through.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::DYNAMIC_GLOBAL_PROPERTY_ID;
use crate::error::{GxbError, IndexError};

/// A witness node RPC endpoint, e.g. `wss://node1.gxb.io`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Endpoint {
    pub url: String,
}

impl Endpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

impl From<&str> for Endpoint {
    fn from(url: &str) -> Self {
        Self::new(url)
    }
}

impl From<String> for Endpoint {
    fn from(url: String) -> Self {
        Self { url }
    }
}

/// Result of probing one endpoint. `latency == None` means unreachable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointHealth {
    pub endpoint: Endpoint,
    pub latency: Option<Duration>,
}

impl EndpointHealth {
    pub fn reachable(endpoint: Endpoint, latency: Duration) -> Self {
        Self { endpoint, latency: Some(latency) }
    }

    pub fn unreachable(endpoint: Endpoint) -> Self {
        Self { endpoint, latency: None }
    }

    pub fn is_reachable(&self) -> bool {
        self.latency.is_some()
    }
}

/// Connectivity state of the witness link.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No session and no attempt in progress (possibly waiting to retry).
    #[default]
    Disconnected,
    /// Measuring endpoint latencies.
    Probing,
    /// Opening a session against the ranked endpoint list.
    Connecting,
    /// Session open and usable.
    Connected,
    /// The session reported a transient reconnect; cached state is provisional.
    Reconnecting,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Reconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Probing => "probing",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Status reported by an RPC session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    Open,
    Closed,
    Error,
    Reconnect,
}

impl FromStr for SessionStatus {
    type Err = GxbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            "error" => Ok(Self::Error),
            "reconnect" => Ok(Self::Reconnect),
            other => Err(GxbError::Decode(format!("unknown session status: {other}"))),
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Error => "error",
            Self::Reconnect => "reconnect",
        };
        f.write_str(s)
    }
}

/// An id-addressed piece of on-chain state, e.g. `1.2.17` (account) or
/// `2.1.0` (dynamic global properties).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChainObject {
    pub id: String,
    pub payload: Value,
}

impl ChainObject {
    /// Build from a raw witness object, reading the id from its `id` field.
    pub fn from_value(payload: Value) -> Result<Self, GxbError> {
        let id = payload
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| GxbError::Decode("chain object without id".into()))?
            .to_string();
        Ok(Self { id, payload })
    }

    pub fn is_dynamic_global_properties(&self) -> bool {
        self.id == DYNAMIC_GLOBAL_PROPERTY_ID
    }

    /// Decode the payload as dynamic global properties.
    pub fn dynamic_global_properties(&self) -> Result<DynamicGlobalProperties, GxbError> {
        if !self.is_dynamic_global_properties() {
            return Err(GxbError::Decode(format!(
                "object {} is not {DYNAMIC_GLOBAL_PROPERTY_ID}",
                self.id
            )));
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// The fields of object `2.1.0` the explorer reads.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(default)]
pub struct DynamicGlobalProperties {
    pub head_block_number: u64,
    pub head_block_id: String,
    pub time: String,
    pub last_irreversible_block_num: u64,
}

/// High-water mark of the block index.
///
/// Every block at or below `last_synced_block` has its records durably
/// written. Only ever moves forward.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct SyncCursor {
    pub last_synced_block: u64,
}

impl SyncCursor {
    pub fn new(last_synced_block: u64) -> Self {
        Self { last_synced_block }
    }

    /// The next height to index.
    pub fn next_block(&self) -> u64 {
        self.last_synced_block + 1
    }

    /// Move the cursor to `height`. Returns false (and leaves the cursor
    /// alone) if that would move it backwards or nowhere.
    pub fn advance(&mut self, height: u64) -> bool {
        if height <= self.last_synced_block {
            return false;
        }
        self.last_synced_block = height;
        true
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        self.last_synced_block.to_le_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, GxbError> {
        let raw: [u8; 8] = bytes
            .try_into()
            .map_err(|_| GxbError::Storage("invalid sync cursor length".into()))?;
        Ok(Self::new(u64::from_le_bytes(raw)))
    }
}

impl fmt::Display for SyncCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.last_synced_block)
    }
}

/// A block as returned by the witness `get_block` call.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(default)]
pub struct SignedBlock {
    pub previous: String,
    pub timestamp: String,
    pub witness: String,
    pub transaction_merkle_root: String,
    pub block_id: Option<String>,
    pub transactions: Vec<Value>,
    pub transaction_ids: Vec<String>,
}

impl SignedBlock {
    /// Project this block into the records the index stores for it.
    ///
    /// Transaction ids are lowercased; record `i` pairs `transaction_ids[i]`
    /// with `transactions[i]`.
    pub fn records(&self, height: u64) -> Result<(BlockRecord, Vec<TxRecord>), IndexError> {
        if self.transaction_ids.len() != self.transactions.len() {
            return Err(IndexError::TransactionIdMismatch {
                height,
                ids: self.transaction_ids.len(),
                txs: self.transactions.len(),
            });
        }

        let txids: Vec<String> = self
            .transaction_ids
            .iter()
            .map(|id| id.to_ascii_lowercase())
            .collect();

        let txs = txids
            .iter()
            .zip(&self.transactions)
            .enumerate()
            .map(|(index, (txid, tx))| TxRecord {
                txid: txid.clone(),
                block_num: height,
                trx_in_block: index as u32,
                timestamp: self.timestamp.clone(),
                transaction: tx.clone(),
            })
            .collect();

        let block = BlockRecord {
            block_num: height,
            block_id: self.block_id.clone(),
            previous: self.previous.clone(),
            timestamp: self.timestamp.clone(),
            witness: self.witness.clone(),
            transaction_ids: txids,
        };

        Ok((block, txs))
    }
}

/// Per-block summary written by the indexer, keyed by height.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BlockRecord {
    pub block_num: u64,
    pub block_id: Option<String>,
    pub previous: String,
    pub timestamp: String,
    pub witness: String,
    pub transaction_ids: Vec<String>,
}

/// A transaction and its position in the chain, keyed by transaction id.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TxRecord {
    pub txid: String,
    pub block_num: u64,
    pub trx_in_block: u32,
    pub timestamp: String,
    pub transaction: Value,
}

/// Lowercase and validate a transaction id given by a client.
///
/// Returns `None` unless the input is non-empty hex.
pub fn normalize_txid(raw: &str) -> Option<String> {
    let txid = raw.trim().to_ascii_lowercase();
    if txid.is_empty() || hex::decode(&txid).is_err() {
        return None;
    }
    Some(txid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn block_with(ids: &[&str]) -> SignedBlock {
        SignedBlock {
            previous: "00000063".into(),
            timestamp: "2018-06-01T00:00:03".into(),
            witness: "1.6.1".into(),
            transactions: ids.iter().map(|id| json!({ "ref_block_num": 99, "marker": id })).collect(),
            transaction_ids: ids.iter().map(|id| id.to_string()).collect(),
            ..SignedBlock::default()
        }
    }

    #[test]
    fn endpoint_deserializes_from_plain_string() {
        let eps: Vec<Endpoint> = serde_json::from_str(r#"["wss://a", "wss://b"]"#).unwrap();
        assert_eq!(eps, vec![Endpoint::from("wss://a"), Endpoint::from("wss://b")]);
    }

    #[test]
    fn connection_state_defaults_to_disconnected() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert!(!ConnectionState::Probing.is_connected());
        assert!(ConnectionState::Reconnecting.is_connected());
    }

    #[test]
    fn session_status_parses_wire_names() {
        for s in ["open", "closed", "error", "reconnect"] {
            let status: SessionStatus = s.parse().unwrap();
            assert_eq!(status.to_string(), s);
        }
        assert!("opened".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn chain_object_requires_id() {
        assert!(ChainObject::from_value(json!({ "head_block_number": 1 })).is_err());
        let obj = ChainObject::from_value(json!({ "id": "1.2.0" })).unwrap();
        assert_eq!(obj.id, "1.2.0");
    }

    #[test]
    fn dynamic_global_properties_decode() {
        let obj = ChainObject::from_value(json!({
            "id": "2.1.0",
            "head_block_number": 1003,
            "head_block_id": "000003eb",
            "time": "2018-06-01T00:00:00",
            "last_irreversible_block_num": 1000,
            "witness_budget": 0
        }))
        .unwrap();
        let dgp = obj.dynamic_global_properties().unwrap();
        assert_eq!(dgp.last_irreversible_block_num, 1000);
        assert_eq!(dgp.head_block_number, 1003);
    }

    #[test]
    fn dynamic_global_properties_rejects_other_objects() {
        let obj = ChainObject::from_value(json!({ "id": "2.3.1" })).unwrap();
        assert!(obj.dynamic_global_properties().is_err());
    }

    #[test]
    fn cursor_never_moves_backwards() {
        let mut cursor = SyncCursor::new(5);
        assert!(!cursor.advance(3));
        assert!(!cursor.advance(5));
        assert_eq!(cursor.last_synced_block, 5);
        assert!(cursor.advance(6));
        assert_eq!(cursor.next_block(), 7);
    }

    #[test]
    fn cursor_bytes_reject_bad_length() {
        let cursor = SyncCursor::new(995);
        assert_eq!(SyncCursor::from_bytes(&cursor.to_bytes()).unwrap(), cursor);
        assert!(SyncCursor::from_bytes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn records_pair_ids_with_transactions() {
        let block = block_with(&["AB01", "cd02"]);
        let (summary, txs) = block.records(42).unwrap();
        assert_eq!(summary.block_num, 42);
        assert_eq!(summary.transaction_ids, vec!["ab01", "cd02"]);
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[1].txid, "cd02");
        assert_eq!(txs[1].trx_in_block, 1);
        assert_eq!(txs[1].transaction["marker"], "cd02");
    }

    #[test]
    fn records_are_deterministic() {
        let block = block_with(&["ab01"]);
        let (_, a) = block.records(9).unwrap();
        let (_, b) = block.records(9).unwrap();
        assert_eq!(serde_json::to_vec(&a[0]).unwrap(), serde_json::to_vec(&b[0]).unwrap());
    }

    #[test]
    fn records_reject_mismatched_ids() {
        let mut block = block_with(&["ab01"]);
        block.transaction_ids.clear();
        assert_eq!(
            block.records(3).unwrap_err(),
            IndexError::TransactionIdMismatch { height: 3, ids: 0, txs: 1 }
        );
    }

    #[test]
    fn empty_block_has_no_tx_records() {
        let (summary, txs) = SignedBlock::default().records(1).unwrap();
        assert!(txs.is_empty());
        assert!(summary.transaction_ids.is_empty());
    }

    proptest::proptest! {
        #[test]
        fn cursor_is_max_of_advances(start in 0u64..1_000, heights in proptest::collection::vec(0u64..2_000, 0..50)) {
            let mut cursor = SyncCursor::new(start);
            for &h in &heights {
                let before = cursor.last_synced_block;
                cursor.advance(h);
                proptest::prop_assert!(cursor.last_synced_block >= before);
            }
            let expected = heights.iter().copied().fold(start, u64::max);
            proptest::prop_assert_eq!(cursor.last_synced_block, expected);
        }
    }

    #[test]
    fn txid_normalization() {
        assert_eq!(normalize_txid(" ABCD01 ").as_deref(), Some("abcd01"));
        assert!(normalize_txid("").is_none());
        assert!(normalize_txid("xyz").is_none());
        assert!(normalize_txid("abc").is_none());
    }
}

//! Error types for gxb-explorer.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("no reachable witness endpoint")] NoReachableEndpoint,
    #[error("all {attempted} candidate endpoints failed")] AllCandidatesFailed { attempted: usize },
    #[error("connect to {endpoint} failed: {reason}")] ConnectFailed { endpoint: String, reason: String },
    #[error("probe of {0} timed out")] ProbeTimeout(String),
    #[error("session closed")] SessionClosed,
    #[error("rpc error: {0}")] Rpc(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("fetch of block {height} failed: {reason}")] BlockFetch { height: u64, reason: String },
    #[error("block {0} not found")] BlockNotFound(u64),
    #[error("block {height} has {ids} transaction ids for {txs} transactions")] TransactionIdMismatch { height: u64, ids: usize, txs: usize },
    #[error("no block source attached")] NoBlockSource,
    #[error("indexer not initialized")] NotInitialized,
}

#[derive(Error, Debug)]
pub enum GxbError {
    #[error(transparent)] Connection(#[from] ConnectionError),
    #[error(transparent)] Index(#[from] IndexError),
    #[error("storage: {0}")] Storage(String),
    #[error("decode: {0}")] Decode(String),
    #[error("not found: {0}")] NotFound(String),
    #[error("service unavailable")] ServiceUnavailable,
}

impl From<serde_json::Error> for GxbError {
    fn from(e: serde_json::Error) -> Self {
        GxbError::Decode(e.to_string())
    }
}

impl GxbError {
    /// True for errors caused by the witness link rather than local state.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, GxbError::Connection(_) | GxbError::ServiceUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_are_connectivity() {
        let e: GxbError = ConnectionError::SessionClosed.into();
        assert!(e.is_connectivity());
        assert!(GxbError::ServiceUnavailable.is_connectivity());
    }

    #[test]
    fn index_errors_are_not_connectivity() {
        let e: GxbError = IndexError::BlockNotFound(7).into();
        assert!(!e.is_connectivity());
        assert_eq!(e.to_string(), "block 7 not found");
    }

    #[test]
    fn serde_errors_map_to_decode() {
        let err = serde_json::from_str::<u64>("nope").unwrap_err();
        assert!(matches!(GxbError::from(err), GxbError::Decode(_)));
    }
}

//! Explorer configuration.
//!
//! [`ExplorerConfig`] has defaults for every field. [`ExplorerConfig::load`]
//! layers an optional config file (format by extension) under `GXB_*`
//! environment variables; the binary applies CLI flags on top and then calls
//! [`ExplorerConfig::validate`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use gxb_core::constants::{
    DEFAULT_HTTP_PORT, DEFAULT_PROBE_TIMEOUT, DEFAULT_REQUEST_TIMEOUT, DEFAULT_RETRY_INTERVAL,
    DEFAULT_SHUTDOWN_TIMEOUT,
};
use gxb_core::types::Endpoint;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Source(#[from] config::ConfigError),
    #[error("no witness endpoints configured")]
    NoWitnesses,
    #[error("{0} must be non-zero")]
    Zero(&'static str),
}

/// Configuration for an explorer instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExplorerConfig {
    /// Witness RPC endpoints, in configuration (tie-break) order.
    pub witnesses: Vec<Endpoint>,
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// IP address for the HTTP facade to bind to.
    pub http_bind: String,
    /// Port for the HTTP facade.
    pub http_port: u16,
    /// Upper bound on one endpoint latency probe.
    pub probe_timeout_ms: u64,
    /// Fixed delay between connection attempts.
    pub retry_interval_ms: u64,
    /// Upper bound on one RPC request.
    pub request_timeout_ms: u64,
    /// Index finalized blocks. When false only the mirror runs.
    pub sync_enabled: bool,
    /// Cursor used on first run, when nothing is persisted yet.
    pub initial_block: Option<u64>,
    /// Keep records for at most this many blocks below the cursor.
    pub retain_blocks: Option<u64>,
    /// Upper bound on the shutdown flush.
    pub shutdown_timeout_ms: u64,
    /// Log level filter string (e.g. "info", "gxb_node_lib=debug").
    pub log_level: String,
    /// Log output format, "text" or "json".
    pub log_format: String,
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gxb-explorer");

        Self {
            witnesses: Vec::new(),
            data_dir,
            http_bind: "127.0.0.1".to_string(),
            http_port: DEFAULT_HTTP_PORT,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT.as_millis() as u64,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL.as_millis() as u64,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            sync_enabled: true,
            initial_block: None,
            retain_blocks: None,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT.as_millis() as u64,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}

impl ExplorerConfig {
    /// Load from an optional file plus `GXB_*` environment variables.
    ///
    /// `GXB_WITNESSES` takes a comma-separated list.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("GXB")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("witnesses"),
        );
        Ok(builder.build()?.try_deserialize()?)
    }

    /// Reject configurations the service cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.witnesses.is_empty() {
            return Err(ConfigError::NoWitnesses);
        }
        if self.retry_interval_ms == 0 {
            return Err(ConfigError::Zero("retry_interval_ms"));
        }
        if self.probe_timeout_ms == 0 {
            return Err(ConfigError::Zero("probe_timeout_ms"));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Zero("request_timeout_ms"));
        }
        if self.shutdown_timeout_ms == 0 {
            return Err(ConfigError::Zero("shutdown_timeout_ms"));
        }
        Ok(())
    }

    /// Path to the RocksDB index directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("index")
    }

    /// Socket address string for the HTTP facade.
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.http_bind, self.http_port)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

//! GXChain explorer backend.
//!
//! Connects to the fastest reachable witness, mirrors chain state, indexes
//! finalized blocks into RocksDB, and serves the query API over HTTP once the
//! first startup sequence has completed.

mod routes;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use gxb_core::types::Endpoint;
use gxb_node_lib::{Explorer, ExplorerConfig, RocksStore, WsConnector};
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub explorer: Arc<Explorer>,
}

/// GXChain explorer backend
#[derive(Parser, Debug)]
#[command(
    name = "gxb-explorer",
    version,
    about = "GXChain explorer backend with witness failover and block indexing"
)]
struct Args {
    /// Config file (TOML, JSON, or YAML by extension)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Witness RPC endpoints (comma-separated)
    #[arg(long, value_delimiter = ',')]
    witnesses: Vec<String>,

    /// Data directory for the block index
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// HTTP bind address
    #[arg(long)]
    http_bind: Option<String>,

    /// HTTP port
    #[arg(long)]
    http_port: Option<u16>,

    /// Delay between connection attempts, in milliseconds
    #[arg(long)]
    retry_interval_ms: Option<u64>,

    /// Block to start indexing after on first run
    #[arg(long)]
    initial_block: Option<u64>,

    /// Keep index records for only this many recent blocks
    #[arg(long)]
    retain_blocks: Option<u64>,

    /// Mirror chain state without indexing blocks
    #[arg(long)]
    no_sync: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format ("text" or "json")
    #[arg(long)]
    log_format: Option<String>,
}

impl Args {
    /// Load the file and environment layers, then apply CLI overrides.
    fn into_config(self) -> Result<ExplorerConfig> {
        let mut config = ExplorerConfig::load(self.config.as_deref())
            .context("failed to load configuration")?;

        if !self.witnesses.is_empty() {
            config.witnesses = self.witnesses.into_iter().map(Endpoint::from).collect();
        }
        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        if let Some(bind) = self.http_bind {
            config.http_bind = bind;
        }
        if let Some(port) = self.http_port {
            config.http_port = port;
        }
        if let Some(ms) = self.retry_interval_ms {
            config.retry_interval_ms = ms;
        }
        if self.initial_block.is_some() {
            config.initial_block = self.initial_block;
        }
        if self.retain_blocks.is_some() {
            config.retain_blocks = self.retain_blocks;
        }
        if self.no_sync {
            config.sync_enabled = false;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(2);
        }
    };

    init_logging(&config.log_level, &config.log_format);

    info!(
        witnesses = config.witnesses.len(),
        data_dir = %config.data_dir.display(),
        http = %config.http_addr(),
        sync = config.sync_enabled,
        "starting gxb-explorer"
    );

    if let Err(e) = run(config).await {
        error!(error = %format!("{e:#}"), "gxb-explorer exited with error");
        process::exit(1);
    }
    info!("gxb-explorer shutdown complete");
}

async fn run(config: ExplorerConfig) -> Result<()> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;
    let store = Arc::new(
        RocksStore::open(config.db_path())
            .with_context(|| format!("failed to open index at {}", config.db_path().display()))?,
    );
    let connector = Arc::new(WsConnector::new(config.request_timeout(), config.probe_timeout()));
    let explorer = Explorer::new(config.clone(), connector, store)?;

    let mut service = {
        let explorer = Arc::clone(&explorer);
        tokio::spawn(async move { explorer.run().await })
    };

    let outcome = tokio::select! {
        served = serve(Arc::clone(&explorer), config.http_addr()) => {
            served.context("HTTP facade failed")
        }
        stopped = &mut service => match stopped {
            Ok(Ok(())) => Err(anyhow::anyhow!("explorer service stopped")),
            Ok(Err(e)) => Err(e).context("explorer service failed"),
            Err(e) => Err(e).context("explorer service panicked"),
        },
        signal = shutdown_signal() => {
            info!(signal, "shutdown signal received");
            Ok(())
        }
    };

    let reason = if outcome.is_ok() { "signal" } else { "fatal error" };
    if !explorer.shutdown(reason).await {
        warn!("index flush incomplete, the next start re-indexes from the last persisted cursor");
    }
    service.abort();
    outcome
}

/// Bind and serve the HTTP facade once the explorer is ready.
async fn serve(explorer: Arc<Explorer>, addr: String) -> Result<()> {
    explorer.wait_ready().await?;
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "HTTP facade listening");
    axum::serve(listener, routes::router(AppState { explorer })).await?;
    Ok(())
}

/// Resolve on SIGINT or, on unix, SIGTERM.
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// Pass `format = "json"` for structured JSON output. Any other value
/// defaults to human-readable text. `RUST_LOG` overrides the level.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}

#![forbid(unsafe_code)]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::float_cmp)]
#![deny(clippy::cast_precision_loss)]
#![deny(clippy::cast_possible_truncation)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::cast_sign_loss)]
#![deny(clippy::disallowed_types)]

mod genesis;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use prometheus::{Encoder, IntGauge, Opts, Registry, TextEncoder};
use rollup_bridge::{
    spawn as spawn_bridge, BridgeConfig, BridgeHandle, BridgeSnapshot, EvmLogWatcher,
};
use rollup_sequencer::{
    spawn as spawn_sequencer, DrainOrder, SequencerConfig, SequencerHandle, SequencerSnapshot,
};
use rollup_storage::{Storage, TransactionCounts};
use serde::Serialize;
use thiserror::Error;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Badge rollup sequencer node")]
pub struct Settings {
    #[arg(long, env = "ROLLUP_DB_PATH", default_value = "./data/rollup")]
    pub db_path: String,
    #[arg(long, env = "ROLLUP_LISTEN_ADDR", default_value = "0.0.0.0:3000")]
    pub listen_addr: String,
    /// Only read when the store is empty.
    #[arg(long, env = "ROLLUP_GENESIS_PATH")]
    pub genesis_path: Option<PathBuf>,
    #[arg(long, env = "ROLLUP_BATCH_SIZE", default_value_t = 50)]
    pub batch_size: usize,
    #[arg(long, env = "ROLLUP_BADGE_INTERVAL_MS", default_value_t = 5_000)]
    pub badge_interval_ms: u64,
    #[arg(long, env = "ROLLUP_DRAIN_ORDER", default_value = "oldest_first")]
    pub drain_order: String,
    #[arg(long, env = "BRIDGE_ENABLED", default_value_t = false)]
    pub bridge_enabled: bool,
    #[arg(long, env = "BRIDGE_RPC_URL", default_value = "")]
    pub bridge_rpc_url: String,
    #[arg(long, env = "BRIDGE_CONTRACT", default_value = "")]
    pub bridge_contract: String,
    #[arg(long, env = "BRIDGE_DEPOSIT_TOPIC", default_value = "")]
    pub bridge_deposit_topic: String,
    #[arg(long, env = "BRIDGE_POLL_MS", default_value_t = 5_000)]
    pub bridge_poll_ms: u64,
    #[arg(long, env = "BRIDGE_RPC_TIMEOUT_MS", default_value_t = 2_000)]
    pub bridge_rpc_timeout_ms: u64,
    #[arg(long, env = "BRIDGE_RPC_RETRY_MAX", default_value_t = 3)]
    pub bridge_rpc_retry_max: u32,
}

impl Settings {
    fn sequencer_config(&self) -> SequencerConfig {
        SequencerConfig {
            batch_size: self.batch_size.max(1),
            badge_interval_ms: self.badge_interval_ms.max(1),
            drain_order: DrainOrder::from_env_str(&self.drain_order),
            ..SequencerConfig::default()
        }
    }

    fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            enabled: self.bridge_enabled,
            rpc_url: self.bridge_rpc_url.clone(),
            contract: self.bridge_contract.clone(),
            deposit_topic: self.bridge_deposit_topic.clone(),
            poll_interval_ms: self.bridge_poll_ms.max(1),
            timeout_ms: self.bridge_rpc_timeout_ms.max(1),
            retry_max: self.bridge_rpc_retry_max,
        }
    }
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("storage error: {0}")]
    Storage(#[from] rollup_storage::StorageError),
    #[error("state error: {0}")]
    State(#[from] rollup_state::StateError),
    #[error("sequencer error: {0}")]
    Sequencer(#[from] rollup_sequencer::SequencerError),
    #[error("bridge error: {0}")]
    Bridge(#[from] rollup_bridge::BridgeError),
    #[error("genesis error: {0}")]
    Genesis(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("server error: {0}")]
    Server(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
struct Metrics {
    registry: Registry,
    uptime_ms: IntGauge,
    pending_transactions: IntGauge,
    badges_formed: IntGauge,
    head_blocknumber: IntGauge,
    deposits_ingested: IntGauge,
}

impl Metrics {
    fn new() -> Result<Self, NodeError> {
        let registry = Registry::new();
        let gauge = |name: &str, help: &str| -> Result<IntGauge, NodeError> {
            let gauge = IntGauge::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };
        let uptime_ms = gauge("rollup_uptime_ms", "Uptime of the rollup node in milliseconds")?;
        let pending_transactions = gauge(
            "rollup_pending_transactions",
            "Transactions waiting in the mempool",
        )?;
        let badges_formed = gauge(
            "rollup_badges_formed",
            "Badges formed since the node started",
        )?;
        let head_blocknumber = gauge(
            "rollup_head_blocknumber",
            "Blocknumber of the badge the chain pointer refers to",
        )?;
        let deposits_ingested = gauge(
            "rollup_bridge_deposits",
            "Deposits recorded by the bridge",
        )?;
        Ok(Self {
            registry,
            uptime_ms,
            pending_transactions,
            badges_formed,
            head_blocknumber,
            deposits_ingested,
        })
    }
}

#[derive(Clone)]
struct AppState {
    storage: Arc<Storage>,
    start_instant: Instant,
    sequencer: SequencerHandle,
    bridge: Option<BridgeHandle>,
    metrics: Metrics,
}

#[derive(Serialize)]
struct StatusResponse {
    service: ServiceInfo,
    uptime_ms: u64,
    chain: ChainInfo,
    transactions: TransactionCounts,
    sequencer: SequencerSnapshot,
    bridge: BridgeSnapshot,
}

#[derive(Serialize)]
struct ServiceInfo {
    name: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ChainInfo {
    head_badge_id: Option<String>,
    blocknumber: Option<u64>,
    state_root: String,
    badges: usize,
    accounts: usize,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(error = %err, "node terminated with error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), NodeError> {
    let settings = Settings::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    info!(?settings, "starting rollup-node");
    let addr: SocketAddr = settings
        .listen_addr
        .parse()
        .map_err(|e| NodeError::Config(format!("invalid listen addr: {e}")))?;
    let storage = Arc::new(Storage::open(&settings.db_path)?);
    let engine = genesis::bootstrap(Arc::clone(&storage), settings.genesis_path.as_deref())?;

    let metrics = Metrics::new()?;
    let sequencer = spawn_sequencer(settings.sequencer_config(), Arc::clone(&storage), engine);

    let mut bridge_handle = None;
    if settings.bridge_enabled {
        let config = settings.bridge_config();
        let watcher = EvmLogWatcher::new(config.clone())?;
        let handle = spawn_bridge(config, sequencer.mempool().clone(), Arc::new(watcher));
        bridge_handle = Some(handle);
    }

    let state = AppState {
        storage: Arc::clone(&storage),
        start_instant: Instant::now(),
        sequencer,
        bridge: bridge_handle,
        metrics,
    };

    let app = Router::new()
        .route("/healthz", get(health))
        .route("/readyz", get(ready))
        .route("/status", get(status))
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| NodeError::Server(e.to_string()))?;

    storage.flush()?;
    info!("rollup-node stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn health() -> impl IntoResponse {
    "ok"
}

async fn ready(state: axum::extract::State<AppState>) -> impl IntoResponse {
    let schema = state.storage.get_meta("schema_version");
    let head = state.storage.head_badge();
    match (schema, head) {
        (Ok(Some(_)), Ok(Some(_))) => axum::http::StatusCode::OK,
        _ => axum::http::StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn status(state: axum::extract::State<AppState>) -> impl IntoResponse {
    let uptime_millis = state.start_instant.elapsed().as_millis();
    let uptime_ms = u64::try_from(uptime_millis).unwrap_or(u64::MAX);
    let sequencer = state.sequencer.snapshot().await;
    let bridge = match &state.bridge {
        Some(handle) => handle.snapshot().await,
        None => BridgeSnapshot::default(),
    };
    let head = state.storage.head_badge().unwrap_or_else(|err| {
        warn!(error = %err, "failed to read head badge");
        None
    });
    let transactions = state.storage.count_transactions().unwrap_or_else(|err| {
        warn!(error = %err, "failed to count transactions");
        TransactionCounts::default()
    });

    let response = StatusResponse {
        service: ServiceInfo {
            name: "rollup-node",
            version: env!("CARGO_PKG_VERSION"),
        },
        uptime_ms,
        chain: ChainInfo {
            head_badge_id: head.as_ref().map(|b| b.badge_id.clone()),
            blocknumber: head.as_ref().map(|b| b.blocknumber),
            state_root: state.sequencer.state_root().await.to_hex(),
            badges: state.storage.badge_count(),
            accounts: state.storage.account_count(),
        },
        transactions,
        sequencer,
        bridge,
    };

    Json(response)
}

async fn metrics_handler(state: axum::extract::State<AppState>) -> impl IntoResponse {
    let uptime_millis = state.start_instant.elapsed().as_millis();
    let snapshot = state.sequencer.snapshot().await;
    let head_blocknumber = state
        .storage
        .head_badge()
        .ok()
        .flatten()
        .map(|b| b.blocknumber)
        .unwrap_or(0);

    let metrics = &state.metrics;
    metrics
        .uptime_ms
        .set(i64::try_from(uptime_millis).unwrap_or(i64::MAX));
    metrics
        .pending_transactions
        .set(i64::try_from(snapshot.pending).unwrap_or(i64::MAX));
    metrics
        .badges_formed
        .set(i64::try_from(snapshot.badges_formed).unwrap_or(i64::MAX));
    metrics
        .head_blocknumber
        .set(i64::try_from(head_blocknumber).unwrap_or(i64::MAX));
    metrics
        .deposits_ingested
        .set(i64::try_from(state.storage.count_deposits()).unwrap_or(i64::MAX));

    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();
    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (axum::http::StatusCode::OK, buffer),
        Err(err) => {
            warn!(error = %err, "failed to encode metrics");
            (axum::http::StatusCode::INTERNAL_SERVER_ERROR, Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_map_to_component_configs() {
        let settings = Settings::parse_from([
            "rollup-node",
            "--batch-size",
            "0",
            "--drain-order",
            "newest_first",
            "--bridge-enabled",
            "--bridge-rpc-url",
            "http://localhost:8545",
            "--bridge-rpc-timeout-ms",
            "750",
            "--bridge-rpc-retry-max",
            "5",
        ]);
        let sequencer = settings.sequencer_config();
        assert_eq!(sequencer.batch_size, 1);
        assert_eq!(sequencer.drain_order, DrainOrder::NewestFirst);
        let bridge = settings.bridge_config();
        assert!(bridge.enabled);
        assert_eq!(bridge.rpc_url, "http://localhost:8545");
        assert_eq!(bridge.timeout_ms, 750);
        assert_eq!(bridge.retry_max, 5);
    }

    #[test]
    fn metrics_registry_builds() {
        let metrics = Metrics::new().expect("metrics");
        assert_eq!(metrics.registry.gather().len(), 5);
    }
}

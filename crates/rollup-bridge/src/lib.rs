#![forbid(unsafe_code)]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::float_cmp)]
#![deny(clippy::cast_precision_loss)]
#![deny(clippy::cast_possible_truncation)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::cast_sign_loss)]
#![deny(clippy::disallowed_types)]

//! Layer-1 deposit bridge.
//!
//! A [`DepositWatcher`] reports deposit events observed on the parent chain.
//! The poll loop deduplicates them by `l1_tx_hash:log_index` and forwards
//! fresh ones to the mempool as deposit transactions.

pub mod evm;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rollup_core::{now_ms, Address};
use rollup_sequencer::{Mempool, SequencerError};
use rollup_storage::StorageError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{debug, info, warn};

pub use evm::EvmLogWatcher;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("sequencer error: {0}")]
    Sequencer(#[from] SequencerError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositEvent {
    pub l1_tx_hash: String,
    pub log_index: u64,
    /// Layer-2 account credited by the deposit.
    pub address: Address,
    pub amount: u64,
    pub observed_at_ms: u64,
}

impl DepositEvent {
    pub fn deposit_id(&self) -> String {
        format!("{}:{}", self.l1_tx_hash, self.log_index)
    }
}

/// What the bridge keeps per ingested deposit.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DepositRecord {
    event: DepositEvent,
    transaction_id: String,
    ingested_at_ms: u64,
}

#[async_trait]
pub trait DepositWatcher: Send + Sync {
    async fn poll_deposits(&self) -> Result<Vec<DepositEvent>, BridgeError>;
}

/// Reports a fixed set of events on every poll.
pub struct StaticWatcher {
    events: Vec<DepositEvent>,
}

impl StaticWatcher {
    pub fn new(events: Vec<DepositEvent>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl DepositWatcher for StaticWatcher {
    async fn poll_deposits(&self) -> Result<Vec<DepositEvent>, BridgeError> {
        Ok(self.events.clone())
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub enabled: bool,
    pub rpc_url: String,
    /// Deposit contract address, `0x`-prefixed.
    pub contract: String,
    /// `topics[0]` of the deposit event. Empty means no topic filter.
    pub deposit_topic: String,
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
    pub retry_max: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rpc_url: String::new(),
            contract: String::new(),
            deposit_topic: String::new(),
            poll_interval_ms: 5_000,
            timeout_ms: 2_000,
            retry_max: 3,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BridgeSnapshot {
    pub enabled: bool,
    pub last_event_time_ms: Option<u64>,
    pub deposits_ingested: u64,
    pub duplicates_skipped: u64,
    pub dropped: u64,
    pub poll_errors: u64,
}

#[derive(Clone, Default)]
struct BridgeState {
    last_event_time_ms: Option<u64>,
    deposits_ingested: u64,
    duplicates_skipped: u64,
    dropped: u64,
    poll_errors: u64,
}

impl From<BridgeState> for BridgeSnapshot {
    fn from(state: BridgeState) -> Self {
        Self {
            enabled: true,
            last_event_time_ms: state.last_event_time_ms,
            deposits_ingested: state.deposits_ingested,
            duplicates_skipped: state.duplicates_skipped,
            dropped: state.dropped,
            poll_errors: state.poll_errors,
        }
    }
}

pub struct BridgeHandle {
    state: Arc<Mutex<BridgeState>>,
}

impl Clone for BridgeHandle {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl BridgeHandle {
    pub async fn snapshot(&self) -> BridgeSnapshot {
        self.state.lock().await.clone().into()
    }
}

pub fn spawn(
    config: BridgeConfig,
    mempool: Mempool,
    watcher: Arc<dyn DepositWatcher>,
) -> BridgeHandle {
    let state = Arc::new(Mutex::new(BridgeState::default()));
    let handle = BridgeHandle {
        state: Arc::clone(&state),
    };
    tokio::spawn(run_loop(config, mempool, watcher, state));
    handle
}

async fn run_loop(
    config: BridgeConfig,
    mempool: Mempool,
    watcher: Arc<dyn DepositWatcher>,
    state: Arc<Mutex<BridgeState>>,
) {
    let mut ticker = interval(Duration::from_millis(config.poll_interval_ms.max(1)));
    loop {
        ticker.tick().await;
        match watcher.poll_deposits().await {
            Ok(events) => {
                for event in events {
                    let outcome = process_event(&mempool, &event);
                    let mut guard = state.lock().await;
                    match outcome {
                        Ok(Ingest::Ingested) => {
                            guard.deposits_ingested = guard.deposits_ingested.saturating_add(1);
                            guard.last_event_time_ms = Some(event.observed_at_ms);
                        }
                        Ok(Ingest::Duplicate) => {
                            guard.duplicates_skipped = guard.duplicates_skipped.saturating_add(1);
                        }
                        Ok(Ingest::Dropped) => {
                            guard.dropped = guard.dropped.saturating_add(1);
                        }
                        Err(err) => {
                            warn!(
                                deposit_id = %event.deposit_id(),
                                error = %err,
                                "failed to ingest deposit"
                            );
                        }
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "deposit watcher errored");
                let mut guard = state.lock().await;
                guard.poll_errors = guard.poll_errors.saturating_add(1);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ingest {
    Ingested,
    Duplicate,
    Dropped,
}

/// Forward one event to the mempool unless it was already ingested. The
/// deposit is marked after it is queued, so a crash in between replays it.
fn process_event(mempool: &Mempool, event: &DepositEvent) -> Result<Ingest, BridgeError> {
    let deposit_id = event.deposit_id();
    if event.amount == 0 || event.l1_tx_hash.trim().is_empty() {
        warn!(
            deposit_id = %deposit_id,
            amount = event.amount,
            "dropping malformed deposit event"
        );
        return Ok(Ingest::Dropped);
    }
    let storage = mempool.storage();
    if storage.deposit_exists(&deposit_id)? {
        debug!(deposit_id = %deposit_id, "deposit already ingested");
        return Ok(Ingest::Duplicate);
    }

    // `receivedAt` is the forwarding time so the deposit orders with local
    // submissions; the parent-chain observation time stays in the record.
    let tx = mempool.ingest_deposit(event.address, event.amount, now_ms())?;
    let record = DepositRecord {
        event: event.clone(),
        transaction_id: tx.transaction_id.clone(),
        ingested_at_ms: tx.received_at,
    };
    let data = serde_json::to_vec(&record).map_err(|e| BridgeError::Decode(e.to_string()))?;
    if !storage.put_deposit_if_absent(&deposit_id, &data)? {
        warn!(
            deposit_id = %deposit_id,
            tx_id = %tx.transaction_id,
            "deposit was recorded concurrently"
        );
    }
    info!(
        deposit_id = %deposit_id,
        address = %event.address,
        amount = event.amount,
        tx_id = %tx.transaction_id,
        "ingested deposit"
    );
    Ok(Ingest::Ingested)
}

#![forbid(unsafe_code)]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::float_cmp)]
#![deny(clippy::cast_precision_loss)]
#![deny(clippy::cast_possible_truncation)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::cast_sign_loss)]
#![deny(clippy::disallowed_types)]

//! Sequencer: admission, formation triggers and the badge formation loop.
//!
//! Two producers feed one bounded queue of formation requests: a timer
//! (`TIMEDOUT` every badge interval) and the accepted-submission counter
//! (`FILLEDUP` every `batch_size` submissions). A single consumer task runs
//! one formation cycle at a time.

pub mod mempool;
pub mod pipeline;

use std::sync::Arc;
use std::time::Duration;

use rollup_core::{
    Address, Badge, ExecutionCause, Hash32, SubmissionResult, TransactionRequest,
    TransactionStatus,
};
use rollup_state::{AccountStateEngine, StateError};
use rollup_storage::{Storage, StorageError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{interval_at, Instant};
use tracing::{info, warn};

pub use mempool::{DrainOrder, Mempool};
pub use pipeline::{
    resolve_head, write_genesis, BlockFormationPipeline, CycleOutcome, PipelineState,
};

#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Accepted submissions that trigger a `FILLEDUP` cycle; also the drain cap.
    pub batch_size: usize,
    pub badge_interval_ms: u64,
    pub drain_order: DrainOrder,
    pub queue_capacity: usize,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            badge_interval_ms: 5_000,
            drain_order: DrainOrder::OldestFirst,
            queue_capacity: 64,
        }
    }
}

#[derive(Debug, Error)]
pub enum SequencerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("chain link error: {0}")]
    ChainLink(String),
    #[error("deposit to {0} has zero amount")]
    ZeroDeposit(Address),
    #[error("formation queue closed")]
    QueueClosed,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SequencerSnapshot {
    pub pipeline_state: PipelineState,
    pub pending: usize,
    pub accepted_submissions: u64,
    pub rejected_submissions: u64,
    pub submissions_since_trigger: usize,
    pub badges_formed: u64,
    pub failed_cycles: u64,
    pub last_badge_id: Option<String>,
    pub last_blocknumber: Option<u64>,
    pub last_state_root: Option<String>,
    pub last_badge_time_ms: Option<u64>,
}

#[derive(Clone, Default)]
struct SequencerState {
    accepted_submissions: u64,
    rejected_submissions: u64,
    submissions_since_trigger: usize,
    badges_formed: u64,
    failed_cycles: u64,
    last_badge_id: Option<String>,
    last_blocknumber: Option<u64>,
    last_state_root: Option<Hash32>,
    last_badge_time_ms: Option<u64>,
}

impl SequencerState {
    fn record_badge(&mut self, badge: &Badge) {
        self.badges_formed = self.badges_formed.saturating_add(1);
        self.last_badge_id = Some(badge.badge_id.clone());
        self.last_blocknumber = Some(badge.blocknumber);
        self.last_state_root = Some(badge.state_root);
        self.last_badge_time_ms = Some(badge.timestamp);
    }
}

pub struct SequencerHandle {
    mempool: Mempool,
    batch_size: usize,
    triggers: mpsc::Sender<ExecutionCause>,
    pipeline: Arc<Mutex<BlockFormationPipeline>>,
    pipeline_state: watch::Receiver<PipelineState>,
    state: Arc<Mutex<SequencerState>>,
}

impl Clone for SequencerHandle {
    fn clone(&self) -> Self {
        Self {
            mempool: self.mempool.clone(),
            batch_size: self.batch_size,
            triggers: self.triggers.clone(),
            pipeline: Arc::clone(&self.pipeline),
            pipeline_state: self.pipeline_state.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl SequencerHandle {
    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    /// Admit a transfer; every `batch_size` accepted submissions enqueue a
    /// `FILLEDUP` cycle.
    pub async fn submit(
        &self,
        request: TransactionRequest,
    ) -> Result<SubmissionResult, SequencerError> {
        let result = self.mempool.submit(request)?;
        let fire = {
            let mut guard = self.state.lock().await;
            if result.accepted {
                guard.accepted_submissions = guard.accepted_submissions.saturating_add(1);
                guard.submissions_since_trigger = guard.submissions_since_trigger.saturating_add(1);
                if guard.submissions_since_trigger >= self.batch_size {
                    guard.submissions_since_trigger = 0;
                    true
                } else {
                    false
                }
            } else {
                guard.rejected_submissions = guard.rejected_submissions.saturating_add(1);
                false
            }
        };
        if fire {
            if let Err(err) = self.trigger(ExecutionCause::Filledup).await {
                warn!(error = %err, "failed to enqueue filled-up formation");
            }
        }
        Ok(result)
    }

    /// Enqueue a formation request.
    pub async fn trigger(&self, cause: ExecutionCause) -> Result<(), SequencerError> {
        self.triggers
            .send(cause)
            .await
            .map_err(|_| SequencerError::QueueClosed)
    }

    /// Run a cycle on the caller's task, serialized with the formation loop.
    pub async fn form_badge_now(
        &self,
        cause: ExecutionCause,
    ) -> Result<CycleOutcome, SequencerError> {
        let mut pipeline = self.pipeline.lock().await;
        let result = pipeline.run_cycle(cause);
        drop(pipeline);
        record_cycle(&self.state, &result).await;
        result
    }

    pub fn get_nonce(&self, address: &Address) -> Result<u64, SequencerError> {
        self.mempool.get_nonce(address)
    }

    pub fn get_status(
        &self,
        submission_id: &str,
    ) -> Result<Option<TransactionStatus>, SequencerError> {
        self.mempool.get_status(submission_id)
    }

    pub fn finalize_badge(&self, badge_id: &str, verified: bool) -> Result<Badge, SequencerError> {
        pipeline::finalize_badge(self.mempool.storage(), badge_id, verified)
    }

    pub async fn state_root(&self) -> Hash32 {
        self.pipeline.lock().await.engine().current_root()
    }

    pub async fn snapshot(&self) -> SequencerSnapshot {
        let state = self.state.lock().await.clone();
        SequencerSnapshot {
            pipeline_state: *self.pipeline_state.borrow(),
            pending: self.mempool.pending_count(),
            accepted_submissions: state.accepted_submissions,
            rejected_submissions: state.rejected_submissions,
            submissions_since_trigger: state.submissions_since_trigger,
            badges_formed: state.badges_formed,
            failed_cycles: state.failed_cycles,
            last_badge_id: state.last_badge_id,
            last_blocknumber: state.last_blocknumber,
            last_state_root: state.last_state_root.map(Hash32::to_hex),
            last_badge_time_ms: state.last_badge_time_ms,
        }
    }
}

/// Start the timer producer and the formation consumer.
pub fn spawn(
    config: SequencerConfig,
    storage: Arc<Storage>,
    engine: AccountStateEngine,
) -> SequencerHandle {
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let mempool = Mempool::new(storage, config.drain_order);
    let batch_size = config.batch_size.max(1);
    let pipeline = BlockFormationPipeline::new(mempool.clone(), engine, batch_size);
    let pipeline_state = pipeline.subscribe();
    let pipeline = Arc::new(Mutex::new(pipeline));
    let state = Arc::new(Mutex::new(SequencerState::default()));

    tokio::spawn(run_timer(config.badge_interval_ms, tx.clone()));
    tokio::spawn(run_formation(
        Arc::clone(&pipeline),
        rx,
        Arc::clone(&state),
    ));

    SequencerHandle {
        mempool,
        batch_size,
        triggers: tx,
        pipeline,
        pipeline_state,
        state,
    }
}

async fn run_timer(interval_ms: u64, tx: mpsc::Sender<ExecutionCause>) {
    let period = Duration::from_millis(interval_ms.max(1));
    let mut interval = interval_at(Instant::now() + period, period);
    loop {
        interval.tick().await;
        if tx.send(ExecutionCause::Timedout).await.is_err() {
            info!("formation queue closed, stopping badge timer");
            break;
        }
    }
}

async fn run_formation(
    pipeline: Arc<Mutex<BlockFormationPipeline>>,
    mut rx: mpsc::Receiver<ExecutionCause>,
    state: Arc<Mutex<SequencerState>>,
) {
    while let Some(cause) = rx.recv().await {
        let result = pipeline.lock().await.run_cycle(cause);
        record_cycle(&state, &result).await;
    }
    info!("formation loop stopped");
}

async fn record_cycle(
    state: &Arc<Mutex<SequencerState>>,
    result: &Result<CycleOutcome, SequencerError>,
) {
    let mut guard = state.lock().await;
    match result {
        Ok(outcome) => guard.record_badge(&outcome.badge),
        Err(err) => {
            warn!(error = %err, "badge formation cycle failed");
            guard.failed_cycles = guard.failed_cycles.saturating_add(1);
        }
    }
}

//! Badge formation: drain, apply, hash, persist, link.

use rollup_core::{
    block_hash, new_id, now_ms, rolling_tx_hash, Badge, BadgeStatus, ExecutionCause,
    GenesisAccount, Hash32, Transaction,
};
use rollup_state::{AccountStateEngine, StateError};
use rollup_storage::Storage;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::mempool::Mempool;
use crate::SequencerError;

/// Where the formation task currently is within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    #[default]
    Idle,
    Collecting,
    Applying,
    Hashing,
    Persisting,
    Linked,
}

/// Result of one completed cycle.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub badge: Badge,
    pub pre_root: Hash32,
    pub drained: usize,
    pub failed: Vec<String>,
}

impl CycleOutcome {
    pub fn applied(&self) -> usize {
        self.badge.transactions.len()
    }
}

pub struct BlockFormationPipeline {
    mempool: Mempool,
    engine: AccountStateEngine,
    batch_size: usize,
    /// Newest `receivedAt` taken by a linked badge; a TIMEDOUT cycle only
    /// takes newer arrivals.
    last_cycle_ms: Option<u64>,
    state: watch::Sender<PipelineState>,
}

impl BlockFormationPipeline {
    pub fn new(mempool: Mempool, engine: AccountStateEngine, batch_size: usize) -> Self {
        let (state, _) = watch::channel(PipelineState::Idle);
        Self {
            mempool,
            engine,
            batch_size,
            last_cycle_ms: None,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    pub fn engine(&self) -> &AccountStateEngine {
        &self.engine
    }

    pub fn last_cycle_ms(&self) -> Option<u64> {
        self.last_cycle_ms
    }

    fn set_state(&self, next: PipelineState) {
        self.state.send_replace(next);
    }

    /// Run one formation cycle and return to `Idle`, whatever the outcome.
    pub fn run_cycle(&mut self, cause: ExecutionCause) -> Result<CycleOutcome, SequencerError> {
        let result = self.form_badge(cause);
        self.set_state(PipelineState::Idle);
        result
    }

    fn form_badge(&mut self, cause: ExecutionCause) -> Result<CycleOutcome, SequencerError> {
        let badge_id = new_id();
        let prev = resolve_head(self.mempool.storage())?;

        self.set_state(PipelineState::Collecting);
        let since = match cause {
            ExecutionCause::Filledup => None,
            ExecutionCause::Timedout => self.last_cycle_ms,
        };
        let drained = self.mempool.drain(since, self.batch_size)?;
        info!(
            badge_id = %badge_id,
            cause = cause.as_str(),
            count = drained.len(),
            "collected transactions for badge"
        );

        match self.link_badge(&badge_id, &prev, cause, &drained) {
            Ok(outcome) => {
                self.engine.clear_staged();
                self.advance_watermark(&drained);
                Ok(outcome)
            }
            Err(err) => {
                error!(badge_id = %badge_id, error = %err, "badge formation aborted");
                self.abort(&badge_id, &drained);
                Err(err)
            }
        }
    }

    /// Apply, hash and persist a badge over `drained`. Nothing reaches the
    /// store unless the final commit succeeds.
    fn link_badge(
        &mut self,
        badge_id: &str,
        prev: &Badge,
        cause: ExecutionCause,
        drained: &[Transaction],
    ) -> Result<CycleOutcome, SequencerError> {
        self.set_state(PipelineState::Applying);
        let pre_root = self.engine.current_root();
        let (included, failed) = self.apply_all(drained, badge_id)?;
        let state_root = self.engine.current_root();

        self.set_state(PipelineState::Hashing);
        let rolling = rolling_tx_hash(&included);
        let blocknumber = prev.blocknumber.saturating_add(1);
        let timestamp = now_ms();
        let blockhash = block_hash(blocknumber, timestamp, &prev.blockhash, &rolling);

        let badge = Badge {
            badge_id: badge_id.to_string(),
            status: BadgeStatus::SendToVerify,
            blockhash,
            state_root,
            blocknumber,
            timestamp,
            execution_cause: Some(cause),
            transactions: included.iter().map(|t| t.transaction_id.clone()).collect(),
            prev_badge: prev.badge_id.clone(),
        };

        self.set_state(PipelineState::Persisting);
        self.mempool
            .storage()
            .commit_badge(&badge, &self.engine.staged_accounts(), &failed)?;

        self.set_state(PipelineState::Linked);
        info!(
            badge_id,
            blocknumber,
            blockhash = %blockhash,
            old_state_root = %pre_root,
            new_state_root = %state_root,
            applied = included.len(),
            failed = failed.len(),
            "linked new badge"
        );
        Ok(CycleOutcome {
            badge,
            pre_root,
            drained: drained.len(),
            failed,
        })
    }

    /// Apply each drained transaction in order. Returns the included ones
    /// and the ids of those that could not be applied.
    fn apply_all(
        &mut self,
        drained: &[Transaction],
        badge_id: &str,
    ) -> Result<(Vec<Transaction>, Vec<String>), SequencerError> {
        let mut included = Vec::with_capacity(drained.len());
        let mut failed = Vec::new();
        for tx in drained {
            let outcome = if tx.is_deposit() {
                self.engine.apply_deposit(tx, badge_id)
            } else {
                self.engine.apply_transfer(tx, badge_id)
            };
            match outcome {
                Ok(()) => included.push(tx.clone()),
                Err(err @ (StateError::Invariant(_) | StateError::Overflow)) => {
                    warn!(
                        tx_id = %tx.transaction_id,
                        badge_id,
                        error = %err,
                        "transaction could not be included in the badge"
                    );
                    failed.push(tx.transaction_id.clone());
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok((included, failed))
    }

    /// Undo a cycle that did not link: restore the tree and hand the
    /// drained transactions back to `pending`.
    fn abort(&mut self, badge_id: &str, drained: &[Transaction]) {
        if let Err(err) = self.engine.rollback() {
            error!(badge_id, error = %err, "failed to roll back staged state");
        }
        match self.mempool.release(drained) {
            Ok(released) => warn!(badge_id, released, "released drained transactions"),
            Err(err) => error!(
                badge_id,
                drained = drained.len(),
                error = %err,
                "failed to release drained transactions"
            ),
        }
    }

    /// Move the TIMEDOUT watermark to the newest arrival taken. A drain
    /// that hit the cap may have left older arrivals behind, so it keeps
    /// the watermark where it was.
    fn advance_watermark(&mut self, drained: &[Transaction]) {
        if drained.len() >= self.batch_size {
            return;
        }
        if let Some(newest) = drained.iter().map(|t| t.received_at).max() {
            self.last_cycle_ms = Some(self.last_cycle_ms.map_or(newest, |seen| seen.max(newest)));
        }
    }
}

/// Badge the chain pointer refers to.
pub fn resolve_head(storage: &Storage) -> Result<Badge, SequencerError> {
    let pointer = storage
        .get_chain_pointer()?
        .ok_or_else(|| SequencerError::ChainLink("chain pointer missing".to_string()))?;
    storage.get_badge(&pointer.curr_badge_id)?.ok_or_else(|| {
        SequencerError::ChainLink(format!(
            "chain pointer refers to unknown badge {}",
            pointer.curr_badge_id
        ))
    })
}

/// Initialize an empty store: genesis accounts, genesis badge and chain
/// pointer.
pub fn write_genesis(
    engine: &mut AccountStateEngine,
    accounts: &[GenesisAccount],
) -> Result<Badge, SequencerError> {
    let root = engine.initialize_from_genesis(accounts)?;
    let badge = Badge::genesis(new_id(), root, now_ms());
    engine.storage().commit_badge(&badge, &[], &[])?;
    info!(
        badge_id = %badge.badge_id,
        state_root = %root,
        accounts = accounts.len(),
        "wrote genesis badge"
    );
    Ok(badge)
}

/// Record an external verifier's verdict on a badge.
pub fn finalize_badge(
    storage: &Storage,
    badge_id: &str,
    verified: bool,
) -> Result<Badge, SequencerError> {
    let badge = storage.finalize_badge(badge_id, verified)?;
    info!(
        badge_id,
        verified,
        transactions = badge.transactions.len(),
        "finalized badge"
    );
    Ok(badge)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempool::DrainOrder;
    use ed25519_dalek::SigningKey;
    use rollup_core::{sign_transfer, AccountState, Address, ChainPointer, TransactionStatus};
    use rollup_storage::StorageError;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn address(seed: u8) -> Address {
        Address(key(seed).verifying_key().to_bytes())
    }

    fn setup(balances: &[(u8, u64)]) -> (tempfile::TempDir, BlockFormationPipeline) {
        let dir = tempdir().expect("tmpdir");
        let storage = Arc::new(Storage::open(dir.path()).expect("open"));
        let mut engine = AccountStateEngine::new(Arc::clone(&storage));
        let root = engine
            .initialize_from_genesis(&genesis_accounts(balances))
            .expect("genesis");
        storage
            .commit_badge(&Badge::genesis("genesis".to_string(), root, 0), &[], &[])
            .expect("genesis badge");
        let mempool = Mempool::new(storage, DrainOrder::OldestFirst);
        (dir, BlockFormationPipeline::new(mempool, engine, 50))
    }

    fn genesis_accounts(balances: &[(u8, u64)]) -> Vec<GenesisAccount> {
        balances
            .iter()
            .map(|(seed, balance)| GenesisAccount {
                address: address(*seed),
                balance: *balance,
                nonce: 0,
            })
            .collect()
    }

    /// Overwrite an account record with bytes that do not decode.
    fn corrupt_account(path: &Path, target: Address) {
        let db = sled::open(path).expect("raw open");
        let accounts = db.open_tree("accounts").expect("accounts tree");
        accounts
            .insert(&target.as_bytes()[..], b"not json".to_vec())
            .expect("insert");
        db.flush().expect("flush");
    }

    #[test]
    fn failed_transfer_is_excluded_and_marked() {
        let (_dir, mut pipeline) = setup(&[(1, 1000), (2, 1000)]);
        let good = sign_transfer(&key(1), address(2), 1, 0).expect("sign");
        let stale = sign_transfer(&key(2), address(1), 1, 5).expect("sign");
        pipeline.mempool.submit_at(good, 1).expect("submit");
        let bad = pipeline.mempool.submit_at(stale, 2).expect("submit");

        let outcome = pipeline.run_cycle(ExecutionCause::Filledup).expect("cycle");
        assert_eq!(outcome.drained, 2);
        assert_eq!(outcome.applied(), 1);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(
            pipeline.mempool.get_status(&bad.submission_id).unwrap(),
            Some(TransactionStatus::Failed)
        );
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    #[test]
    fn empty_badge_keeps_root_and_seed_rolling_hash() {
        let (_dir, mut pipeline) = setup(&[(1, 1000)]);
        let before = pipeline.engine().current_root();
        let outcome = pipeline.run_cycle(ExecutionCause::Timedout).expect("cycle");
        assert_eq!(outcome.badge.state_root, before);
        assert_eq!(outcome.pre_root, before);
        assert!(outcome.badge.transactions.is_empty());
        let expected = block_hash(
            1,
            outcome.badge.timestamp,
            &Hash32::ZERO,
            &rollup_core::ROLLING_SEED,
        );
        assert_eq!(outcome.badge.blockhash, expected);
        assert_eq!(outcome.badge.execution_cause, Some(ExecutionCause::Timedout));
    }

    #[test]
    fn missing_chain_pointer_aborts_before_draining() {
        let dir = tempdir().expect("tmpdir");
        let storage = Arc::new(Storage::open(dir.path()).expect("open"));
        let engine = AccountStateEngine::new(Arc::clone(&storage));
        let mempool = Mempool::new(Arc::clone(&storage), DrainOrder::OldestFirst);
        mempool.ingest_deposit(address(1), 10, 1).expect("deposit");
        let mut pipeline = BlockFormationPipeline::new(mempool, engine, 50);

        let err = pipeline.run_cycle(ExecutionCause::Filledup).unwrap_err();
        assert!(matches!(err, SequencerError::ChainLink(_)));
        assert_eq!(storage.pending_count(), 1);
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    #[test]
    fn finalize_marks_badge_and_transactions() {
        let (_dir, mut pipeline) = setup(&[(1, 1000), (2, 0)]);
        let req = sign_transfer(&key(1), address(2), 5, 0).expect("sign");
        let sub = pipeline.mempool.submit_at(req, 1).expect("submit");
        let outcome = pipeline.run_cycle(ExecutionCause::Filledup).expect("cycle");

        let storage = Arc::clone(pipeline.mempool.storage());
        let badge = finalize_badge(&storage, &outcome.badge.badge_id, false).expect("finalize");
        assert_eq!(badge.status, BadgeStatus::Failed);
        assert_eq!(
            pipeline.mempool.get_status(&sub.submission_id).unwrap(),
            Some(TransactionStatus::Failed)
        );
    }

    #[test]
    fn storage_fault_mid_cycle_rolls_back_and_releases() {
        let dir = tempdir().expect("tmpdir");
        let path = dir.path().join("db");
        let (first, second) = {
            let storage = Arc::new(Storage::open(&path).expect("open"));
            let mut engine = AccountStateEngine::new(Arc::clone(&storage));
            write_genesis(
                &mut engine,
                &genesis_accounts(&[(1, 1000), (2, 1000), (3, 1000), (4, 0)]),
            )
            .expect("genesis");
            let mempool = Mempool::new(Arc::clone(&storage), DrainOrder::OldestFirst);
            let a_to_b = sign_transfer(&key(1), address(2), 1, 0).expect("sign");
            let c_to_d = sign_transfer(&key(3), address(4), 1, 0).expect("sign");
            let first = mempool.submit_at(a_to_b, 1).expect("submit");
            let second = mempool.submit_at(c_to_d, 2).expect("submit");
            storage.flush().expect("flush");
            (first, second)
        };
        corrupt_account(&path, address(4));

        let storage = Arc::new(Storage::open(&path).expect("reopen"));
        let engine = AccountStateEngine::new(Arc::clone(&storage));
        let before = engine.current_root();
        let mempool = Mempool::new(Arc::clone(&storage), DrainOrder::OldestFirst);
        let mut pipeline = BlockFormationPipeline::new(mempool, engine, 50);

        let err = pipeline.run_cycle(ExecutionCause::Filledup).unwrap_err();
        assert!(matches!(
            err,
            SequencerError::State(StateError::Storage(StorageError::Json(_)))
        ));
        assert_eq!(pipeline.engine().current_root(), before);
        assert!(pipeline.engine().staged_accounts().is_empty());
        assert_eq!(
            storage.get_account(&address(1)).unwrap().expect("a").latest(),
            AccountState::new(1000, 0)
        );
        assert_eq!(storage.pending_count(), 2);
        for sub in [&first, &second] {
            assert_eq!(
                pipeline.mempool.get_status(&sub.submission_id).unwrap(),
                Some(TransactionStatus::Pending)
            );
        }
        assert_eq!(resolve_head(&storage).expect("head").blocknumber, 0);
        assert_eq!(pipeline.last_cycle_ms(), None);
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    #[test]
    fn rejected_commit_rolls_back_applied_transfers() {
        let (_dir, mut pipeline) = setup(&[(1, 1000), (2, 1000)]);
        let storage = Arc::clone(pipeline.mempool.storage());
        let before = pipeline.engine().current_root();

        // Take blocknumber 1 out from under the next cycle, then point the
        // chain back at genesis.
        let mut squatter = Badge::genesis("squatter".to_string(), Hash32::ZERO, 0);
        squatter.blocknumber = 1;
        storage.commit_badge(&squatter, &[], &[]).expect("commit");
        let pointer = ChainPointer {
            curr_badge_id: "genesis".to_string(),
        };
        storage
            .set_meta("chain_pointer", &serde_json::to_vec(&pointer).expect("encode"))
            .expect("set");

        let req = sign_transfer(&key(1), address(2), 10, 0).expect("sign");
        let sub = pipeline.mempool.submit_at(req, 1).expect("submit");
        let err = pipeline.run_cycle(ExecutionCause::Filledup).unwrap_err();
        assert!(matches!(err, SequencerError::Storage(StorageError::Corrupt(_))));

        assert_eq!(pipeline.engine().current_root(), before);
        assert_eq!(
            pipeline.engine().latest_state(&address(1)).unwrap(),
            Some(AccountState::new(1000, 0))
        );
        assert_eq!(
            storage.get_account(&address(1)).unwrap().expect("a").latest(),
            AccountState::new(1000, 0)
        );
        assert_eq!(
            pipeline.mempool.get_status(&sub.submission_id).unwrap(),
            Some(TransactionStatus::Pending)
        );
        assert_eq!(storage.pending_count(), 1);
        assert_eq!(pipeline.last_cycle_ms(), None);
    }

    #[test]
    fn timedout_cycles_work_through_a_backlog_larger_than_the_cap() {
        let (_dir, mut pipeline) = setup(&[(1, 1000)]);
        for received_at in 1..=60u64 {
            pipeline
                .mempool
                .ingest_deposit(address(3), 1, received_at)
                .expect("deposit");
        }

        let first = pipeline.run_cycle(ExecutionCause::Timedout).expect("cycle");
        assert_eq!(first.applied(), 50);
        assert_eq!(pipeline.last_cycle_ms(), None);

        let second = pipeline.run_cycle(ExecutionCause::Timedout).expect("cycle");
        assert_eq!(second.applied(), 10);
        assert_eq!(pipeline.last_cycle_ms(), Some(60));
        assert_eq!(pipeline.mempool.pending_count(), 0);
        assert_eq!(
            pipeline.engine().latest_state(&address(3)).unwrap(),
            Some(AccountState::new(60, 0))
        );

        let idle = pipeline.run_cycle(ExecutionCause::Timedout).expect("cycle");
        assert_eq!(idle.drained, 0);
        assert_eq!(pipeline.last_cycle_ms(), Some(60));
    }
}

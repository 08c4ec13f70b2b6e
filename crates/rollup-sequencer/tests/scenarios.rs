use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use rollup_core::{
    sign_transfer, AccountState, Address, Badge, ExecutionCause, GenesisAccount,
    TransactionStatus, GENESIS_PREV_BADGE,
};
use rollup_sequencer::{spawn, write_genesis, DrainOrder, Mempool, SequencerConfig, SequencerHandle};
use rollup_state::AccountStateEngine;
use rollup_storage::Storage;
use tempfile::{tempdir, TempDir};

fn key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

fn address(seed: u8) -> Address {
    Address(key(seed).verifying_key().to_bytes())
}

struct Node {
    _dir: TempDir,
    storage: Arc<Storage>,
    genesis: Badge,
    handle: SequencerHandle,
}

fn start(balances: &[(u8, u64)], batch_size: usize) -> Node {
    // Keep the timer out of the way; tests trigger cycles explicitly.
    start_with_interval(balances, batch_size, 3_600_000)
}

fn start_with_interval(balances: &[(u8, u64)], batch_size: usize, badge_interval_ms: u64) -> Node {
    let dir = tempdir().expect("tmpdir");
    let storage = Arc::new(Storage::open(dir.path()).expect("open"));
    let mut engine = AccountStateEngine::new(Arc::clone(&storage));
    let accounts: Vec<_> = balances
        .iter()
        .map(|(seed, balance)| GenesisAccount {
            address: address(*seed),
            balance: *balance,
            nonce: 0,
        })
        .collect();
    let genesis = write_genesis(&mut engine, &accounts).expect("genesis");
    let config = SequencerConfig {
        batch_size,
        badge_interval_ms,
        drain_order: DrainOrder::OldestFirst,
        queue_capacity: 16,
    };
    let handle = spawn(config, Arc::clone(&storage), engine);
    Node {
        _dir: dir,
        storage,
        genesis,
        handle,
    }
}

fn state_of(storage: &Storage, seed: u8) -> AccountState {
    storage
        .get_account(&address(seed))
        .expect("get")
        .expect("account")
        .latest()
}

#[tokio::test]
async fn transfer_between_genesis_accounts() {
    let node = start(&[(1, 1000), (2, 1000)], 50);
    let root_before = node.handle.state_root().await;

    let req = sign_transfer(&key(1), address(2), 1, 0).expect("sign");
    let sub = node.handle.submit(req).await.expect("submit");
    assert!(sub.accepted);

    let outcome = node
        .handle
        .form_badge_now(ExecutionCause::Filledup)
        .await
        .expect("cycle");

    assert_eq!(state_of(&node.storage, 1), AccountState::new(999, 1));
    assert_eq!(state_of(&node.storage, 2), AccountState::new(1001, 0));
    assert_eq!(outcome.badge.blocknumber, 1);
    assert_eq!(outcome.badge.prev_badge, node.genesis.badge_id);
    assert_ne!(outcome.badge.state_root, root_before);
    assert_eq!(outcome.badge.transactions.len(), 1);

    let tx = node
        .storage
        .get_transaction(&outcome.badge.transactions[0])
        .expect("get")
        .expect("tx");
    assert_eq!(tx.status, TransactionStatus::Included);
    assert_eq!(tx.badge_id.as_deref(), Some(outcome.badge.badge_id.as_str()));
    assert_eq!(node.handle.get_nonce(&address(1)).expect("nonce"), 1);
    assert_eq!(
        node.storage.get_chain_pointer().expect("ptr").expect("ptr").curr_badge_id,
        outcome.badge.badge_id
    );
}

#[tokio::test]
async fn nonce_mismatch_fails_without_touching_state() {
    let node = start(&[(1, 1000), (2, 1000)], 50);
    let root_before = node.handle.state_root().await;

    let req = sign_transfer(&key(1), address(2), 1, 5).expect("sign");
    let sub = node.handle.submit(req).await.expect("submit");
    assert!(sub.accepted);

    let outcome = node
        .handle
        .form_badge_now(ExecutionCause::Filledup)
        .await
        .expect("cycle");

    assert_eq!(
        node.handle.get_status(&sub.submission_id).expect("status"),
        Some(TransactionStatus::Failed)
    );
    assert!(outcome.badge.transactions.is_empty());
    assert_eq!(outcome.badge.state_root, root_before);
    assert_eq!(state_of(&node.storage, 1), AccountState::new(1000, 0));
    assert_eq!(state_of(&node.storage, 2), AccountState::new(1000, 0));
}

#[tokio::test]
async fn deposit_funds_a_new_account() {
    let node = start(&[(1, 1000)], 50);
    node.handle
        .mempool()
        .ingest_deposit(address(3), 500, rollup_core::now_ms())
        .expect("deposit");
    let first = node
        .handle
        .form_badge_now(ExecutionCause::Filledup)
        .await
        .expect("cycle");
    assert_eq!(first.applied(), 1);
    assert_eq!(state_of(&node.storage, 3), AccountState::new(500, 0));

    let req = sign_transfer(&key(3), address(1), 200, 0).expect("sign");
    let sub = node.handle.submit(req).await.expect("submit");
    let second = node
        .handle
        .form_badge_now(ExecutionCause::Filledup)
        .await
        .expect("cycle");
    assert_eq!(second.applied(), 1);
    assert_eq!(
        node.handle.get_status(&sub.submission_id).expect("status"),
        Some(TransactionStatus::Included)
    );
    assert_eq!(state_of(&node.storage, 3), AccountState::new(300, 1));
    assert_eq!(state_of(&node.storage, 1), AccountState::new(1200, 0));
}

#[test]
fn concurrent_drains_never_overlap() {
    let dir = tempdir().expect("tmpdir");
    let storage = Arc::new(Storage::open(dir.path()).expect("open"));
    let mempool = Mempool::new(Arc::clone(&storage), DrainOrder::OldestFirst);
    for i in 0..200u64 {
        mempool
            .ingest_deposit(Address([7; 32]), 1, i)
            .expect("deposit");
    }

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let pool = mempool.clone();
            std::thread::spawn(move || {
                let mut ids = Vec::new();
                loop {
                    let batch = pool.drain(None, 7).expect("drain");
                    if batch.is_empty() {
                        break;
                    }
                    ids.extend(batch.into_iter().map(|t| t.transaction_id));
                }
                ids
            })
        })
        .collect();

    let mut all = Vec::new();
    for worker in workers {
        all.extend(worker.join().expect("join"));
    }
    let unique: BTreeSet<_> = all.iter().cloned().collect();
    assert_eq!(all.len(), 200);
    assert_eq!(unique.len(), 200);
    assert_eq!(storage.pending_count(), 0);
}

#[tokio::test]
async fn invalid_signature_is_stored_and_never_badged() {
    let node = start(&[(1, 1000), (2, 1000)], 50);
    let mut req = sign_transfer(&key(1), address(2), 1, 0).expect("sign");
    req.amount = 900;
    let sub = node.handle.submit(req).await.expect("submit");
    assert!(!sub.accepted);

    let outcome = node
        .handle
        .form_badge_now(ExecutionCause::Filledup)
        .await
        .expect("cycle");
    assert!(outcome.badge.transactions.is_empty());
    assert_eq!(outcome.drained, 0);
    assert_eq!(
        node.handle.get_status(&sub.submission_id).expect("status"),
        Some(TransactionStatus::Invalid)
    );
    let snapshot = node.handle.snapshot().await;
    assert_eq!(snapshot.rejected_submissions, 1);
    assert_eq!(snapshot.accepted_submissions, 0);
}

#[tokio::test]
async fn chain_links_back_to_genesis() {
    let node = start(&[(1, 1000), (2, 1000)], 50);
    for nonce in 0..3u64 {
        let req = sign_transfer(&key(1), address(2), 10, nonce).expect("sign");
        node.handle.submit(req).await.expect("submit");
        node.handle
            .form_badge_now(ExecutionCause::Filledup)
            .await
            .expect("cycle");
    }
    node.handle
        .form_badge_now(ExecutionCause::Timedout)
        .await
        .expect("empty cycle");

    let mut badge = node.storage.head_badge().expect("head").expect("badge");
    assert_eq!(badge.blocknumber, 4);
    while badge.prev_badge != GENESIS_PREV_BADGE {
        let prev = node
            .storage
            .get_badge(&badge.prev_badge)
            .expect("get")
            .expect("prev");
        assert_eq!(prev.blocknumber + 1, badge.blocknumber);
        badge = prev;
    }
    assert_eq!(badge.badge_id, node.genesis.badge_id);
    assert_eq!(badge.blocknumber, 0);
}

#[tokio::test]
async fn filled_batch_triggers_formation() {
    let node = start(&[(1, 1000), (2, 1000)], 2);
    for nonce in 0..2u64 {
        let req = sign_transfer(&key(1), address(2), 1, nonce).expect("sign");
        node.handle.submit(req).await.expect("submit");
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let snapshot = node.handle.snapshot().await;
    assert_eq!(snapshot.badges_formed, 1);
    assert_eq!(snapshot.submissions_since_trigger, 0);
    assert_eq!(snapshot.last_blocknumber, Some(1));
    assert_eq!(state_of(&node.storage, 1), AccountState::new(998, 2));
}

#[tokio::test]
async fn timeout_cycle_only_takes_newer_arrivals() {
    let node = start(&[(1, 1000), (2, 1000)], 50);
    let mempool = node.handle.mempool().clone();

    let first = sign_transfer(&key(1), address(2), 1, 0).expect("sign");
    mempool.submit_at(first, 3).expect("submit");
    // First cycle has no watermark and takes everything.
    let outcome = node
        .handle
        .form_badge_now(ExecutionCause::Timedout)
        .await
        .expect("cycle");
    assert_eq!(outcome.applied(), 1);

    // Received before the newest arrival already badged: skipped by
    // TIMEDOUT, taken by FILLEDUP.
    let late = sign_transfer(&key(1), address(2), 1, 1).expect("sign");
    mempool.submit_at(late, 2).expect("submit");
    let skipped = node
        .handle
        .form_badge_now(ExecutionCause::Timedout)
        .await
        .expect("cycle");
    assert_eq!(skipped.drained, 0);
    let taken = node
        .handle
        .form_badge_now(ExecutionCause::Filledup)
        .await
        .expect("cycle");
    assert_eq!(taken.applied(), 1);
}

#[tokio::test]
async fn timer_forms_empty_timedout_badges() {
    let node = start_with_interval(&[(1, 1000)], 50, 50);
    let root = node.handle.state_root().await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    let snapshot = node.handle.snapshot().await;
    assert!(snapshot.badges_formed >= 1);
    assert_eq!(snapshot.failed_cycles, 0);
    assert_eq!(snapshot.accepted_submissions, 0);

    let head = node.storage.head_badge().expect("head").expect("badge");
    assert!(head.blocknumber >= 1);
    assert_eq!(head.execution_cause, Some(ExecutionCause::Timedout));
    assert!(head.transactions.is_empty());
    assert_eq!(head.state_root, root);
}

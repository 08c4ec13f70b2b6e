#![forbid(unsafe_code)]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::float_cmp)]
#![deny(clippy::cast_precision_loss)]
#![deny(clippy::cast_possible_truncation)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::cast_sign_loss)]
#![deny(clippy::disallowed_types)]

//! Account state engine.
//!
//! Applies transfers and deposits to account records and keeps the sparse
//! Merkle tree of account leaves in step with them. Changes made within a
//! badge are staged in memory: the badge commit writes the staged records,
//! and an aborted badge rolls the tree and the staging area back.

pub mod ledger;

use std::collections::BTreeMap;
use std::sync::Arc;

use rollup_core::{
    leaf_hash, tree_key, Account, AccountState, Address, CoreError, GenesisAccount, Hash32,
    MemorySmt, SparseMerkle, Transaction,
};
use rollup_storage::{Storage, StorageError};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use ledger::Counterparty;

/// A transaction that is well-formed but not applicable to current state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("unknown sender")]
    UnknownSender,
    #[error("unknown receiver")]
    UnknownReceiver,
    #[error("insufficient balance: have {balance}, need {amount}")]
    InsufficientBalance { balance: u64, amount: u64 },
    #[error("nonce mismatch: expected {expected}, got {got}")]
    NonceMismatch { expected: u64, got: u64 },
    #[error("receiver balance overflow")]
    BalanceOverflow,
    #[error("sender nonce overflow")]
    NonceOverflow,
    #[error("not a transfer")]
    NotATransfer,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),
    #[error("arithmetic overflow")]
    Overflow,
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("tree error: {0}")]
    Tree(#[from] CoreError),
    #[error("account store already initialized")]
    AlreadyInitialized,
    #[error("duplicate genesis account {0}")]
    DuplicateGenesisAccount(Address),
}

pub struct AccountStateEngine {
    storage: Arc<Storage>,
    tree: MemorySmt,
    /// Records changed since the last commit or rollback.
    staged: BTreeMap<Address, Account>,
    /// Leaf of each staged address before its first change.
    undo: BTreeMap<Address, Option<[u8; 32]>>,
}

impl AccountStateEngine {
    /// Engine over an empty tree. Use [`AccountStateEngine::restore`] for a
    /// store that already holds accounts.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            tree: MemorySmt::new(),
            staged: BTreeMap::new(),
            undo: BTreeMap::new(),
        }
    }

    /// Rebuild the tree from every persisted account.
    pub fn restore(storage: Arc<Storage>) -> Result<Self, StateError> {
        let mut engine = Self::new(storage);
        let accounts = engine.storage.list_accounts()?;
        let mut leaves = 0usize;
        for account in accounts.iter().filter(|a| ledger::has_leaf(a)) {
            engine.set_leaf(&account.address, account.latest())?;
            leaves = leaves.saturating_add(1);
        }
        info!(
            accounts = accounts.len(),
            leaves,
            root = %engine.current_root(),
            "restored account state"
        );
        Ok(engine)
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn current_root(&self) -> Hash32 {
        self.tree.root()
    }

    /// Load the genesis account set into an empty store and return the
    /// resulting root.
    pub fn initialize_from_genesis(
        &mut self,
        accounts: &[GenesisAccount],
    ) -> Result<Hash32, StateError> {
        if self.storage.account_count() > 0 {
            return Err(StateError::AlreadyInitialized);
        }
        let mut records: Vec<Account> = Vec::with_capacity(accounts.len());
        for entry in accounts {
            if records.iter().any(|r| r.address == entry.address) {
                return Err(StateError::DuplicateGenesisAccount(entry.address));
            }
            records.push(Account::new(entry.address, entry.balance, entry.nonce));
        }
        self.storage.put_accounts(&records)?;
        for account in records.iter().filter(|a| ledger::has_leaf(a)) {
            self.set_leaf(&account.address, account.latest())?;
        }
        let root = self.current_root();
        info!(accounts = records.len(), root = %root, "initialized genesis state");
        Ok(root)
    }

    /// Current record for `address`, staged changes included.
    pub fn account(&self, address: &Address) -> Result<Option<Account>, StateError> {
        if let Some(account) = self.staged.get(address) {
            return Ok(Some(account.clone()));
        }
        Ok(self.storage.get_account(address)?)
    }

    pub fn latest_state(&self, address: &Address) -> Result<Option<AccountState>, StateError> {
        Ok(self.account(address)?.map(|a| a.latest()))
    }

    /// Apply a signed transfer within `badge_id`. On any error nothing is
    /// staged.
    pub fn apply_transfer(&mut self, tx: &Transaction, badge_id: &str) -> Result<(), StateError> {
        let (Some(receiver), Some(nonce)) = (tx.receiver, tx.nonce) else {
            return Err(InvariantViolation::NotATransfer.into());
        };
        let sender = self
            .account(&tx.sender)?
            .ok_or(InvariantViolation::UnknownSender)?;
        let counterparty = if receiver == tx.sender {
            Counterparty::SameAccount
        } else {
            match self.account(&receiver)? {
                Some(account) => Counterparty::Existing(account),
                None => Counterparty::Missing,
            }
        };
        let updated = ledger::transfer(
            sender,
            counterparty,
            tx.amount,
            nonce,
            &tx.transaction_id,
            badge_id,
        )?;
        self.stage(updated)?;
        debug!(
            tx_id = %tx.transaction_id,
            badge_id,
            amount = tx.amount,
            "applied transfer"
        );
        Ok(())
    }

    /// Credit a deposit within `badge_id`, creating the account if needed.
    pub fn apply_deposit(&mut self, tx: &Transaction, badge_id: &str) -> Result<(), StateError> {
        let target = self.account(&tx.sender)?;
        let updated = ledger::deposit(target, tx.sender, tx.amount, &tx.transaction_id, badge_id)
            .ok_or(StateError::Overflow)?;
        self.stage(vec![updated])?;
        debug!(
            tx_id = %tx.transaction_id,
            badge_id,
            amount = tx.amount,
            "applied deposit"
        );
        Ok(())
    }

    /// Records changed since the last commit or rollback.
    pub fn staged_accounts(&self) -> Vec<Account> {
        self.staged.values().cloned().collect()
    }

    /// Write the staged records on their own and clear the staging area.
    pub fn persist_staged(&mut self) -> Result<(), StateError> {
        self.storage.put_accounts(&self.staged_accounts())?;
        self.clear_staged();
        Ok(())
    }

    /// Forget staged records once they were written by a badge commit.
    pub fn clear_staged(&mut self) {
        self.staged.clear();
        self.undo.clear();
    }

    /// Put every staged leaf back to its value before staging and drop the
    /// staged records.
    pub fn rollback(&mut self) -> Result<(), StateError> {
        let undo = std::mem::take(&mut self.undo);
        let touched = undo.len();
        self.staged.clear();
        for (address, leaf) in undo {
            self.tree
                .update(&tree_key(&address), leaf.unwrap_or([0u8; 32]))?;
        }
        if touched > 0 {
            warn!(accounts = touched, root = %self.current_root(), "rolled back staged state");
        }
        Ok(())
    }

    fn stage(&mut self, accounts: Vec<Account>) -> Result<(), StateError> {
        for account in accounts {
            if !self.undo.contains_key(&account.address) {
                let previous = self.tree.get(&tree_key(&account.address))?;
                self.undo.insert(account.address, previous);
            }
            self.set_leaf(&account.address, account.latest())?;
            self.staged.insert(account.address, account);
        }
        Ok(())
    }

    fn set_leaf(&mut self, address: &Address, state: AccountState) -> Result<(), StateError> {
        self.tree
            .update(&tree_key(address), leaf_hash(address, state))?;
        Ok(())
    }
}

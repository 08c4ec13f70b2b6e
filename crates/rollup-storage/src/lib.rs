#![forbid(unsafe_code)]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::float_cmp)]
#![deny(clippy::cast_precision_loss)]
#![deny(clippy::cast_possible_truncation)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::cast_sign_loss)]
#![deny(clippy::disallowed_types)]

//! sled-backed persistence for the rollup.
//!
//! Records are stored as JSON documents so their field names stay readable
//! by external verifiers. Multi-record changes (claiming pending
//! transactions, committing a badge, finalizing a badge) run inside sled
//! transactions.

use std::path::Path;

use rollup_core::{
    Account, Address, Badge, BadgeStatus, ChainPointer, Transaction, TransactionStatus,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use sled::{IVec, Transactional, Tree};
use thiserror::Error;
use tracing::{info, warn};

pub const SCHEMA_VERSION: &str = "1";
const META_SCHEMA_KEY: &[u8] = b"schema_version";
const META_CHAIN_POINTER_KEY: &[u8] = b"chain_pointer";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),
    #[error("json encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("schema mismatch: expected {expected}, found {found:?}")]
    SchemaMismatch {
        expected: String,
        found: Option<String>,
    },
    #[error("corrupt store: {0}")]
    Corrupt(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl From<TransactionError<StorageError>> for StorageError {
    fn from(err: TransactionError<StorageError>) -> Self {
        match err {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => StorageError::Sled(e),
        }
    }
}

/// Transaction counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransactionCounts {
    pub pending: u64,
    pub included: u64,
    pub verified: u64,
    pub failed: u64,
    pub invalid: u64,
}

impl TransactionCounts {
    pub fn total(&self) -> u64 {
        self.pending
            .saturating_add(self.included)
            .saturating_add(self.verified)
            .saturating_add(self.failed)
            .saturating_add(self.invalid)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    Ok(serde_json::from_slice(bytes)?)
}

fn abort(err: StorageError) -> ConflictableTransactionError<StorageError> {
    ConflictableTransactionError::Abort(err)
}

fn tx_decode<T: DeserializeOwned>(
    bytes: &[u8],
) -> Result<T, ConflictableTransactionError<StorageError>> {
    decode(bytes).map_err(abort)
}

fn tx_encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ConflictableTransactionError<StorageError>> {
    encode(value).map_err(abort)
}

/// Key of the pending index: `receivedAt` (big-endian, so byte order is
/// arrival order) followed by the transaction id.
fn pending_key(received_at: u64, transaction_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + transaction_id.len());
    key.extend_from_slice(&received_at.to_be_bytes());
    key.extend_from_slice(transaction_id.as_bytes());
    key
}

/// Load a transaction inside a sled transaction, aborting if it is missing.
fn tx_load_transaction(
    txs: &TransactionalTree,
    transaction_id: &str,
) -> Result<Transaction, ConflictableTransactionError<StorageError>> {
    match txs.get(transaction_id.as_bytes())? {
        Some(raw) => tx_decode(&raw),
        None => Err(abort(StorageError::NotFound(format!(
            "transaction {transaction_id}"
        )))),
    }
}

pub struct Storage {
    db: sled::Db,
    accounts: Tree,
    transactions: Tree,
    /// submissionId -> transactionId.
    submissions: Tree,
    /// pending_key -> transactionId, only for `pending` transactions.
    pending: Tree,
    badges: Tree,
    /// blocknumber (big-endian) -> badgeId.
    badge_numbers: Tree,
    meta: Tree,
    /// `l1_tx_hash:log_index` -> raw deposit event.
    bridge_deposits: Tree,
}

impl Storage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let accounts = db.open_tree("accounts")?;
        let transactions = db.open_tree("transactions")?;
        let submissions = db.open_tree("submissions")?;
        let pending = db.open_tree("pending")?;
        let badges = db.open_tree("badges")?;
        let badge_numbers = db.open_tree("badge_numbers")?;
        let meta = db.open_tree("meta")?;
        let bridge_deposits = db.open_tree("bridge_deposits")?;
        let storage = Self {
            db,
            accounts,
            transactions,
            submissions,
            pending,
            badges,
            badge_numbers,
            meta,
            bridge_deposits,
        };
        storage.init_schema()?;
        Ok(storage)
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn set_meta(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.meta.insert(key.as_bytes(), value)?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.meta.get(key.as_bytes())?.map(|ivec| ivec.to_vec()))
    }

    // ========== Accounts ==========

    pub fn get_account(&self, address: &Address) -> Result<Option<Account>, StorageError> {
        self.accounts
            .get(address.as_bytes())
            .map(|opt| opt.map(|ivec| decode(&ivec)))?
            .transpose()
    }

    pub fn put_account(&self, account: &Account) -> Result<(), StorageError> {
        let bytes = encode(account)?;
        self.accounts.insert(account.address.as_bytes(), bytes)?;
        Ok(())
    }

    /// Write several account records atomically.
    pub fn put_accounts(&self, accounts: &[Account]) -> Result<(), StorageError> {
        let encoded = accounts
            .iter()
            .map(|a| encode(a).map(|bytes| (a.address, bytes)))
            .collect::<Result<Vec<_>, _>>()?;
        self.accounts
            .transaction(|tree| -> ConflictableTransactionResult<(), StorageError> {
                for (address, bytes) in &encoded {
                    tree.insert(&address.as_bytes()[..], bytes.as_slice())?;
                }
                Ok(())
            })?;
        Ok(())
    }

    /// Insert `account` unless a record for its address exists. Returns
    /// whether it was inserted.
    pub fn insert_account_if_absent(&self, account: &Account) -> Result<bool, StorageError> {
        let bytes = encode(account)?;
        let cas = self.accounts.compare_and_swap(
            account.address.as_bytes(),
            None as Option<&[u8]>,
            Some(bytes),
        )?;
        Ok(cas.is_ok())
    }

    pub fn list_accounts(&self) -> Result<Vec<Account>, StorageError> {
        let mut out = Vec::new();
        for result in self.accounts.iter() {
            let (_key, value) = result?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    // ========== Transactions ==========

    /// Persist a new transaction, its submission index entry and, when
    /// `pending`, its pending index entry.
    pub fn put_transaction(&self, tx: &Transaction) -> Result<(), StorageError> {
        let bytes = encode(tx)?;
        let pending_entry = (tx.status == TransactionStatus::Pending)
            .then(|| pending_key(tx.received_at, &tx.transaction_id));
        (&self.transactions, &self.submissions, &self.pending).transaction(
            |(txs, subs, pending)| -> ConflictableTransactionResult<(), StorageError> {
                txs.insert(tx.transaction_id.as_bytes(), bytes.as_slice())?;
                subs.insert(tx.submission_id.as_bytes(), tx.transaction_id.as_bytes())?;
                if let Some(key) = &pending_entry {
                    pending.insert(key.as_slice(), tx.transaction_id.as_bytes())?;
                }
                Ok(())
            },
        )?;
        Ok(())
    }

    pub fn get_transaction(&self, transaction_id: &str) -> Result<Option<Transaction>, StorageError> {
        self.transactions
            .get(transaction_id.as_bytes())
            .map(|opt| opt.map(|ivec| decode(&ivec)))?
            .transpose()
    }

    pub fn get_transaction_by_submission(
        &self,
        submission_id: &str,
    ) -> Result<Option<Transaction>, StorageError> {
        let Some(tx_id) = self.submissions.get(submission_id.as_bytes())? else {
            return Ok(None);
        };
        let tx_id = String::from_utf8(tx_id.to_vec())
            .map_err(|_| StorageError::Corrupt(format!("submission {submission_id}")))?;
        self.get_transaction(&tx_id)
    }

    /// Overwrite the status of a stored transaction. Returns `false` when it
    /// does not exist.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Claim up to `max_count` pending transactions received strictly after
    /// `since`, marking them `included`.
    ///
    /// Each claim removes the pending index entry and rewrites the record in
    /// one sled transaction; an entry already removed by a concurrent drain
    /// is skipped, so no transaction is returned twice.
    pub fn drain_pending(
        &self,
        since: Option<u64>,
        max_count: usize,
        newest_first: bool,
    ) -> Result<Vec<Transaction>, StorageError> {
        let mut claimed = Vec::new();
        if max_count == 0 {
            return Ok(claimed);
        }
        let range = match since {
            Some(ts) => match ts.checked_add(1) {
                Some(lower) => self.pending.range(lower.to_be_bytes().to_vec()..),
                None => return Ok(claimed),
            },
            None => self.pending.iter(),
        };
        let entries: Box<dyn Iterator<Item = sled::Result<(IVec, IVec)>>> = if newest_first {
            Box::new(range.rev())
        } else {
            Box::new(range)
        };

        for result in entries {
            if claimed.len() >= max_count {
                break;
            }
            let (key, tx_id) = result?;
            let tx_id = String::from_utf8(tx_id.to_vec())
                .map_err(|_| StorageError::Corrupt("pending index entry".to_string()))?;
            let outcome = (&self.pending, &self.transactions).transaction(
                |(pending, txs)| -> ConflictableTransactionResult<Option<Transaction>, StorageError> {
                    if pending.remove(key.as_ref())?.is_none() {
                        return Ok(None);
                    }
                    let mut tx = tx_load_transaction(txs, &tx_id)?;
                    tx.status = TransactionStatus::Included;
                    txs.insert(tx_id.as_bytes(), tx_encode(&tx)?)?;
                    Ok(Some(tx))
                },
            )?;
            if let Some(tx) = outcome {
                claimed.push(tx);
            }
        }
        Ok(claimed)
    }

    /// Return drained, not yet badged transactions to `pending`. Returns how
    /// many were released.
    pub fn release(&self, drained: &[Transaction]) -> Result<usize, StorageError> {
        let mut released = 0usize;
        for tx in drained {
            let key = pending_key(tx.received_at, &tx.transaction_id);
            let done = (&self.pending, &self.transactions).transaction(
                |(pending, txs)| -> ConflictableTransactionResult<bool, StorageError> {
                    let mut current = tx_load_transaction(txs, &tx.transaction_id)?;
                    if current.status != TransactionStatus::Included || current.badge_id.is_some() {
                        return Ok(false);
                    }
                    current.status = TransactionStatus::Pending;
                    txs.insert(tx.transaction_id.as_bytes(), tx_encode(&current)?)?;
                    pending.insert(key.as_slice(), tx.transaction_id.as_bytes())?;
                    Ok(true)
                },
            )?;
            if done {
                released = released.saturating_add(1);
            }
        }
        Ok(released)
    }

    pub fn count_transactions(&self) -> Result<TransactionCounts, StorageError> {
        let mut counts = TransactionCounts::default();
        for result in self.transactions.iter() {
            let (_key, value) = result?;
            let tx: Transaction = decode(&value)?;
            let slot = match tx.status {
                TransactionStatus::Pending => &mut counts.pending,
                TransactionStatus::Included => &mut counts.included,
                TransactionStatus::Verified => &mut counts.verified,
                TransactionStatus::Failed => &mut counts.failed,
                TransactionStatus::Invalid => &mut counts.invalid,
            };
            *slot = slot.saturating_add(1);
        }
        Ok(counts)
    }

    // ========== Badges & chain pointer ==========

    pub fn get_badge(&self, badge_id: &str) -> Result<Option<Badge>, StorageError> {
        self.badges
            .get(badge_id.as_bytes())
            .map(|opt| opt.map(|ivec| decode(&ivec)))?
            .transpose()
    }

    pub fn get_badge_by_number(&self, blocknumber: u64) -> Result<Option<Badge>, StorageError> {
        let Some(id) = self.badge_numbers.get(blocknumber.to_be_bytes())? else {
            return Ok(None);
        };
        let id = String::from_utf8(id.to_vec())
            .map_err(|_| StorageError::Corrupt(format!("badge number {blocknumber}")))?;
        self.get_badge(&id)
    }

    pub fn badge_count(&self) -> usize {
        self.badges.len()
    }

    pub fn get_chain_pointer(&self) -> Result<Option<ChainPointer>, StorageError> {
        self.meta
            .get(META_CHAIN_POINTER_KEY)
            .map(|opt| opt.map(|ivec| decode(&ivec)))?
            .transpose()
    }

    /// Badge the chain pointer refers to.
    pub fn head_badge(&self) -> Result<Option<Badge>, StorageError> {
        match self.get_chain_pointer()? {
            Some(pointer) => self.get_badge(&pointer.curr_badge_id),
            None => Ok(None),
        }
    }

    /// Highest indexed blocknumber and its badge id.
    pub fn latest_indexed_badge(&self) -> Result<Option<(u64, String)>, StorageError> {
        let Some((key, id)) = self.badge_numbers.last()? else {
            return Ok(None);
        };
        let number: [u8; 8] = key
            .as_ref()
            .try_into()
            .map_err(|_| StorageError::Corrupt("badge number key".to_string()))?;
        let id = String::from_utf8(id.to_vec())
            .map_err(|_| StorageError::Corrupt("badge number value".to_string()))?;
        Ok(Some((u64::from_be_bytes(number), id)))
    }

    /// Persist `badge` together with the account records and failed
    /// transaction ids it produced: index it by blocknumber, stamp its
    /// transactions with its id, mark `failed` ids, write `accounts` and
    /// advance the chain pointer, all atomically.
    ///
    /// Fails without writing anything if the blocknumber is already taken.
    pub fn commit_badge(
        &self,
        badge: &Badge,
        accounts: &[Account],
        failed: &[String],
    ) -> Result<(), StorageError> {
        let badge_bytes = encode(badge)?;
        let pointer_bytes = encode(&ChainPointer {
            curr_badge_id: badge.badge_id.clone(),
        })?;
        let account_bytes = accounts
            .iter()
            .map(|a| encode(a).map(|bytes| (a.address, bytes)))
            .collect::<Result<Vec<_>, _>>()?;
        let number_key = badge.blocknumber.to_be_bytes();
        (
            &self.badges,
            &self.badge_numbers,
            &self.meta,
            &self.transactions,
            &self.accounts,
        )
            .transaction(
                |(badges, numbers, meta, txs, accts)| -> ConflictableTransactionResult<(), StorageError> {
                    if numbers.get(number_key)?.is_some() {
                        return Err(abort(StorageError::Corrupt(format!(
                            "blocknumber {} already linked",
                            badge.blocknumber
                        ))));
                    }
                    for tx_id in &badge.transactions {
                        let mut tx = tx_load_transaction(txs, tx_id)?;
                        tx.badge_id = Some(badge.badge_id.clone());
                        txs.insert(tx_id.as_bytes(), tx_encode(&tx)?)?;
                    }
                    for tx_id in failed {
                        let mut tx = tx_load_transaction(txs, tx_id)?;
                        tx.status = TransactionStatus::Failed;
                        txs.insert(tx_id.as_bytes(), tx_encode(&tx)?)?;
                    }
                    for (address, bytes) in &account_bytes {
                        accts.insert(&address.as_bytes()[..], bytes.as_slice())?;
                    }
                    badges.insert(badge.badge_id.as_bytes(), badge_bytes.as_slice())?;
                    numbers.insert(&number_key[..], badge.badge_id.as_bytes())?;
                    meta.insert(META_CHAIN_POINTER_KEY, pointer_bytes.as_slice())?;
                    Ok(())
                },
            )?;
        Ok(())
    }

    /// Record the verification outcome of a badge and move its `included`
    /// transactions to `verified` or `failed`.
    pub fn finalize_badge(&self, badge_id: &str, verified: bool) -> Result<Badge, StorageError> {
        let (badge_status, tx_status) = if verified {
            (BadgeStatus::Verified, TransactionStatus::Verified)
        } else {
            (BadgeStatus::Failed, TransactionStatus::Failed)
        };
        let badge = (&self.badges, &self.transactions).transaction(
            |(badges, txs)| -> ConflictableTransactionResult<Badge, StorageError> {
                let Some(raw) = badges.get(badge_id.as_bytes())? else {
                    return Err(abort(StorageError::NotFound(format!("badge {badge_id}"))));
                };
                let mut badge: Badge = tx_decode(&raw)?;
                badge.status = badge_status;
                for tx_id in &badge.transactions {
                    let mut tx = tx_load_transaction(txs, tx_id)?;
                    if tx.status == TransactionStatus::Included {
                        tx.status = tx_status;
                        txs.insert(tx_id.as_bytes(), tx_encode(&tx)?)?;
                    }
                }
                badges.insert(badge_id.as_bytes(), tx_encode(&badge)?)?;
                Ok(badge)
            },
        )?;
        Ok(badge)
    }

    /// Point the chain pointer at the highest indexed badge if it lags
    /// behind. Returns whether a repair happened.
    pub fn repair_chain_pointer(&self) -> Result<bool, StorageError> {
        let Some((number, latest_id)) = self.latest_indexed_badge()? else {
            return Ok(false);
        };
        let current = self.get_chain_pointer()?;
        if current.as_ref().map(|p| p.curr_badge_id.as_str()) == Some(latest_id.as_str()) {
            return Ok(false);
        }
        if self.get_badge(&latest_id)?.is_none() {
            return Err(StorageError::Corrupt(format!(
                "indexed badge {latest_id} missing"
            )));
        }
        warn!(
            blocknumber = number,
            badge_id = %latest_id,
            previous = ?current.map(|p| p.curr_badge_id),
            "repairing stale chain pointer"
        );
        let pointer = ChainPointer {
            curr_badge_id: latest_id,
        };
        self.meta.insert(META_CHAIN_POINTER_KEY, encode(&pointer)?)?;
        Ok(true)
    }

    // ========== Bridge deposits ==========

    /// Persist a deposit marker unless one exists for `deposit_id`. Returns
    /// whether it was newly stored.
    pub fn put_deposit_if_absent(&self, deposit_id: &str, data: &[u8]) -> Result<bool, StorageError> {
        let cas = self.bridge_deposits.compare_and_swap(
            deposit_id.as_bytes(),
            None as Option<&[u8]>,
            Some(data),
        )?;
        Ok(cas.is_ok())
    }

    pub fn deposit_exists(&self, deposit_id: &str) -> Result<bool, StorageError> {
        Ok(self.bridge_deposits.contains_key(deposit_id.as_bytes())?)
    }

    pub fn count_deposits(&self) -> u64 {
        u64::try_from(self.bridge_deposits.len()).unwrap_or(u64::MAX)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let existing = self.meta.get(META_SCHEMA_KEY)?;
        match existing {
            Some(val) => {
                let current = String::from_utf8_lossy(&val).to_string();
                if current != SCHEMA_VERSION {
                    return Err(StorageError::SchemaMismatch {
                        expected: SCHEMA_VERSION.to_string(),
                        found: Some(current),
                    });
                }
            }
            None => {
                self.meta.insert(META_SCHEMA_KEY, SCHEMA_VERSION.as_bytes())?;
                info!(schema = SCHEMA_VERSION, "initialized schema version");
            }
        }
        Ok(())
    }
}

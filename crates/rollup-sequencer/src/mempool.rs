use std::sync::Arc;

use rollup_core::{
    new_id, now_ms, signature, Account, Address, SubmissionResult, Transaction,
    TransactionRequest, TransactionStatus,
};
use rollup_storage::Storage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::SequencerError;

/// Order in which pending transactions are claimed by a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainOrder {
    /// FIFO by `receivedAt`, ties broken by transaction id.
    #[default]
    OldestFirst,
    NewestFirst,
}

impl DrainOrder {
    pub fn from_env_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "newest_first" | "newest" | "lifo" | "desc" => Self::NewestFirst,
            _ => Self::OldestFirst,
        }
    }
}

/// Admission and queueing of transactions.
#[derive(Clone)]
pub struct Mempool {
    storage: Arc<Storage>,
    order: DrainOrder,
}

impl Mempool {
    pub fn new(storage: Arc<Storage>, order: DrainOrder) -> Self {
        Self { storage, order }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn order(&self) -> DrainOrder {
        self.order
    }

    /// Admit a signed transfer. Always persisted: `pending` when the
    /// signature verifies, `invalid` otherwise.
    pub fn submit(&self, request: TransactionRequest) -> Result<SubmissionResult, SequencerError> {
        self.submit_at(request, now_ms())
    }

    pub fn submit_at(
        &self,
        request: TransactionRequest,
        received_at: u64,
    ) -> Result<SubmissionResult, SequencerError> {
        let submission_id = new_id();
        let mut tx = Transaction::from_request(request, submission_id.clone(), new_id(), received_at);
        let accepted = signature::verify(&tx);
        if !accepted {
            tx.status = TransactionStatus::Invalid;
        }
        self.storage.put_transaction(&tx)?;
        if accepted {
            debug!(
                submission_id = %submission_id,
                tx_id = %tx.transaction_id,
                "accepted submission"
            );
        } else {
            warn!(
                submission_id = %submission_id,
                sender = %tx.sender,
                "rejected submission with invalid signature"
            );
        }
        Ok(SubmissionResult {
            submission_id,
            accepted,
        })
    }

    /// Queue a deposit credited to `address`. An unseen address gets a
    /// zero account record; an existing record is left untouched. Zero
    /// amounts are refused.
    pub fn ingest_deposit(
        &self,
        address: Address,
        amount: u64,
        observed_at: u64,
    ) -> Result<Transaction, SequencerError> {
        if amount == 0 {
            return Err(SequencerError::ZeroDeposit(address));
        }
        if self
            .storage
            .insert_account_if_absent(&Account::new(address, 0, 0))?
        {
            info!(address = %address, "created account for deposit target");
        }
        let tx = Transaction::deposit(address, amount, new_id(), new_id(), observed_at);
        self.storage.put_transaction(&tx)?;
        info!(
            address = %address,
            amount,
            tx_id = %tx.transaction_id,
            "queued deposit"
        );
        Ok(tx)
    }

    /// Claim up to `max_count` pending transactions received after `since`
    /// and mark them `included`. Concurrent drains never overlap.
    pub fn drain(
        &self,
        since: Option<u64>,
        max_count: usize,
    ) -> Result<Vec<Transaction>, SequencerError> {
        let newest_first = self.order == DrainOrder::NewestFirst;
        Ok(self.storage.drain_pending(since, max_count, newest_first)?)
    }

    /// Return drained transactions to `pending`.
    pub fn release(&self, txs: &[Transaction]) -> Result<usize, SequencerError> {
        Ok(self.storage.release(txs)?)
    }

    /// Next expected nonce for `address`, `0` for unknown addresses.
    pub fn get_nonce(&self, address: &Address) -> Result<u64, SequencerError> {
        Ok(self
            .storage
            .get_account(address)?
            .map(|a| a.latest().nonce)
            .unwrap_or(0))
    }

    pub fn get_status(
        &self,
        submission_id: &str,
    ) -> Result<Option<TransactionStatus>, SequencerError> {
        Ok(self
            .storage
            .get_transaction_by_submission(submission_id)?
            .map(|tx| tx.status))
    }

    pub fn get_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<Transaction>, SequencerError> {
        Ok(self.storage.get_transaction(transaction_id)?)
    }

    pub fn pending_count(&self) -> usize {
        self.storage.pending_count()
    }
}

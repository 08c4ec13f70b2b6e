use serde::{Deserialize, Serialize};

use crate::canonical::{Address, Hash32};

/// `prevBadge` value carried by the genesis badge.
pub const GENESIS_PREV_BADGE: &str = "0";

/// Block hash of the genesis badge (all zero bytes, 64 `0` characters in hex).
pub const GENESIS_BLOCKHASH: Hash32 = Hash32::ZERO;

/// Lifecycle of a submitted or synthesized transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Included,
    Verified,
    Failed,
    /// Rejected at admission (bad signature). Never drained.
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BadgeStatus {
    SendToVerify,
    Verified,
    Failed,
}

/// What triggered a formation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionCause {
    /// The badge interval elapsed.
    Timedout,
    /// The accepted-submission counter reached the batch size.
    Filledup,
}

impl ExecutionCause {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timedout => "timedout",
            Self::Filledup => "filledup",
        }
    }
}

/// A signed transfer intent as handed over by a client.
///
/// `signature` and `pubKey` stay as raw hex strings so malformed input can
/// still be recorded as `invalid` for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub sender: Address,
    pub receiver: Address,
    pub amount: u64,
    pub nonce: u64,
    pub signature: String,
    #[serde(rename = "pubKey")]
    pub pub_key: String,
}

/// Persisted transaction record. `receiver == None` marks a deposit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub received_at: u64,
    pub submission_id: String,
    pub transaction_id: String,
    pub sender: Address,
    pub receiver: Option<Address>,
    pub nonce: Option<u64>,
    pub signature: Option<String>,
    pub pub_key: Option<String>,
    pub amount: u64,
    pub status: TransactionStatus,
    #[serde(default)]
    pub badge_id: Option<String>,
}

impl Transaction {
    pub fn from_request(
        req: TransactionRequest,
        submission_id: String,
        transaction_id: String,
        received_at: u64,
    ) -> Self {
        Self {
            received_at,
            submission_id,
            transaction_id,
            sender: req.sender,
            receiver: Some(req.receiver),
            nonce: Some(req.nonce),
            signature: Some(req.signature),
            pub_key: Some(req.pub_key),
            amount: req.amount,
            status: TransactionStatus::Pending,
            badge_id: None,
        }
    }

    /// Deposit credited to `address`; carries no receiver, nonce or signature.
    pub fn deposit(
        address: Address,
        amount: u64,
        submission_id: String,
        transaction_id: String,
        received_at: u64,
    ) -> Self {
        Self {
            received_at,
            submission_id,
            transaction_id,
            sender: address,
            receiver: None,
            nonce: None,
            signature: None,
            pub_key: None,
            amount,
            status: TransactionStatus::Pending,
            badge_id: None,
        }
    }

    pub fn is_deposit(&self) -> bool {
        self.receiver.is_none()
    }
}

/// `(balance, nonce)` pair as seen at some point in the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccountState {
    pub balance: u64,
    pub nonce: u64,
}

impl AccountState {
    pub fn new(balance: u64, nonce: u64) -> Self {
        Self { balance, nonce }
    }
}

/// One change-log entry: the net effect of a badge on one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountUpdate {
    pub balance_before: u64,
    pub balance_after: u64,
    pub nonce_before: u64,
    pub nonce_after: u64,
    pub transactions: Vec<String>,
    #[serde(rename = "badgeId")]
    pub badge_id: String,
}

impl AccountUpdate {
    pub fn after(&self) -> AccountState {
        AccountState::new(self.balance_after, self.nonce_after)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: Address,
    pub balance: u64,
    pub nonce: u64,
    #[serde(default)]
    pub account_updates: Vec<AccountUpdate>,
}

impl Account {
    pub fn new(address: Address, balance: u64, nonce: u64) -> Self {
        Self {
            address,
            balance,
            nonce,
            account_updates: Vec::new(),
        }
    }

    /// Latest known state: the last change-log entry, or the base values.
    pub fn latest(&self) -> AccountState {
        self.account_updates
            .last()
            .map(AccountUpdate::after)
            .unwrap_or(AccountState::new(self.balance, self.nonce))
    }

    /// Record that `tx_id` moved this account to `after` within `badge_id`.
    ///
    /// Consecutive changes within the same badge fold into one entry. The
    /// base `balance`/`nonce` fields follow the latest state.
    pub fn record(&mut self, badge_id: &str, tx_id: &str, after: AccountState) {
        let before = self.latest();
        match self.account_updates.last_mut() {
            Some(last) if last.badge_id == badge_id => {
                last.balance_after = after.balance;
                last.nonce_after = after.nonce;
                last.transactions.push(tx_id.to_string());
            }
            _ => self.account_updates.push(AccountUpdate {
                balance_before: before.balance,
                balance_after: after.balance,
                nonce_before: before.nonce,
                nonce_after: after.nonce,
                transactions: vec![tx_id.to_string()],
                badge_id: badge_id.to_string(),
            }),
        }
        self.balance = after.balance;
        self.nonce = after.nonce;
    }
}

/// A committed batch: one link in the hash chain of state roots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Badge {
    #[serde(rename = "badgeId")]
    pub badge_id: String,
    pub status: BadgeStatus,
    pub blockhash: Hash32,
    pub state_root: Hash32,
    pub blocknumber: u64,
    pub timestamp: u64,
    #[serde(rename = "executionCause")]
    pub execution_cause: Option<ExecutionCause>,
    pub transactions: Vec<String>,
    #[serde(rename = "prevBadge")]
    pub prev_badge: String,
}

impl Badge {
    pub fn genesis(badge_id: String, state_root: Hash32, timestamp: u64) -> Self {
        Self {
            badge_id,
            status: BadgeStatus::Verified,
            blockhash: GENESIS_BLOCKHASH,
            state_root,
            blocknumber: 0,
            timestamp,
            execution_cause: None,
            transactions: Vec::new(),
            prev_badge: GENESIS_PREV_BADGE.to_string(),
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_badge == GENESIS_PREV_BADGE
    }
}

/// Head of the badge chain. Exactly one exists once genesis has run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainPointer {
    #[serde(rename = "currBadgeID")]
    pub curr_badge_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionResult {
    #[serde(rename = "submissionId")]
    pub submission_id: String,
    pub accepted: bool,
}

/// Entry of the genesis account file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisAccount {
    #[serde(alias = "pub_key")]
    pub address: Address,
    pub balance: u64,
    #[serde(default)]
    pub nonce: u64,
}

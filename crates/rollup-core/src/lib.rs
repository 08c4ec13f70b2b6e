#![forbid(unsafe_code)]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::float_cmp)]
#![deny(clippy::cast_precision_loss)]
#![deny(clippy::cast_possible_truncation)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::cast_sign_loss)]
#![deny(clippy::disallowed_types)]

//! Core types and primitives for the badge rollup.
//!
//! Everything here is pure: record types with their stable JSON field
//! names, the hashing rules that bind transactions, badges and account
//! leaves, transfer signature verification, and the in-memory sparse
//! Merkle tree that accumulates account state.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod canonical;
pub mod hashing;
pub mod signature;
pub mod smt;
pub mod types;

pub use canonical::{canonical_json_bytes, decode_hex, normalize_hex, Address, CoreError, Hash32};
pub use hashing::{
    block_hash, leaf_hash, leaf_value, rolling_tx_hash, sha256, transaction_hash, tree_key,
    LEAF_VALUE_LEN, ROLLING_SEED,
};
pub use signature::{canonical_message, message_digest, sign_transfer, verify};
pub use smt::{MemorySmt, SparseMerkle, SMT_DEPTH};
pub use types::{
    Account, AccountState, AccountUpdate, Badge, BadgeStatus, ChainPointer, ExecutionCause,
    GenesisAccount, SubmissionResult, Transaction, TransactionRequest, TransactionStatus,
    GENESIS_BLOCKHASH, GENESIS_PREV_BADGE,
};

/// Fresh random identifier (UUID v4) for badges, submissions and transactions.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis();
    u64::try_from(millis).unwrap_or(u64::MAX)
}

//! Hashing rules binding transactions, badges and account leaves.
//!
//! All integers are encoded as little-endian `u64`. The hash function is
//! SHA-256 throughout.

use sha2::{Digest, Sha256};

use crate::canonical::{Address, Hash32};
use crate::types::{AccountState, Transaction};

/// Initial accumulator of the rolling transaction hash.
pub const ROLLING_SEED: [u8; 8] = [0u8; 8];

/// `balance_le8 || nonce_le8 || sha256(address)`.
pub const LEAF_VALUE_LEN: usize = 48;

/// Receiver placeholder hashed for deposits.
const DEPOSIT_RECEIVER: &[u8] = b"0";

pub fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// `H(t) = sha256(sender || receiver_or_"0" || nonce || amount || receivedAt)`.
pub fn transaction_hash(tx: &Transaction) -> [u8; 32] {
    let receiver: &[u8] = match &tx.receiver {
        Some(r) => r.as_bytes(),
        None => DEPOSIT_RECEIVER,
    };
    let nonce = tx.nonce.unwrap_or(0).to_le_bytes();
    let amount = tx.amount.to_le_bytes();
    let received_at = tx.received_at.to_le_bytes();
    sha256(&[tx.sender.as_bytes(), receiver, &nonce, &amount, &received_at])
}

/// Order-sensitive accumulator over the given transactions.
///
/// Returns [`ROLLING_SEED`] unchanged (8 bytes) for an empty sequence and a
/// 32-byte digest otherwise.
pub fn rolling_tx_hash<'a, I>(txs: I) -> Vec<u8>
where
    I: IntoIterator<Item = &'a Transaction>,
{
    txs.into_iter()
        .fold(ROLLING_SEED.to_vec(), |acc, tx| {
            sha256(&[&acc, &transaction_hash(tx)]).to_vec()
        })
}

/// `sha256(blocknumber || timestamp || prev_blockhash || rolling_tx_hash)`.
pub fn block_hash(blocknumber: u64, timestamp: u64, prev: &Hash32, rolling: &[u8]) -> Hash32 {
    Hash32(sha256(&[
        &blocknumber.to_le_bytes(),
        &timestamp.to_le_bytes(),
        prev.as_bytes(),
        rolling,
    ]))
}

/// Position of an account in the sparse Merkle tree.
pub fn tree_key(address: &Address) -> [u8; 32] {
    sha256(&[address.as_bytes()])
}

pub fn leaf_value(address: &Address, state: AccountState) -> [u8; LEAF_VALUE_LEN] {
    let mut out = [0u8; LEAF_VALUE_LEN];
    out[..8].copy_from_slice(&state.balance.to_le_bytes());
    out[8..16].copy_from_slice(&state.nonce.to_le_bytes());
    out[16..].copy_from_slice(&tree_key(address));
    out
}

/// Value stored at the leaf for an account.
pub fn leaf_hash(address: &Address, state: AccountState) -> [u8; 32] {
    sha256(&[&leaf_value(address, state)])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(nonce: u64, amount: u64, received_at: u64) -> Transaction {
        let mut tx = Transaction::deposit(Address([1; 32]), amount, "s".into(), "t".into(), received_at);
        tx.receiver = Some(Address([2; 32]));
        tx.nonce = Some(nonce);
        tx
    }

    #[test]
    fn rolling_hash_of_empty_set_is_seed() {
        let empty: Vec<Transaction> = Vec::new();
        assert_eq!(rolling_tx_hash(&empty), ROLLING_SEED.to_vec());
    }

    #[test]
    fn rolling_hash_matches_manual_fold() {
        let a = transfer(0, 1, 10);
        let b = transfer(1, 2, 11);
        let step1 = sha256(&[&ROLLING_SEED, &transaction_hash(&a)]);
        let step2 = sha256(&[&step1, &transaction_hash(&b)]);
        assert_eq!(rolling_tx_hash([&a, &b]), step2.to_vec());
    }

    #[test]
    fn rolling_hash_is_order_sensitive() {
        let a = transfer(0, 1, 10);
        let b = transfer(1, 2, 11);
        assert_ne!(rolling_tx_hash([&a, &b]), rolling_tx_hash([&b, &a]));
    }

    #[test]
    fn deposit_hash_uses_zero_receiver_and_nonce() {
        let dep = Transaction::deposit(Address([9; 32]), 500, "s".into(), "t".into(), 42);
        let expected = sha256(&[
            &[9u8; 32],
            b"0",
            &0u64.to_le_bytes(),
            &500u64.to_le_bytes(),
            &42u64.to_le_bytes(),
        ]);
        assert_eq!(transaction_hash(&dep), expected);
    }

    #[test]
    fn block_hash_binds_every_input() {
        let prev = Hash32::ZERO;
        let base = block_hash(1, 100, &prev, &ROLLING_SEED);
        assert_ne!(base, block_hash(2, 100, &prev, &ROLLING_SEED));
        assert_ne!(base, block_hash(1, 101, &prev, &ROLLING_SEED));
        assert_ne!(base, block_hash(1, 100, &Hash32([1; 32]), &ROLLING_SEED));
        assert_ne!(base, block_hash(1, 100, &prev, &[1u8; 32]));
    }

    #[test]
    fn leaf_value_layout() {
        let address = Address([4; 32]);
        let value = leaf_value(&address, AccountState::new(1000, 2));
        assert_eq!(&value[..8], &1000u64.to_le_bytes());
        assert_eq!(&value[8..16], &2u64.to_le_bytes());
        assert_eq!(&value[16..], &tree_key(&address));
    }
}

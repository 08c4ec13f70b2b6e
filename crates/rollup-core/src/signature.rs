//! Transfer signature verification.
//!
//! A transfer is signed over the BLAKE3 digest of its canonical JSON
//! message `{"amount":"<decimal>","nonce":n,"receiver":"<hex>","sender":"<hex>"}`.
//! The signing key's public half is the sender address.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::Serialize;

use crate::canonical::{canonical_json_bytes, decode_hex, Address, CoreError};
use crate::types::{Transaction, TransactionRequest};

#[derive(Serialize)]
struct TransferMessage {
    amount: String,
    nonce: u64,
    receiver: Address,
    sender: Address,
}

pub fn canonical_message(
    sender: &Address,
    receiver: &Address,
    amount: u64,
    nonce: u64,
) -> Result<Vec<u8>, CoreError> {
    canonical_json_bytes(&TransferMessage {
        amount: amount.to_string(),
        nonce,
        receiver: *receiver,
        sender: *sender,
    })
}

pub fn message_digest(
    sender: &Address,
    receiver: &Address,
    amount: u64,
    nonce: u64,
) -> Result<[u8; 32], CoreError> {
    let msg = canonical_message(sender, receiver, amount, nonce)?;
    Ok(*blake3::hash(&msg).as_bytes())
}

/// Whether `tx` carries a valid signature by its sender.
///
/// Deposits, missing fields, malformed hex, wrong lengths and invalid
/// curve points all yield `false`.
pub fn verify(tx: &Transaction) -> bool {
    let (Some(receiver), Some(nonce), Some(sig_hex), Some(pk_hex)) =
        (&tx.receiver, tx.nonce, &tx.signature, &tx.pub_key)
    else {
        return false;
    };

    let Ok(pk_bytes) = decode_hex(pk_hex) else {
        return false;
    };
    let Ok(pk_bytes) = <[u8; 32]>::try_from(pk_bytes.as_slice()) else {
        return false;
    };
    if &pk_bytes != tx.sender.as_bytes() {
        return false;
    }
    let Ok(verifying_key) = VerifyingKey::from_bytes(&pk_bytes) else {
        return false;
    };

    let Ok(sig_bytes) = decode_hex(sig_hex) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_bytes);

    match message_digest(&tx.sender, receiver, tx.amount, nonce) {
        Ok(digest) => verifying_key.verify(&digest, &signature).is_ok(),
        Err(_) => false,
    }
}

/// Build a signed transfer request from `signing_key`'s account.
pub fn sign_transfer(
    signing_key: &SigningKey,
    receiver: Address,
    amount: u64,
    nonce: u64,
) -> Result<TransactionRequest, CoreError> {
    let sender = Address(signing_key.verifying_key().to_bytes());
    let digest = message_digest(&sender, &receiver, amount, nonce)?;
    let signature = signing_key.sign(&digest);
    Ok(TransactionRequest {
        sender,
        receiver,
        amount,
        nonce,
        signature: hex::encode(signature.to_bytes()),
        pub_key: sender.to_hex(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_signing_key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn signed_tx(key: &SigningKey, amount: u64, nonce: u64) -> Transaction {
        let req = sign_transfer(key, Address([7; 32]), amount, nonce).expect("sign");
        Transaction::from_request(req, "s".into(), "t".into(), 1)
    }

    #[test]
    fn canonical_message_layout() {
        let msg = canonical_message(&Address([1; 32]), &Address([2; 32]), 25, 3).expect("msg");
        let expected = format!(
            r#"{{"amount":"25","nonce":3,"receiver":"{}","sender":"{}"}}"#,
            "02".repeat(32),
            "01".repeat(32)
        );
        assert_eq!(String::from_utf8(msg).expect("utf8"), expected);
    }

    #[test]
    fn valid_signature_verifies() {
        let key = test_signing_key(0x42);
        assert!(verify(&signed_tx(&key, 10, 0)));
    }

    #[test]
    fn verification_is_deterministic() {
        let key = test_signing_key(0x42);
        let tx = signed_tx(&key, 10, 0);
        let before = tx.clone();
        assert_eq!(verify(&tx), verify(&tx));
        assert_eq!(tx, before);
    }

    #[test]
    fn tampered_fields_fail() {
        let key = test_signing_key(0x42);
        let mut tx = signed_tx(&key, 10, 0);
        tx.amount = 11;
        assert!(!verify(&tx));

        let mut tx = signed_tx(&key, 10, 0);
        tx.nonce = Some(1);
        assert!(!verify(&tx));

        let mut tx = signed_tx(&key, 10, 0);
        tx.receiver = Some(Address([8; 32]));
        assert!(!verify(&tx));
    }

    #[test]
    fn pub_key_must_match_sender() {
        let key = test_signing_key(0x42);
        let other = test_signing_key(0x43);
        let mut tx = signed_tx(&key, 10, 0);
        tx.sender = Address(other.verifying_key().to_bytes());
        assert!(!verify(&tx));
    }

    #[test]
    fn malformed_inputs_fail() {
        let key = test_signing_key(0x42);

        let mut tx = signed_tx(&key, 10, 0);
        tx.signature = Some("zz".into());
        assert!(!verify(&tx));

        let mut tx = signed_tx(&key, 10, 0);
        tx.signature = Some("00".repeat(10));
        assert!(!verify(&tx));

        let mut tx = signed_tx(&key, 10, 0);
        tx.pub_key = Some("ab".repeat(16));
        assert!(!verify(&tx));

        let mut tx = signed_tx(&key, 10, 0);
        tx.pub_key = None;
        assert!(!verify(&tx));

        let dep = Transaction::deposit(Address([1; 32]), 5, "s".into(), "t".into(), 1);
        assert!(!verify(&dep));
    }
}

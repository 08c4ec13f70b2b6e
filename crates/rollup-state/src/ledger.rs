//! Pure balance/nonce transitions over account records.
//!
//! Nothing here touches storage or the tree; callers load the records,
//! run the transition and persist what comes back.

use rollup_core::{Account, AccountState, Address};

use crate::InvariantViolation;

/// The receiving side of a transfer as found in the store.
#[derive(Debug, Clone)]
pub enum Counterparty {
    /// Receiver equals sender.
    SameAccount,
    Existing(Account),
    Missing,
}

/// Checked transfer of `amount` from `sender` at `nonce`.
///
/// Checks run in order: balance, nonce, receiver presence, receiver
/// overflow. Returns the updated records (one for a self-transfer, sender
/// first otherwise).
pub fn transfer(
    mut sender: Account,
    receiver: Counterparty,
    amount: u64,
    nonce: u64,
    tx_id: &str,
    badge_id: &str,
) -> Result<Vec<Account>, InvariantViolation> {
    let from = sender.latest();
    let debited = from
        .balance
        .checked_sub(amount)
        .ok_or(InvariantViolation::InsufficientBalance {
            balance: from.balance,
            amount,
        })?;
    if from.nonce != nonce {
        return Err(InvariantViolation::NonceMismatch {
            expected: from.nonce,
            got: nonce,
        });
    }
    let next_nonce = from
        .nonce
        .checked_add(1)
        .ok_or(InvariantViolation::NonceOverflow)?;

    match receiver {
        Counterparty::SameAccount => {
            sender.record(badge_id, tx_id, AccountState::new(from.balance, next_nonce));
            Ok(vec![sender])
        }
        Counterparty::Missing => Err(InvariantViolation::UnknownReceiver),
        Counterparty::Existing(mut receiver) => {
            let to = receiver.latest();
            let credited = to
                .balance
                .checked_add(amount)
                .ok_or(InvariantViolation::BalanceOverflow)?;
            sender.record(badge_id, tx_id, AccountState::new(debited, next_nonce));
            receiver.record(badge_id, tx_id, AccountState::new(credited, to.nonce));
            Ok(vec![sender, receiver])
        }
    }
}

/// Credit `amount` to `address`, creating the record at nonce 0 when absent.
/// Returns `None` on balance overflow.
pub fn deposit(
    target: Option<Account>,
    address: Address,
    amount: u64,
    tx_id: &str,
    badge_id: &str,
) -> Option<Account> {
    let mut account = target.unwrap_or_else(|| Account::new(address, 0, 0));
    let current = account.latest();
    let credited = current.balance.checked_add(amount)?;
    account.record(badge_id, tx_id, AccountState::new(credited, current.nonce));
    Some(account)
}

/// Whether the account occupies a leaf in the state tree.
///
/// Records that were never touched and hold zero balance and nonce (deposit
/// placeholders, empty genesis entries) have no leaf.
pub fn has_leaf(account: &Account) -> bool {
    !account.account_updates.is_empty() || account.latest() != AccountState::default()
}

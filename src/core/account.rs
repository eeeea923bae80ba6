use crate::core::PublicKey;
use serde::{Deserialize, Serialize};

/// Ledger entry of one account on one chain.
///
/// `nonce` counts the transactions the account has sent and doubles as its
/// mining power under Proof-of-Transaction.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct AccountState {
    pub balance: u64,
    pub nonce: u64,
}

impl AccountState {
    pub fn new(balance: u64, nonce: u64) -> AccountState {
        AccountState { balance, nonce }
    }

    pub fn power(&self) -> u64 {
        self.nonce
    }
}

/// Post-block state of an account touched by a block, carried inside the block.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct AccountSnapshot {
    pub public_key: PublicKey,
    pub state: AccountState,
}

impl AccountSnapshot {
    pub fn new(public_key: PublicKey, state: AccountState) -> AccountSnapshot {
        AccountSnapshot { public_key, state }
    }
}

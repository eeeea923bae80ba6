//! Core chain data
//!
//! Blocks, transactions, account states and the state processor that applies
//! one block's effects to an account store.

pub mod account;
pub mod block;
pub mod state_processor;
pub mod transaction;
pub mod types;

pub use account::{AccountSnapshot, AccountState};
pub use block::{Block, BlockContainer, NewBlock};
pub use state_processor::{ProcessOutcome, StateProcessor};
pub use transaction::{GenesisAccount, Transaction, TxKind};
pub use types::{ChainId, Hash, PublicKey, HASH_LEN};

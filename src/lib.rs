//! # Strand Chain - Multi-Chain Replication Engine
//!
//! A node that follows any number of small community chains at once. Every
//! chain is replicated over a DHT, validated with Proof-of-Transaction and
//! applied to a per-chain account ledger.
//!
//! ## What Is Here
//! - **Proof-of-Transaction**: an account's mining power is the number of
//!   transactions it has sent; base target and cumulative difficulty follow
//!   from block timestamps
//! - **Fork Resolution**: forks inside the mutable range switch by cumulative
//!   difficulty, deeper ones are settled by a vote over immutable points
//! - **Tracked State**: account changes are buffered in nested Tracks and
//!   committed together with main-chain flag flips, or not at all
//! - **Backward Sync**: a new node starts from a tip and learns account
//!   states from block snapshots on the way down to genesis
//! - **Chain Workers**: one thread per chain, reached only by message passing
//!
//! ## Code Layout
//! - `core/`: identifiers, accounts, transactions, blocks, state processor
//! - `consensus/`: PoT arithmetic, block validation, voting pool
//! - `storage/`: sled-backed state db with Tracks, block store, tx pool
//! - `network/`: DHT transport boundary, peer sets
//! - `engine/`: chain workers, fork handling, mining, the `Chains` orchestrator
//! - `account/`: local key pair and key file
//! - `config/`: node, consensus and engine settings
//! - `utils/`: hashing, signatures, time, bincode helpers
//! - `cli/`: command-line arguments
//!
//! ## Where To Start
//! 1. `engine/worker.rs` for the per-tick state machine
//! 2. `engine/fork.rs` for re-branching, voting and resync
//! 3. `consensus/pot.rs` for mining eligibility
//! 4. `storage/state_db.rs` for how state changes stay atomic

pub mod account;
pub mod cli;
pub mod config;
pub mod consensus;
pub mod core;
pub mod engine;
pub mod error;
pub mod network;
pub mod storage;
pub mod utils;

#[cfg(test)]
pub mod testnet;

// Re-export commonly used types for convenience
pub use account::KeyPair;
pub use cli::{Command, Opt};
pub use config::{Config, ConsensusConfig, EngineConfig, NodeConfig};
pub use consensus::{ProofOfTransaction, Rejection, Validity, VotingPool};
pub use core::{
    AccountState, Block, BlockContainer, ChainId, GenesisAccount, Hash, PublicKey, Transaction,
    TxKind,
};
pub use engine::{ChainWorker, Chains, ForkOutcome, Phase};
pub use error::{ChainError, Result};
pub use network::{DhtTransport, MemoryDht, PeerManager};
pub use storage::{BlockStore, StateDb, Storage, TransactionPool};
pub use utils::{current_timestamp, sha256_digest};

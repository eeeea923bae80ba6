//! Consensus rules: Proof-of-Transaction, block validation and vote tallying

pub mod pot;
pub mod validation;
pub mod voting_pool;

pub use pot::{PotViolation, ProofOfTransaction, ADJUSTMENT_WINDOW, GENESIS_BASE_TARGET};
pub use validation::{check_intrinsic, check_signatures, is_valid_block, Rejection, Validity};
pub use voting_pool::VotingPool;

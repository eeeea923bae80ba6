// Proof-of-Transaction: Nxt-style base target / generation signature / hit
// rules, except that the effective balance is replaced by the miner's power
// (the number of transactions the account has sent).

use crate::config::ConsensusConfig;
use crate::core::{Block, BlockContainer, Hash, PublicKey};
use num_bigint::BigUint;
use once_cell::sync::Lazy;

/// Base target of the genesis block and of the first blocks after it.
pub const GENESIS_BASE_TARGET: u64 = 0x21D0_369D_0369_78;

/// Cumulative difficulty grows by `2^64 / base_target` per block.
static DIFF_ADJUST_NUMERATOR: Lazy<BigUint> = Lazy::new(|| BigUint::from(1u8) << 64u32);

// decreases are damped by gamma = 64 / 100
const GAMMA_NUMERATOR: u128 = 64;
const GAMMA_DENOMINATOR: u128 = 100;

// blocks averaged by the base target adjustment
pub const ADJUSTMENT_WINDOW: u64 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PotViolation {
    BaseTarget { expected: u64, actual: u64 },
    GenerationSignature,
    CumulativeDifficulty { expected: u64, actual: u64 },
    MissingMinerPower,
    HitAboveTarget { interval: i64 },
}

impl std::fmt::Display for PotViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PotViolation::BaseTarget { expected, actual } => {
                write!(f, "base target {actual} (expected {expected})")
            }
            PotViolation::GenerationSignature => write!(f, "generation signature mismatch"),
            PotViolation::CumulativeDifficulty { expected, actual } => {
                write!(f, "cumulative difficulty {actual} (expected {expected})")
            }
            PotViolation::MissingMinerPower => write!(f, "block carries no miner state"),
            PotViolation::HitAboveTarget { interval } => {
                write!(f, "hit not below target after {interval}s")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProofOfTransaction {
    config: ConsensusConfig,
}

impl ProofOfTransaction {
    pub fn new(config: ConsensusConfig) -> ProofOfTransaction {
        ProofOfTransaction { config }
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Base target required for the child of `parent`.
    ///
    /// `ancestor` is the block `ADJUSTMENT_WINDOW` heights below `parent`; it
    /// is only consulted once the chain is past its first blocks, and `None`
    /// is returned when it is needed but missing.
    pub fn calculate_required_base_target(
        &self,
        parent: &Block,
        ancestor: Option<&Block>,
    ) -> Option<u64> {
        if parent.get_block_num() <= ADJUSTMENT_WINDOW {
            return Some(GENESIS_BASE_TARGET);
        }
        let ancestor = ancestor?;

        let total = (parent.get_timestamp() - ancestor.get_timestamp()).max(0) as u128;
        let average = total / ADJUSTMENT_WINDOW as u128;
        let block_time = self.config.block_time as u128;
        let previous = parent.get_base_target() as u128;

        let next = if average > block_time {
            previous * average.min(self.config.max_block_time as u128) / block_time
        } else {
            let floor = average.max(self.config.min_block_time as u128);
            previous
                - previous * GAMMA_NUMERATOR * (block_time - floor)
                    / (GAMMA_DENOMINATOR * block_time)
        };
        Some(next.clamp(1, u64::MAX as u128) as u64)
    }

    pub fn calculate_generation_signature(
        &self,
        parent_generation_signature: &Hash,
        miner: &PublicKey,
    ) -> Hash {
        let mut data = parent_generation_signature.as_bytes().to_vec();
        data.extend_from_slice(miner.as_bytes());
        Hash::digest(&data)
    }

    pub fn genesis_generation_signature(&self, miner: &PublicKey) -> Hash {
        Hash::digest(miner.as_bytes())
    }

    pub fn calculate_cumulative_difficulty(&self, parent_cumulative: u64, base_target: u64) -> u64 {
        let step = &*DIFF_ADJUST_NUMERATOR / BigUint::from(base_target.max(1));
        let step = u64::try_from(step).unwrap_or(u64::MAX);
        parent_cumulative.saturating_add(step)
    }

    pub fn calculate_random_hit(&self, generation_signature: &Hash) -> u64 {
        let mut head = [0u8; 8];
        head.copy_from_slice(&generation_signature.as_bytes()[..8]);
        u64::from_be_bytes(head)
    }

    fn target(base_target: u64, power: u64, interval: u64) -> BigUint {
        BigUint::from(base_target) * BigUint::from(power) * BigUint::from(interval)
    }

    /// Whether a miner with `power` may publish `time_interval` seconds after its parent.
    pub fn verify_hit(&self, hit: u64, base_target: u64, power: u64, time_interval: u64) -> bool {
        if power == 0 || time_interval < self.config.min_block_time {
            return false;
        }
        if time_interval >= self.config.max_block_time {
            return true;
        }
        BigUint::from(hit) < Self::target(base_target, power, time_interval)
    }

    /// Earliest interval after the parent at which `verify_hit` passes.
    pub fn calculate_mining_time_interval(&self, hit: u64, base_target: u64, power: u64) -> u64 {
        if power == 0 || base_target == 0 {
            return self.config.max_block_time;
        }
        let per_second = BigUint::from(base_target) * BigUint::from(power);
        let interval = BigUint::from(hit) / per_second + BigUint::from(1u8);
        let interval = u64::try_from(interval).unwrap_or(u64::MAX);
        interval.clamp(self.config.min_block_time, self.config.max_block_time)
    }

    /// Miner power before the block was applied, read from the block's own
    /// miner snapshot (one less when the miner also sent the transaction).
    pub fn miner_power_before(&self, container: &BlockContainer) -> Option<u64> {
        let block = container.get_block();
        let after = block.snapshot_of(block.get_miner())?;
        let sent_tx = container
            .get_tx()
            .map(|tx| tx.get_sender() == block.get_miner())
            .unwrap_or(false);
        Some(if sent_tx {
            after.nonce.saturating_sub(1)
        } else {
            after.nonce
        })
    }

    /// Genesis blocks carry fixed consensus fields.
    pub fn verify_genesis(&self, block: &Block) -> Result<(), PotViolation> {
        if block.get_base_target() != GENESIS_BASE_TARGET {
            return Err(PotViolation::BaseTarget {
                expected: GENESIS_BASE_TARGET,
                actual: block.get_base_target(),
            });
        }
        if block.get_generation_signature() != self.genesis_generation_signature(block.get_miner())
        {
            return Err(PotViolation::GenerationSignature);
        }
        if block.get_cumulative_difficulty() != 0 {
            return Err(PotViolation::CumulativeDifficulty {
                expected: 0,
                actual: block.get_cumulative_difficulty(),
            });
        }
        Ok(())
    }

    /// Full PoT check of a non-genesis block against its parent.
    pub fn verify_block(
        &self,
        container: &BlockContainer,
        parent: &Block,
        required_base_target: u64,
    ) -> Result<(), PotViolation> {
        let block = container.get_block();
        if block.get_base_target() != required_base_target {
            return Err(PotViolation::BaseTarget {
                expected: required_base_target,
                actual: block.get_base_target(),
            });
        }

        let generation_signature = self
            .calculate_generation_signature(&parent.get_generation_signature(), block.get_miner());
        if block.get_generation_signature() != generation_signature {
            return Err(PotViolation::GenerationSignature);
        }

        let cumulative = self.calculate_cumulative_difficulty(
            parent.get_cumulative_difficulty(),
            block.get_base_target(),
        );
        if block.get_cumulative_difficulty() != cumulative {
            return Err(PotViolation::CumulativeDifficulty {
                expected: cumulative,
                actual: block.get_cumulative_difficulty(),
            });
        }

        let power = self
            .miner_power_before(container)
            .ok_or(PotViolation::MissingMinerPower)?;
        let interval = block.get_timestamp() - parent.get_timestamp();
        let hit = self.calculate_random_hit(&generation_signature);
        if interval <= 0 || !self.verify_hit(hit, block.get_base_target(), power, interval as u64) {
            return Err(PotViolation::HitAboveTarget { interval });
        }
        Ok(())
    }
}

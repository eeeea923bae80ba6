use crate::consensus::pot::{PotViolation, ProofOfTransaction};
use crate::core::{Block, BlockContainer, ChainId, Hash, TxKind};
use std::collections::HashSet;
use std::fmt;

/// Why an incoming block was rejected outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    FutureTimestamp { timestamp: i64, now: i64 },
    Malformed(String),
    BadSignature,
    ProofOfTransaction(PotViolation),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::FutureTimestamp { timestamp, now } => {
                write!(f, "timestamp {timestamp} is after {now}")
            }
            Rejection::Malformed(reason) => write!(f, "malformed block: {reason}"),
            Rejection::BadSignature => write!(f, "bad block or transaction signature"),
            Rejection::ProofOfTransaction(violation) => write!(f, "PoT check failed: {violation}"),
        }
    }
}

/// Outcome of `is_valid_block`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validity {
    Valid,
    /// Parent not stored locally; fetch it and retry
    MissingParent(Hash),
    /// Base target needs the block three heights below the parent
    MissingAncestor,
    Invalid(Rejection),
}

impl Validity {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validity::Valid)
    }
}

fn malformed(reason: &str) -> Result<(), Rejection> {
    Err(Rejection::Malformed(reason.to_string()))
}

/// Checks a container needs no local data for: linkage fields, tx binding,
/// snapshot coverage.
pub fn check_intrinsic(container: &BlockContainer, chain_id: &ChainId) -> Result<(), Rejection> {
    let block = container.get_block();
    if block.get_chain_id() != chain_id {
        return malformed("block belongs to another chain");
    }
    if block.is_genesis() != block.get_previous_block_hash().is_zero() {
        return malformed("only genesis may have an empty previous hash");
    }

    match (block.get_tx_hash(), container.get_tx()) {
        (None, None) => {}
        (Some(hash), Some(tx)) => {
            if hash != tx.tx_id() {
                return malformed("tx hash does not match carried transaction");
            }
            if tx.get_chain_id() != chain_id {
                return malformed("transaction belongs to another chain");
            }
            if tx.is_genesis() != block.is_genesis() {
                return malformed("genesis transaction outside genesis block");
            }
            if tx.get_timestamp() > block.get_timestamp() {
                return malformed("transaction is newer than its block");
            }
            if let TxKind::Wiring { receiver, .. } = tx.get_kind() {
                if receiver == tx.get_sender() {
                    return malformed("transfer to self");
                }
            }
        }
        _ => return malformed("tx hash and transaction disagree"),
    }

    let touched = container.touched_accounts();
    let snapshots = block.get_account_snapshots();
    let mut seen = HashSet::new();
    for snapshot in snapshots {
        if !seen.insert(&snapshot.public_key) {
            return malformed("duplicate account snapshot");
        }
        if !touched.contains(&snapshot.public_key) {
            return malformed("snapshot of untouched account");
        }
    }
    if seen.len() != touched.len() {
        return malformed("touched account without snapshot");
    }
    Ok(())
}

pub fn check_signatures(container: &BlockContainer) -> Result<(), Rejection> {
    if !container.get_block().verify_signature() {
        return Err(Rejection::BadSignature);
    }
    match container.get_tx() {
        Some(tx) if !tx.verify_signature() => Err(Rejection::BadSignature),
        _ => Ok(()),
    }
}

/// Full validation in fixed order: timestamp, intrinsic fields, signatures,
/// parent presence, Proof-of-Transaction.
///
/// `parent` and `ancestor` are whatever the caller found in local storage;
/// their absence defers the block instead of rejecting it.
pub fn is_valid_block(
    pot: &ProofOfTransaction,
    chain_id: &ChainId,
    container: &BlockContainer,
    parent: Option<&Block>,
    ancestor: Option<&Block>,
    now: i64,
) -> Validity {
    let block = container.get_block();
    if block.get_timestamp() > now {
        return Validity::Invalid(Rejection::FutureTimestamp {
            timestamp: block.get_timestamp(),
            now,
        });
    }
    if let Err(rejection) = check_intrinsic(container, chain_id) {
        return Validity::Invalid(rejection);
    }
    if let Err(rejection) = check_signatures(container) {
        return Validity::Invalid(rejection);
    }

    if block.is_genesis() {
        return match pot.verify_genesis(block) {
            Ok(()) => Validity::Valid,
            Err(violation) => Validity::Invalid(Rejection::ProofOfTransaction(violation)),
        };
    }

    let parent = match parent {
        Some(parent) => parent,
        None => return Validity::MissingParent(block.get_previous_block_hash()),
    };
    if parent.hash() != block.get_previous_block_hash()
        || parent.get_block_num() + 1 != block.get_block_num()
    {
        return Validity::Invalid(Rejection::Malformed("parent link broken".to_string()));
    }
    if block.get_immutable_block_hash().is_zero() {
        return Validity::Invalid(Rejection::Malformed("missing immutable point".to_string()));
    }

    let required = match pot.calculate_required_base_target(parent, ancestor) {
        Some(required) => required,
        None => return Validity::MissingAncestor,
    };
    match pot.verify_block(container, parent, required) {
        Ok(()) => Validity::Valid,
        Err(violation) => Validity::Invalid(Rejection::ProofOfTransaction(violation)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::KeyPair;
    use crate::config::ConsensusConfig;
    use crate::core::{AccountSnapshot, AccountState, NewBlock, Transaction};

    const NOW: i64 = 1_700_000_000;

    fn chain() -> ChainId {
        ChainId::new(b"validation".to_vec())
    }

    fn signed_genesis(miner: &KeyPair, timestamp: i64) -> BlockContainer {
        let pot = ProofOfTransaction::new(ConsensusConfig::default());
        let mut block = Block::new_unsigned(NewBlock {
            chain_id: chain(),
            block_num: 0,
            previous_block_hash: Hash::ZERO,
            immutable_block_hash: Hash::ZERO,
            base_target: crate::consensus::GENESIS_BASE_TARGET,
            cumulative_difficulty: 0,
            generation_signature: pot.genesis_generation_signature(&miner.public_key()),
            timestamp,
            tx_hash: None,
            miner: miner.public_key(),
        });
        block.set_account_snapshots(vec![AccountSnapshot::new(
            miner.public_key(),
            AccountState::new(0, 0),
        )]);
        block.sign(miner).unwrap();
        BlockContainer::new(block, None)
    }

    #[test]
    fn test_well_formed_genesis_is_valid() {
        let pot = ProofOfTransaction::new(ConsensusConfig::default());
        let miner = KeyPair::generate().unwrap();
        let genesis = signed_genesis(&miner, NOW);
        assert_eq!(
            is_valid_block(&pot, &chain(), &genesis, None, None, NOW),
            Validity::Valid
        );
    }

    #[test]
    fn test_future_block_is_rejected_despite_valid_fields() {
        let pot = ProofOfTransaction::new(ConsensusConfig::default());
        let miner = KeyPair::generate().unwrap();
        let genesis = signed_genesis(&miner, NOW + 3_600);
        assert!(matches!(
            is_valid_block(&pot, &chain(), &genesis, None, None, NOW),
            Validity::Invalid(Rejection::FutureTimestamp { .. })
        ));
    }

    #[test]
    fn test_foreign_chain_block_is_malformed() {
        let pot = ProofOfTransaction::new(ConsensusConfig::default());
        let miner = KeyPair::generate().unwrap();
        let genesis = signed_genesis(&miner, NOW);
        let other = ChainId::new(b"other".to_vec());
        assert!(matches!(
            is_valid_block(&pot, &other, &genesis, None, None, NOW),
            Validity::Invalid(Rejection::Malformed(_))
        ));
    }

    #[test]
    fn test_unbound_transaction_is_malformed() {
        let miner = KeyPair::generate().unwrap();
        let (block, _) = signed_genesis(&miner, NOW).into_parts();
        let tx = Transaction::new_signed(
            &miner,
            chain(),
            NOW,
            1,
            1,
            TxKind::Note { memo: vec![] },
        )
        .unwrap();
        // block declares no tx hash but carries a transaction
        let container = BlockContainer::new(block, Some(tx));
        assert!(check_intrinsic(&container, &chain()).is_err());
    }

    #[test]
    fn test_tampered_signature_is_rejected() {
        let miner = KeyPair::generate().unwrap();
        let impostor = KeyPair::generate().unwrap();
        let (mut block, tx) = signed_genesis(&miner, NOW).into_parts();
        block.sign(&impostor).unwrap();
        let container = BlockContainer::new(block, tx);
        assert_eq!(check_signatures(&container), Err(Rejection::BadSignature));
    }
}

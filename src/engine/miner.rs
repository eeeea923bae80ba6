// Block production. Shared by the chain worker, chain creation and the test
// chain builders so every producer goes through the same PoT fields.

use crate::account::KeyPair;
use crate::consensus::{ProofOfTransaction, GENESIS_BASE_TARGET};
use crate::core::{
    Block, BlockContainer, ChainId, GenesisAccount, Hash, NewBlock, ProcessOutcome, StateProcessor,
    Transaction,
};
use crate::error::{ChainError, Result};
use crate::storage::Repository;

/// What a new block builds on.
pub struct BlockTemplate<'a> {
    pub parent: &'a Block,
    /// Block three heights below `parent`, when the chain is past its first blocks
    pub ancestor: Option<&'a Block>,
    pub immutable_block_hash: Hash,
    pub tx: Option<Transaction>,
    pub timestamp: i64,
}

/// Build and sign the child of `template.parent`.
///
/// Returns `None` when the transaction does not apply on top of `repo`.
pub fn build_block(
    pot: &ProofOfTransaction,
    processor: &StateProcessor,
    key_pair: &KeyPair,
    chain_id: &ChainId,
    template: BlockTemplate<'_>,
    repo: &dyn Repository,
    synced_to_genesis: bool,
) -> Result<Option<BlockContainer>> {
    let parent = template.parent;
    let miner = key_pair.public_key();
    let base_target = pot
        .calculate_required_base_target(parent, template.ancestor)
        .ok_or_else(|| ChainError::InvalidBlock("base target needs an older ancestor".to_string()))?;
    let generation_signature =
        pot.calculate_generation_signature(&parent.get_generation_signature(), &miner);

    let mut block = Block::new_unsigned(NewBlock {
        chain_id: chain_id.clone(),
        block_num: parent.get_block_num() + 1,
        previous_block_hash: parent.hash(),
        immutable_block_hash: template.immutable_block_hash,
        base_target,
        cumulative_difficulty: pot
            .calculate_cumulative_difficulty(parent.get_cumulative_difficulty(), base_target),
        generation_signature,
        timestamp: template.timestamp,
        tx_hash: template.tx.as_ref().map(|tx| tx.tx_id()),
        miner,
    });

    let draft = BlockContainer::new(block.clone(), template.tx.clone());
    match processor.preview(&draft, repo, synced_to_genesis)? {
        ProcessOutcome::Applied(snapshots) => block.set_account_snapshots(snapshots),
        _ => return Ok(None),
    }
    block.sign(key_pair)?;
    Ok(Some(BlockContainer::new(block, template.tx)))
}

/// Creator seed of a new chain id: the creator key and creation time.
pub fn chain_seed(key_pair: &KeyPair, timestamp: i64) -> Hash {
    let mut data = key_pair.public_key().as_bytes().to_vec();
    data.extend(timestamp.to_be_bytes());
    Hash::digest(&data)
}

/// Genesis block of a new chain, allocating `accounts`.
pub fn build_genesis(
    pot: &ProofOfTransaction,
    key_pair: &KeyPair,
    chain_id: &ChainId,
    accounts: Vec<GenesisAccount>,
    timestamp: i64,
) -> Result<BlockContainer> {
    let miner = key_pair.public_key();
    let tx = Transaction::new_genesis(key_pair, chain_id.clone(), timestamp, accounts)?;

    let mut block = Block::new_unsigned(NewBlock {
        chain_id: chain_id.clone(),
        block_num: 0,
        previous_block_hash: Hash::ZERO,
        immutable_block_hash: Hash::ZERO,
        base_target: GENESIS_BASE_TARGET,
        cumulative_difficulty: 0,
        generation_signature: pot.genesis_generation_signature(&miner),
        timestamp,
        tx_hash: Some(tx.tx_id()),
        miner,
    });

    let processor = StateProcessor::new(chain_id.clone());
    let draft = BlockContainer::new(block.clone(), Some(tx.clone()));
    let snapshots = match processor.preview(&draft, &NoState, true)? {
        ProcessOutcome::Applied(snapshots) => snapshots,
        other => {
            return Err(ChainError::InvalidBlock(format!(
                "genesis allocation does not apply: {other:?}"
            )))
        }
    };
    block.set_account_snapshots(snapshots);
    block.sign(key_pair)?;
    Ok(BlockContainer::new(block, Some(tx)))
}

// Empty repository a genesis block is previewed against.
struct NoState;

impl Repository for NoState {
    fn get_raw(&self, _key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn write_changes(&self, _changes: crate::storage::ChangeSet) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsensusConfig;
    use crate::consensus::{is_valid_block, Validity};
    use crate::core::AccountState;

    #[test]
    fn test_genesis_allocations_are_snapshotted() {
        let pot = ProofOfTransaction::new(ConsensusConfig::default());
        let creator = KeyPair::generate().unwrap();
        let chain_id = ChainId::derive("genesis", &chain_seed(&creator, 1_000));
        let genesis = build_genesis(
            &pot,
            &creator,
            &chain_id,
            vec![GenesisAccount {
                public_key: creator.public_key(),
                state: AccountState::new(1_000, 1),
            }],
            1_000,
        )
        .unwrap();

        assert_eq!(
            genesis.get_block().snapshot_of(&creator.public_key()),
            Some(AccountState::new(1_000, 1))
        );
        assert_eq!(
            is_valid_block(&pot, &chain_id, &genesis, None, None, 1_000),
            Validity::Valid
        );
    }
}

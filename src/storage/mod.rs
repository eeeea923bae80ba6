//! Persistent storage
//!
//! One sled database per node holds every followed chain: the account/state
//! tree behind `StateDb` and the block, transaction and height-index trees
//! behind `BlockStore`. The pending transaction pool lives in memory.

pub mod block_store;
pub mod state_db;
pub mod transaction_pool;

pub use block_store::{BlockInfo, BlockStore, ForkDiff};
pub use state_db::{ChangeSet, Repository, StateDb, Track};
pub use transaction_pool::TransactionPool;

use crate::config::ConsensusConfig;
use crate::core::{BlockContainer, ChainId, Hash};
use crate::error::{ChainError, Result};
use log::info;
use sled::transaction::ConflictableTransactionResult;
use sled::{Db, Transactional};
use std::path::Path;

const STATE_TREE: &str = "state";
const BLOCKS_TREE: &str = "blocks";
const TXS_TREE: &str = "txs";
const BLOCK_INFO_TREE: &str = "block_info";

#[derive(Clone)]
pub struct Storage {
    db: Db,
    state_db: StateDb,
    block_store: BlockStore,
}

impl Storage {
    pub fn open(path: &Path, consensus: &ConsensusConfig) -> Result<Storage> {
        let db = sled::open(path)
            .map_err(|e| ChainError::Database(format!("Failed to open database: {e}")))?;
        info!("Opened chain database at {}", path.display());
        Self::with_db(db, consensus)
    }

    /// In-memory database removed on drop, for tests and devnets.
    pub fn temporary(consensus: &ConsensusConfig) -> Result<Storage> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(db, consensus)
    }

    fn with_db(db: Db, consensus: &ConsensusConfig) -> Result<Storage> {
        let state_db = StateDb::new(db.open_tree(STATE_TREE)?);
        let block_store = BlockStore::new(
            db.open_tree(BLOCKS_TREE)?,
            db.open_tree(TXS_TREE)?,
            db.open_tree(BLOCK_INFO_TREE)?,
            consensus.warning_range(),
        );
        Ok(Storage {
            db,
            state_db,
            block_store,
        })
    }

    pub fn state_db(&self) -> &StateDb {
        &self.state_db
    }

    pub fn block_store(&self) -> &BlockStore {
        &self.block_store
    }

    /// Make a main-chain change durable in one step: the buffered account and
    /// pointer writes of a Track plus the main-chain flag flips of `undo` and
    /// `new`. Either everything lands or nothing does.
    pub fn commit_main_chain_update(
        &self,
        chain_id: &ChainId,
        changes: ChangeSet,
        undo: &[BlockContainer],
        new: &[BlockContainer],
    ) -> Result<()> {
        let flips: Vec<(u64, Hash, bool)> = undo
            .iter()
            .map(|c| (c.block_num(), c.hash(), false))
            .chain(new.iter().map(|c| (c.block_num(), c.hash(), true)))
            .collect();
        self.commit_flag_changes(chain_id, changes, &flips)
    }

    /// Atomic state changes plus arbitrary `(height, hash, is_main)` flips.
    pub fn commit_flag_changes(
        &self,
        chain_id: &ChainId,
        changes: ChangeSet,
        flips: &[(u64, Hash, bool)],
    ) -> Result<()> {
        (self.state_db.tree(), self.block_store.info_tree())
            .transaction(|(state, infos)| -> ConflictableTransactionResult<(), ChainError> {
                for (key, value) in &changes {
                    match value {
                        Some(value) => {
                            state.insert(key.as_slice(), value.as_slice())?;
                        }
                        None => {
                            state.remove(key.as_slice())?;
                        }
                    }
                }
                for (height, hash, is_main_chain) in flips {
                    BlockStore::flag_at(infos, chain_id, *height, *hash, *is_main_chain)?;
                }
                Ok(())
            })?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AccountState, Block, NewBlock, PublicKey};

    fn chain() -> ChainId {
        ChainId::new(b"facade".to_vec())
    }

    fn container(num: u64, previous: Hash, tag: u8) -> BlockContainer {
        BlockContainer::new(
            Block::new_unsigned(NewBlock {
                chain_id: chain(),
                block_num: num,
                previous_block_hash: previous,
                immutable_block_hash: Hash::ZERO,
                base_target: 1,
                cumulative_difficulty: num,
                generation_signature: Hash::digest(&[tag]),
                timestamp: 0,
                tx_hash: None,
                miner: PublicKey::new(vec![tag]),
            }),
            None,
        )
    }

    #[test]
    fn test_main_chain_update_lands_together() {
        let storage = Storage::temporary(&ConsensusConfig::default()).unwrap();
        let store = storage.block_store();
        let genesis = container(0, Hash::ZERO, 0);
        let old = container(1, genesis.hash(), 1);
        let new = container(1, genesis.hash(), 2);
        store.save_block_container(&chain(), &genesis, true).unwrap();
        store.save_block_container(&chain(), &old, true).unwrap();
        store.save_block_container(&chain(), &new, false).unwrap();

        let track = storage.state_db().start_tracking();
        track.set_best_block_hash(&chain(), &new.hash());
        track
            .set_account(&chain(), &PublicKey::new(vec![2]), &AccountState::new(9, 1))
            .unwrap();
        let changes = track.into_changes();

        storage
            .commit_main_chain_update(&chain(), changes, &[old.clone()], &[new.clone()])
            .unwrap();

        assert_eq!(
            storage.state_db().best_block_hash(&chain()).unwrap(),
            Some(new.hash())
        );
        assert!(store.is_main_chain_block(&chain(), &new.hash()).unwrap());
        assert!(!store.is_main_chain_block(&chain(), &old.hash()).unwrap());
    }
}

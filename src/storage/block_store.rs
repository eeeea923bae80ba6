// Content-addressed blocks and transactions plus the per-height candidate
// index. Every candidate at a height is kept in one list value so the
// main-chain flag can be flipped without scanning.

use crate::core::{Block, BlockContainer, ChainId, Hash, Transaction};
use crate::error::{ChainError, Result};
use crate::utils::{deserialize, serialize};
use log::debug;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionalTree};
use sled::{Transactional, Tree};

/// One candidate block at a height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct BlockInfo {
    pub hash: Hash,
    pub is_main_chain: bool,
}

/// Result of the fork-diff walk. Both lists run from the tip down to the
/// block right above the common ancestor.
#[derive(Debug, Clone)]
pub struct ForkDiff {
    pub undo: Vec<BlockContainer>,
    pub new: Vec<BlockContainer>,
    pub ancestor: Hash,
}

fn item_key(chain_id: &ChainId, hash: &Hash) -> Vec<u8> {
    format!("{}:{}", chain_id.to_hex(), hash.to_hex()).into_bytes()
}

fn height_key(chain_id: &ChainId, height: u64) -> Vec<u8> {
    let mut key = format!("{}:", chain_id.to_hex()).into_bytes();
    key.extend(height.to_be_bytes());
    key
}

fn chain_prefix(chain_id: &ChainId) -> Vec<u8> {
    format!("{}:", chain_id.to_hex()).into_bytes()
}

fn abort<T>(err: ChainError) -> ConflictableTransactionResult<T, ChainError> {
    Err(ConflictableTransactionError::Abort(err))
}

fn decode_infos(bytes: Option<sled::IVec>) -> Result<Vec<BlockInfo>> {
    match bytes {
        Some(bytes) => deserialize(&bytes),
        None => Ok(vec![]),
    }
}

/// Insert or re-flag `hash` inside the height list held by `infos`.
fn upsert_info(infos: &mut Vec<BlockInfo>, hash: Hash, is_main_chain: bool) {
    match infos.iter_mut().find(|info| info.hash == hash) {
        Some(info) => info.is_main_chain = is_main_chain,
        None => infos.push(BlockInfo {
            hash,
            is_main_chain,
        }),
    }
    if is_main_chain {
        for info in infos.iter_mut().filter(|info| info.hash != hash) {
            info.is_main_chain = false;
        }
    }
}

#[derive(Clone)]
pub struct BlockStore {
    blocks: Tree,
    txs: Tree,
    infos: Tree,
    warning_range: u64,
}

impl BlockStore {
    pub fn new(blocks: Tree, txs: Tree, infos: Tree, warning_range: u64) -> BlockStore {
        BlockStore {
            blocks,
            txs,
            infos,
            warning_range,
        }
    }

    pub(crate) fn info_tree(&self) -> &Tree {
        &self.infos
    }

    /// Persist a container and index it at its height.
    ///
    /// Saving with `is_main_chain` demotes every other candidate at that
    /// height. Non-main candidates a warning range below are pruned.
    pub fn save_block_container(
        &self,
        chain_id: &ChainId,
        container: &BlockContainer,
        is_main_chain: bool,
    ) -> Result<()> {
        let block = container.get_block();
        let hash = block.hash();
        let block_bytes = block.serialize()?;
        let tx_entry = match container.get_tx() {
            Some(tx) => Some((item_key(chain_id, &tx.tx_id()), tx.serialize()?)),
            None => None,
        };
        let info_key = height_key(chain_id, block.get_block_num());

        (&self.blocks, &self.txs, &self.infos)
            .transaction(|(blocks, txs, infos)| -> ConflictableTransactionResult<(), ChainError> {
                blocks.insert(item_key(chain_id, &hash), block_bytes.as_slice())?;
                if let Some((key, bytes)) = &tx_entry {
                    txs.insert(key.as_slice(), bytes.as_slice())?;
                }
                Self::flag_in(infos, &info_key, hash, is_main_chain)
            })?;

        let height = block.get_block_num();
        if height > self.warning_range {
            self.prune(chain_id, height - self.warning_range)?;
        }
        Ok(())
    }

    /// Set the main-chain flag of `hash` inside a sled transaction.
    pub(crate) fn flag_in(
        infos: &TransactionalTree,
        info_key: &[u8],
        hash: Hash,
        is_main_chain: bool,
    ) -> ConflictableTransactionResult<(), ChainError> {
        let mut list = match decode_infos(infos.get(info_key)?) {
            Ok(list) => list,
            Err(e) => return abort(e),
        };
        upsert_info(&mut list, hash, is_main_chain);
        match serialize(&list) {
            Ok(bytes) => {
                infos.insert(info_key, bytes)?;
                Ok(())
            }
            Err(e) => abort(e),
        }
    }

    pub(crate) fn flag_at(
        infos: &TransactionalTree,
        chain_id: &ChainId,
        height: u64,
        hash: Hash,
        is_main_chain: bool,
    ) -> ConflictableTransactionResult<(), ChainError> {
        Self::flag_in(infos, &height_key(chain_id, height), hash, is_main_chain)
    }

    fn flag_container_in(
        infos: &TransactionalTree,
        chain_id: &ChainId,
        container: &BlockContainer,
        is_main_chain: bool,
    ) -> ConflictableTransactionResult<(), ChainError> {
        Self::flag_at(infos, chain_id, container.block_num(), container.hash(), is_main_chain)
    }

    /// Drop non-main candidates at `height` together with their bodies.
    fn prune(&self, chain_id: &ChainId, height: u64) -> Result<()> {
        let key = height_key(chain_id, height);
        let infos = decode_infos(self.infos.get(&key)?)?;
        if infos.iter().all(|info| info.is_main_chain) {
            return Ok(());
        }

        let main_tx = match infos.iter().find(|info| info.is_main_chain) {
            Some(info) => self
                .get_block(chain_id, &info.hash)?
                .and_then(|block| block.get_tx_hash()),
            None => None,
        };

        let (kept, pruned): (Vec<BlockInfo>, Vec<BlockInfo>) =
            infos.into_iter().partition(|info| info.is_main_chain);
        for info in &pruned {
            if let Some(block) = self.get_block(chain_id, &info.hash)? {
                if let Some(tx_hash) = block.get_tx_hash() {
                    if Some(tx_hash) != main_tx {
                        self.txs.remove(item_key(chain_id, &tx_hash))?;
                    }
                }
            }
            self.blocks.remove(item_key(chain_id, &info.hash))?;
        }
        self.infos.insert(key, serialize(&kept)?)?;
        debug!(
            "Pruned {} fork block(s) at height {height} of chain {chain_id}",
            pruned.len()
        );
        Ok(())
    }

    pub fn get_block(&self, chain_id: &ChainId, hash: &Hash) -> Result<Option<Block>> {
        match self.blocks.get(item_key(chain_id, hash))? {
            Some(bytes) => Ok(Some(Block::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_transaction(&self, chain_id: &ChainId, tx_id: &Hash) -> Result<Option<Transaction>> {
        match self.txs.get(item_key(chain_id, tx_id))? {
            Some(bytes) => Ok(Some(Transaction::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Block plus its transaction; `None` if either is missing locally.
    pub fn get_block_container(
        &self,
        chain_id: &ChainId,
        hash: &Hash,
    ) -> Result<Option<BlockContainer>> {
        let block = match self.get_block(chain_id, hash)? {
            Some(block) => block,
            None => return Ok(None),
        };
        let tx = match block.get_tx_hash() {
            Some(tx_id) => match self.get_transaction(chain_id, &tx_id)? {
                Some(tx) => Some(tx),
                None => return Ok(None),
            },
            None => None,
        };
        Ok(Some(BlockContainer::new(block, tx)))
    }

    pub fn contains_block(&self, chain_id: &ChainId, hash: &Hash) -> Result<bool> {
        Ok(self.blocks.contains_key(item_key(chain_id, hash))?)
    }

    pub fn block_infos(&self, chain_id: &ChainId, height: u64) -> Result<Vec<BlockInfo>> {
        decode_infos(self.infos.get(height_key(chain_id, height))?)
    }

    pub fn main_chain_block_at(&self, chain_id: &ChainId, height: u64) -> Result<Option<Hash>> {
        Ok(self
            .block_infos(chain_id, height)?
            .into_iter()
            .find(|info| info.is_main_chain)
            .map(|info| info.hash))
    }

    pub fn is_main_chain_block(&self, chain_id: &ChainId, hash: &Hash) -> Result<bool> {
        let block = match self.get_block(chain_id, hash)? {
            Some(block) => block,
            None => return Ok(false),
        };
        Ok(self
            .block_infos(chain_id, block.get_block_num())?
            .iter()
            .any(|info| info.hash == *hash && info.is_main_chain))
    }

    /// Walk `fork` and `best` back to their common ancestor.
    ///
    /// The longer side is first walked down to the other's height, then both
    /// sides step in lock-step until the hashes meet. `None` means some block
    /// on the way is not stored locally.
    pub fn get_fork_block_containers_info(
        &self,
        chain_id: &ChainId,
        fork: &BlockContainer,
        best: &BlockContainer,
    ) -> Result<Option<ForkDiff>> {
        let mut undo = vec![];
        let mut new = vec![];
        let mut fork_side = fork.clone();
        let mut best_side = best.clone();

        while fork_side.block_num() > best_side.block_num() {
            let parent = fork_side.previous_hash();
            new.push(fork_side);
            fork_side = match self.get_block_container(chain_id, &parent)? {
                Some(container) => container,
                None => return Ok(None),
            };
        }
        while best_side.block_num() > fork_side.block_num() {
            let parent = best_side.previous_hash();
            undo.push(best_side);
            best_side = match self.get_block_container(chain_id, &parent)? {
                Some(container) => container,
                None => return Ok(None),
            };
        }

        while fork_side.hash() != best_side.hash() {
            if fork_side.get_block().is_genesis() {
                // different genesis blocks never meet
                return Ok(None);
            }
            let fork_parent = fork_side.previous_hash();
            let best_parent = best_side.previous_hash();
            new.push(fork_side);
            undo.push(best_side);
            fork_side = match self.get_block_container(chain_id, &fork_parent)? {
                Some(container) => container,
                None => return Ok(None),
            };
            best_side = match self.get_block_container(chain_id, &best_parent)? {
                Some(container) => container,
                None => return Ok(None),
            };
        }

        Ok(Some(ForkDiff {
            undo,
            new,
            ancestor: fork_side.hash(),
        }))
    }

    /// Flip `undo` to side-chain and `new` to main-chain in one transaction.
    pub fn re_branch_blocks(
        &self,
        chain_id: &ChainId,
        undo: &[BlockContainer],
        new: &[BlockContainer],
    ) -> Result<()> {
        self.infos
            .transaction(|infos| -> ConflictableTransactionResult<(), ChainError> {
                for container in undo {
                    Self::flag_container_in(infos, chain_id, container, false)?;
                }
                for container in new {
                    Self::flag_container_in(infos, chain_id, container, true)?;
                }
                Ok(())
            })?;
        Ok(())
    }

    /// `(height, hash)` of every main-chain entry from `from` up to `to`.
    pub fn main_chain_entries(&self, chain_id: &ChainId, from: u64, to: u64) -> Result<Vec<(u64, Hash)>> {
        let mut entries = vec![];
        for item in self
            .infos
            .range(height_key(chain_id, from)..=height_key(chain_id, to))
        {
            let (key, value) = item?;
            let mut height = [0u8; 8];
            height.copy_from_slice(&key[key.len() - 8..]);
            let infos: Vec<BlockInfo> = deserialize(&value)?;
            if let Some(main) = infos.iter().find(|info| info.is_main_chain) {
                entries.push((u64::from_be_bytes(height), main.hash));
            }
        }
        Ok(entries)
    }

    /// Remove every block, transaction and index entry of `chain_id`.
    pub fn remove_chain(&self, chain_id: &ChainId) -> Result<()> {
        let prefix = chain_prefix(chain_id);
        for tree in [&self.blocks, &self.txs, &self.infos] {
            let mut batch = sled::Batch::default();
            for item in tree.scan_prefix(&prefix) {
                let (key, _) = item?;
                batch.remove(key);
            }
            tree.apply_batch(batch)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{NewBlock, PublicKey};

    fn store(warning_range: u64) -> BlockStore {
        let db = sled::Config::new().temporary(true).open().unwrap();
        BlockStore::new(
            db.open_tree("blocks").unwrap(),
            db.open_tree("txs").unwrap(),
            db.open_tree("block_info").unwrap(),
            warning_range,
        )
    }

    fn chain() -> ChainId {
        ChainId::new(b"store".to_vec())
    }

    fn block(num: u64, previous: Hash, tag: u8) -> BlockContainer {
        BlockContainer::new(
            Block::new_unsigned(NewBlock {
                chain_id: chain(),
                block_num: num,
                previous_block_hash: previous,
                immutable_block_hash: Hash::ZERO,
                base_target: 1,
                cumulative_difficulty: num,
                generation_signature: Hash::digest(&[tag]),
                timestamp: num as i64,
                tx_hash: None,
                miner: PublicKey::new(vec![tag]),
            }),
            None,
        )
    }

    /// Extend `from` by `len` blocks tagged `tag`, saving each with `is_main`.
    fn extend(
        store: &BlockStore,
        from: &BlockContainer,
        len: u64,
        tag: u8,
        is_main: bool,
    ) -> Vec<BlockContainer> {
        let mut out = vec![];
        let mut tip = from.clone();
        for _ in 0..len {
            let next = block(tip.block_num() + 1, tip.hash(), tag);
            store.save_block_container(&chain(), &next, is_main).unwrap();
            out.push(next.clone());
            tip = next;
        }
        out
    }

    #[test]
    fn test_only_one_main_entry_per_height() {
        let store = store(100);
        let genesis = block(0, Hash::ZERO, 0);
        store.save_block_container(&chain(), &genesis, true).unwrap();
        let b1 = block(1, genesis.hash(), 1);
        let b1_prime = block(1, genesis.hash(), 2);

        store.save_block_container(&chain(), &b1, true).unwrap();
        store.save_block_container(&chain(), &b1_prime, true).unwrap();
        // saving again overwrites by hash
        store.save_block_container(&chain(), &b1_prime, true).unwrap();

        let infos = store.block_infos(&chain(), 1).unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos.iter().filter(|i| i.is_main_chain).count(), 1);
        assert!(store.is_main_chain_block(&chain(), &b1_prime.hash()).unwrap());
        assert!(!store.is_main_chain_block(&chain(), &b1.hash()).unwrap());
    }

    #[test]
    fn test_fork_diff_meets_at_common_ancestor() {
        let store = store(100);
        let genesis = block(0, Hash::ZERO, 0);
        store.save_block_container(&chain(), &genesis, true).unwrap();
        let shared = extend(&store, &genesis, 2, 1, true);
        let ancestor = shared.last().unwrap().clone();

        let best = extend(&store, &ancestor, 3, 2, true);
        let fork = extend(&store, &ancestor, 5, 3, false);

        let diff = store
            .get_fork_block_containers_info(&chain(), fork.last().unwrap(), best.last().unwrap())
            .unwrap()
            .unwrap();

        assert_eq!(diff.ancestor, ancestor.hash());
        assert_eq!(diff.undo.len(), 3);
        assert_eq!(diff.new.len(), 5);
        assert_eq!(diff.undo.last().unwrap().previous_hash(), ancestor.hash());
        assert_eq!(diff.new.last().unwrap().previous_hash(), ancestor.hash());
        assert_eq!(diff.new[0].hash(), fork.last().unwrap().hash());
    }

    #[test]
    fn test_fork_diff_reports_missing_history() {
        let store = store(100);
        let genesis = block(0, Hash::ZERO, 0);
        store.save_block_container(&chain(), &genesis, true).unwrap();
        let best = extend(&store, &genesis, 2, 1, true);

        // the fork's parent was never stored
        let orphan = block(3, Hash::digest(b"unknown"), 9);
        let diff = store
            .get_fork_block_containers_info(&chain(), &orphan, best.last().unwrap())
            .unwrap();
        assert!(diff.is_none());
    }

    #[test]
    fn test_re_branch_flips_flags() {
        let store = store(100);
        let genesis = block(0, Hash::ZERO, 0);
        store.save_block_container(&chain(), &genesis, true).unwrap();
        let best = extend(&store, &genesis, 2, 1, true);
        let fork = extend(&store, &genesis, 2, 2, false);

        store.re_branch_blocks(&chain(), &best, &fork).unwrap();

        for height in 1..=2 {
            let main = store.main_chain_block_at(&chain(), height).unwrap();
            assert_eq!(main, Some(fork[height as usize - 1].hash()));
        }
        assert!(!store.is_main_chain_block(&chain(), &best[0].hash()).unwrap());
    }

    #[test]
    fn test_side_blocks_pruned_past_warning_range() {
        let store = store(3);
        let genesis = block(0, Hash::ZERO, 0);
        store.save_block_container(&chain(), &genesis, true).unwrap();
        let side = block(1, genesis.hash(), 7);
        store.save_block_container(&chain(), &side, false).unwrap();

        extend(&store, &genesis, 4, 1, true);

        assert!(store.get_block(&chain(), &side.hash()).unwrap().is_none());
        let infos = store.block_infos(&chain(), 1).unwrap();
        assert_eq!(infos.len(), 1);
        assert!(infos[0].is_main_chain);
    }

    #[test]
    fn test_main_chain_entries_and_remove_chain() {
        let store = store(100);
        let genesis = block(0, Hash::ZERO, 0);
        store.save_block_container(&chain(), &genesis, true).unwrap();
        let main = extend(&store, &genesis, 3, 1, true);
        extend(&store, &genesis, 2, 2, false);

        let entries = store.main_chain_entries(&chain(), 1, 3).unwrap();
        assert_eq!(
            entries,
            main.iter().map(|c| (c.block_num(), c.hash())).collect::<Vec<_>>()
        );

        store.remove_chain(&chain()).unwrap();
        assert!(store.get_block(&chain(), &genesis.hash()).unwrap().is_none());
        assert!(store.block_infos(&chain(), 0).unwrap().is_empty());
    }
}

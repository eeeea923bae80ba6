// Everything one chain's worker owns. Only that worker touches it; other
// threads reach it through `ChainCommand`s.

use crate::config::ConsensusConfig;
use crate::consensus::VotingPool;
use crate::core::{Block, BlockContainer, ChainId, Hash};
use crate::network::PeerManager;
use crate::storage::TransactionPool;
use std::collections::{HashMap, HashSet};

// remembered rejections before the set is reset
const MAX_REJECTED: usize = 10_000;

// retry periods a block may wait for its transaction
const PARTIAL_BLOCK_RETRIES: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No best block, or the best block is older than the warning range
    Empty,
    /// Has a best block, backward sync has not reached genesis
    Syncing,
    Steady,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VotingRound {
    pub started_at: i64,
    /// Fork tip that triggered the vote
    pub trigger: Hash,
}

pub struct ChainState {
    pub chain_id: ChainId,
    pub best: Option<BlockContainer>,
    /// Lowest block applied by backward sync
    pub sync_block: Option<BlockContainer>,
    pub peers: PeerManager,
    pub tx_pool: TransactionPool,
    pub voting_pool: VotingPool,
    pub voting: Option<VotingRound>,
    /// Received containers waiting to be processed, by block hash
    pub block_buffer: HashMap<Hash, BlockContainer>,
    pub buffer_capacity: usize,
    /// Blocks waiting for their transaction, by tx id, with arrival time
    pub partial_blocks: HashMap<Hash, (Block, i64)>,
    pub rejected: HashSet<Hash>,
    /// Outstanding immutable requests and when they were issued
    pub requested: HashMap<Hash, i64>,
    /// Fork candidates waiting on missing data, and since when
    pub deferred: HashMap<Hash, i64>,
    /// Hashes peers asked for on their request channels
    pub remote_block_requests: HashSet<Hash>,
    pub remote_tx_requests: HashSet<Hash>,
    /// Items we failed to fetch, to be announced on our request channels
    pub wanted_block: Option<Hash>,
    pub wanted_tx: Option<Hash>,
    pub last_tip_published: Option<(Hash, i64)>,
    pub last_tx_published: Option<Hash>,
    mutable_seq: i64,
}

impl ChainState {
    pub fn new(
        chain_id: ChainId,
        peers: PeerManager,
        tx_pool: TransactionPool,
        buffer_capacity: usize,
    ) -> ChainState {
        ChainState {
            chain_id,
            best: None,
            sync_block: None,
            peers,
            tx_pool,
            voting_pool: VotingPool::new(),
            voting: None,
            block_buffer: HashMap::new(),
            buffer_capacity: buffer_capacity.max(1),
            partial_blocks: HashMap::new(),
            rejected: HashSet::new(),
            requested: HashMap::new(),
            deferred: HashMap::new(),
            remote_block_requests: HashSet::new(),
            remote_tx_requests: HashSet::new(),
            wanted_block: None,
            wanted_tx: None,
            last_tip_published: None,
            last_tx_published: None,
            mutable_seq: 0,
        }
    }

    /// Best block older than `warning_range` block intervals.
    pub fn is_stale(&self, now: i64, config: &ConsensusConfig) -> bool {
        let horizon = config.warning_range().saturating_mul(config.max_block_time) as i64;
        match &self.best {
            Some(best) => now.saturating_sub(best.timestamp()) > horizon,
            None => true,
        }
    }

    pub fn phase(&self, now: i64, config: &ConsensusConfig) -> Phase {
        if self.best.is_none() || self.is_stale(now, config) {
            Phase::Empty
        } else if self.synced_to_genesis() {
            Phase::Steady
        } else {
            Phase::Syncing
        }
    }

    pub fn synced_to_genesis(&self) -> bool {
        self.sync_block
            .as_ref()
            .map(|block| block.block_num() == 0)
            .unwrap_or(false)
    }

    pub fn best_cumulative_difficulty(&self) -> u64 {
        self.best
            .as_ref()
            .map(|best| best.cumulative_difficulty())
            .unwrap_or(0)
    }

    pub fn is_voting(&self) -> bool {
        self.voting.is_some()
    }

    /// Buffer a container, evicting the weakest one when full.
    pub fn buffer_container(&mut self, container: BlockContainer) -> bool {
        let hash = container.hash();
        if self.rejected.contains(&hash) || self.block_buffer.contains_key(&hash) {
            return false;
        }
        if self.block_buffer.len() >= self.buffer_capacity {
            let weakest = self
                .block_buffer
                .iter()
                .min_by_key(|(_, buffered)| buffered.cumulative_difficulty())
                .map(|(hash, buffered)| (*hash, buffered.cumulative_difficulty()));
            match weakest {
                Some((weakest, difficulty)) if difficulty < container.cumulative_difficulty() => {
                    self.block_buffer.remove(&weakest);
                }
                _ => return false,
            }
        }
        self.block_buffer.insert(hash, container);
        true
    }

    pub fn reject(&mut self, hash: Hash) {
        if self.rejected.len() >= MAX_REJECTED {
            self.rejected.clear();
        }
        self.block_buffer.remove(&hash);
        self.deferred.remove(&hash);
        self.rejected.insert(hash);
    }

    /// Note that a fork candidate is waiting on data; returns how long it
    /// has been waiting.
    pub fn defer(&mut self, hash: Hash, now: i64) -> i64 {
        let since = *self.deferred.entry(hash).or_insert(now);
        now - since
    }

    /// Park a block until its transaction arrives. The oldest entry makes
    /// room once the buffer capacity is reached.
    pub fn park_partial_block(&mut self, tx_hash: Hash, block: Block, now: i64) {
        let full = self.partial_blocks.len() >= self.buffer_capacity;
        if full && !self.partial_blocks.contains_key(&tx_hash) {
            let oldest = self
                .partial_blocks
                .iter()
                .min_by_key(|(_, (_, received))| *received)
                .map(|(hash, _)| *hash);
            if let Some(oldest) = oldest {
                self.partial_blocks.remove(&oldest);
            }
        }
        self.partial_blocks.insert(tx_hash, (block, now));
    }

    /// Forget requests nobody answered within `retry_secs` and blocks whose
    /// transaction never showed up.
    pub fn expire_requests(&mut self, now: i64, retry_secs: i64) {
        self.requested.retain(|_, issued| now - *issued < retry_secs);
        let patience = retry_secs.saturating_mul(PARTIAL_BLOCK_RETRIES);
        self.partial_blocks
            .retain(|_, (_, received)| now - *received < patience);
        let buffer = &self.block_buffer;
        self.deferred.retain(|hash, _| buffer.contains_key(hash));
    }

    /// Drop buffered containers except the parent chain of `tip`.
    pub fn retain_ancestors_of(&mut self, tip: &BlockContainer) {
        let mut keep = HashSet::new();
        let mut cursor = tip.previous_hash();
        while let Some(parent) = self.block_buffer.get(&cursor) {
            if !keep.insert(cursor) {
                break;
            }
            cursor = parent.previous_hash();
        }
        self.block_buffer.retain(|hash, _| keep.contains(hash));
    }

    /// Whether a request for `hash` should go out now; records it if so.
    pub fn should_request(&mut self, hash: Hash, now: i64, retry_secs: i64) -> bool {
        match self.requested.get(&hash) {
            Some(issued) if now - issued < retry_secs => false,
            _ => {
                self.requested.insert(hash, now);
                true
            }
        }
    }

    /// Strictly increasing sequence number for our mutable items.
    pub fn next_seq(&mut self, now: i64) -> i64 {
        self.mutable_seq = now.max(self.mutable_seq + 1);
        self.mutable_seq
    }

    /// Reset request and voting state. The receive buffer is left alone.
    pub fn clear_transient(&mut self) {
        self.partial_blocks.clear();
        self.requested.clear();
        self.deferred.clear();
        self.voting = None;
        self.voting_pool.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::core::{NewBlock, PublicKey};

    fn state(capacity: usize) -> ChainState {
        let chain_id = ChainId::new(b"state".to_vec());
        ChainState::new(
            chain_id.clone(),
            PeerManager::with_seed(PublicKey::new(vec![0]), &EngineConfig::default(), 1),
            TransactionPool::new(chain_id, 8),
            capacity,
        )
    }

    fn container(difficulty: u64, timestamp: i64) -> BlockContainer {
        BlockContainer::new(
            Block::new_unsigned(NewBlock {
                chain_id: ChainId::new(b"state".to_vec()),
                block_num: 1,
                previous_block_hash: Hash::digest(b"genesis"),
                immutable_block_hash: Hash::digest(b"genesis"),
                base_target: 1,
                cumulative_difficulty: difficulty,
                generation_signature: Hash::ZERO,
                timestamp,
                tx_hash: None,
                miner: PublicKey::new(vec![1]),
            }),
            None,
        )
    }

    #[test]
    fn test_phase_follows_best_and_sync_pointers() {
        let config = ConsensusConfig::default();
        let mut state = state(4);
        assert_eq!(state.phase(1_000, &config), Phase::Empty);

        state.best = Some(container(5, 1_000));
        state.sync_block = state.best.clone();
        assert_eq!(state.phase(1_000, &config), Phase::Syncing);

        let horizon = (config.warning_range() * config.max_block_time) as i64;
        assert_eq!(state.phase(1_000 + horizon + 1, &config), Phase::Empty);
    }

    #[test]
    fn test_buffer_evicts_weakest_and_skips_rejected() {
        let mut state = state(2);
        let weak = container(1, 10);
        let mid = container(2, 10);
        let strong = container(3, 10);

        assert!(state.buffer_container(weak.clone()));
        assert!(state.buffer_container(mid.clone()));
        assert!(state.buffer_container(strong.clone()));
        assert!(!state.block_buffer.contains_key(&weak.hash()));

        state.reject(mid.hash());
        assert!(!state.buffer_container(mid));
    }

    #[test]
    fn test_requests_are_throttled() {
        let mut state = state(2);
        let hash = Hash::digest(b"wanted");
        assert!(state.should_request(hash, 100, 10));
        assert!(!state.should_request(hash, 105, 10));
        assert!(state.should_request(hash, 110, 10));
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let mut state = state(2);
        let first = state.next_seq(50);
        assert!(state.next_seq(50) > first);
        assert!(state.next_seq(10) > first);
    }

    #[test]
    fn test_stale_requests_and_partial_blocks_expire() {
        let mut state = state(4);
        let old = Hash::digest(b"old");
        let recent = Hash::digest(b"recent");
        assert!(state.should_request(old, 100, 10));
        assert!(state.should_request(recent, 108, 10));
        state.park_partial_block(old, container(1, 10).get_block().clone(), 100);
        state.park_partial_block(recent, container(2, 10).get_block().clone(), 125);

        state.expire_requests(111, 10);
        assert!(!state.requested.contains_key(&old));
        assert!(state.requested.contains_key(&recent));

        state.expire_requests(131, 10);
        assert!(!state.partial_blocks.contains_key(&old));
        assert!(state.partial_blocks.contains_key(&recent));
    }

    #[test]
    fn test_partial_blocks_are_capped() {
        let mut state = state(2);
        for (tag, received) in [(b"a", 1), (b"b", 2), (b"c", 3)] {
            state.park_partial_block(Hash::digest(tag), container(1, 10).get_block().clone(), received);
        }
        assert_eq!(state.partial_blocks.len(), 2);
        assert!(!state.partial_blocks.contains_key(&Hash::digest(b"a")));
    }

    #[test]
    fn test_deferral_age_and_ancestor_retention() {
        let mut state = state(8);
        let parent = container(1, 10);
        let child = BlockContainer::new(
            Block::new_unsigned(NewBlock {
                chain_id: ChainId::new(b"state".to_vec()),
                block_num: 2,
                previous_block_hash: parent.hash(),
                immutable_block_hash: Hash::digest(b"genesis"),
                base_target: 1,
                cumulative_difficulty: 2,
                generation_signature: Hash::ZERO,
                timestamp: 11,
                tx_hash: None,
                miner: PublicKey::new(vec![1]),
            }),
            None,
        );
        let unrelated = container(7, 12);
        state.buffer_container(parent.clone());
        state.buffer_container(unrelated.clone());

        assert_eq!(state.defer(unrelated.hash(), 50), 0);
        assert_eq!(state.defer(unrelated.hash(), 80), 30);

        state.retain_ancestors_of(&child);
        assert!(state.block_buffer.contains_key(&parent.hash()));
        assert!(!state.block_buffer.contains_key(&unrelated.hash()));

        state.expire_requests(90, 10);
        assert!(state.deferred.is_empty());
    }
}

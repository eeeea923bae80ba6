use crate::core::{BlockContainer, Hash};
use std::collections::HashMap;

/// Vote tally on candidate immutable points for one chain.
#[derive(Debug, Default)]
pub struct VotingPool {
    votes: HashMap<Hash, u64>,
    // best observed tip per voted immutable point
    tips: HashMap<Hash, BlockContainer>,
    vote_count: usize,
}

impl VotingPool {
    pub fn new() -> VotingPool {
        VotingPool::default()
    }

    pub fn add_vote(&mut self, block_hash: Hash, weight: u64) {
        let total = self.votes.entry(block_hash).or_insert(0);
        *total = total.saturating_add(weight);
        self.vote_count += 1;
    }

    /// Count `tip` as one vote for its immutable point.
    pub fn add_tip_vote(&mut self, tip: BlockContainer, weight: u64) {
        let immutable = tip.get_block().get_immutable_block_hash();
        self.add_vote(immutable, weight);
        let replace = self
            .tips
            .get(&immutable)
            .map(|known| tip.cumulative_difficulty() > known.cumulative_difficulty())
            .unwrap_or(true);
        if replace {
            self.tips.insert(immutable, tip);
        }
    }

    /// Highest-weight candidate; ties go to the lower hash.
    pub fn best_vote(&self) -> Option<(Hash, u64)> {
        self.votes
            .iter()
            .max_by(|(hash_a, weight_a), (hash_b, weight_b)| {
                weight_a.cmp(weight_b).then_with(|| hash_b.cmp(hash_a))
            })
            .map(|(hash, weight)| (*hash, *weight))
    }

    pub fn best_tip_for(&self, block_hash: &Hash) -> Option<&BlockContainer> {
        self.tips.get(block_hash)
    }

    pub fn weight_of(&self, block_hash: &Hash) -> u64 {
        self.votes.get(block_hash).copied().unwrap_or(0)
    }

    pub fn vote_count(&self) -> usize {
        self.vote_count
    }

    pub fn is_empty(&self) -> bool {
        self.vote_count == 0
    }

    pub fn clear(&mut self) {
        self.votes.clear();
        self.tips.clear();
        self.vote_count = 0;
    }
}

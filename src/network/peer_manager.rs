use crate::config::EngineConfig;
use crate::core::{BlockContainer, PublicKey};
use log::trace;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Peers known for one chain.
///
/// - Priority peers: miners of the blocks inside the mutable range of the best block
/// - General peers: everyone else seen on the chain
///
/// Both sets are bounded; a full set evicts a random member.
pub struct PeerManager {
    own_key: PublicKey,
    priority: Vec<PublicKey>,
    general: Vec<PublicKey>,
    max_priority: usize,
    max_general: usize,
    priority_ratio: f64,
    rng: StdRng,
}

impl PeerManager {
    pub fn new(own_key: PublicKey, config: &EngineConfig) -> PeerManager {
        Self::with_rng(own_key, config, StdRng::from_entropy())
    }

    /// Deterministic peer selection, for tests.
    pub fn with_seed(own_key: PublicKey, config: &EngineConfig, seed: u64) -> PeerManager {
        Self::with_rng(own_key, config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(own_key: PublicKey, config: &EngineConfig, rng: StdRng) -> PeerManager {
        PeerManager {
            own_key,
            priority: vec![],
            general: vec![],
            max_priority: config.max_priority_peers.max(1),
            max_general: config.max_general_peers.max(1),
            priority_ratio: config.priority_peer_ratio.clamp(0.0, 1.0),
            rng,
        }
    }

    fn insert_bounded(set: &mut Vec<PublicKey>, max: usize, peer: PublicKey, rng: &mut StdRng) {
        if set.len() >= max {
            let victim = rng.gen_range(0..set.len());
            set.swap_remove(victim);
        }
        set.push(peer);
    }

    /// Add a general peer. Returns false for ourselves and known peers.
    pub fn add_peer(&mut self, peer: PublicKey) -> bool {
        if peer == self.own_key || self.contains(&peer) {
            return false;
        }
        trace!("New peer {peer:?}");
        Self::insert_bounded(&mut self.general, self.max_general, peer, &mut self.rng);
        true
    }

    /// Learn the miner and transaction parties of a container.
    pub fn add_peers_from(&mut self, container: &BlockContainer) -> Vec<PublicKey> {
        container
            .touched_accounts()
            .into_iter()
            .filter(|peer| self.add_peer(peer.clone()))
            .collect()
    }

    /// Replace the priority set with the miners of the mutable range.
    /// Demoted priority peers stay known as general peers.
    pub fn refresh_priority(&mut self, miners: Vec<PublicKey>) {
        let previous = std::mem::take(&mut self.priority);
        for miner in miners {
            if miner == self.own_key || self.priority.contains(&miner) {
                continue;
            }
            self.general.retain(|peer| peer != &miner);
            Self::insert_bounded(&mut self.priority, self.max_priority, miner, &mut self.rng);
        }
        for peer in previous {
            if !self.priority.contains(&peer) && !self.general.contains(&peer) {
                Self::insert_bounded(&mut self.general, self.max_general, peer, &mut self.rng);
            }
        }
    }

    /// A random peer, drawn from the priority set with `priority_ratio`
    /// probability when both sets are populated.
    pub fn random_peer(&mut self) -> Option<PublicKey> {
        let use_priority = match (self.priority.is_empty(), self.general.is_empty()) {
            (true, true) => return None,
            (false, true) => true,
            (true, false) => false,
            (false, false) => self.rng.gen_bool(self.priority_ratio),
        };
        let set = if use_priority {
            &self.priority
        } else {
            &self.general
        };
        let index = self.rng.gen_range(0..set.len());
        Some(set[index].clone())
    }

    /// Up to `count` random peers, without repeats.
    pub fn random_peers(&mut self, count: usize) -> Vec<PublicKey> {
        let mut picked: Vec<PublicKey> = vec![];
        let attempts = count * 3;
        for _ in 0..attempts {
            if picked.len() >= count.min(self.peer_count()) {
                break;
            }
            if let Some(peer) = self.random_peer() {
                if !picked.contains(&peer) {
                    picked.push(peer);
                }
            }
        }
        picked
    }

    /// `log2(peers) + 1`: how many peers one gossip or vote round contacts.
    pub fn fan_out(&self) -> usize {
        let count = self.peer_count().max(1);
        (usize::BITS - count.leading_zeros()) as usize
    }

    pub fn contains(&self, peer: &PublicKey) -> bool {
        self.priority.contains(peer) || self.general.contains(peer)
    }

    pub fn peer_count(&self) -> usize {
        self.priority.len() + self.general.len()
    }

    pub fn priority_peers(&self) -> &[PublicKey] {
        &self.priority
    }

    pub fn general_peers(&self) -> &[PublicKey] {
        &self.general
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> PublicKey {
        PublicKey::new(vec![byte; 4])
    }

    fn manager(max_general: usize) -> PeerManager {
        let config = EngineConfig {
            max_priority_peers: 2,
            max_general_peers: max_general,
            ..EngineConfig::default()
        };
        PeerManager::with_seed(key(0), &config, 7)
    }

    #[test]
    fn test_self_and_duplicates_are_ignored() {
        let mut peers = manager(8);
        assert!(!peers.add_peer(key(0)));
        assert!(peers.add_peer(key(1)));
        assert!(!peers.add_peer(key(1)));
        assert_eq!(peers.peer_count(), 1);
    }

    #[test]
    fn test_general_set_is_bounded() {
        let mut peers = manager(3);
        for byte in 1..=10 {
            peers.add_peer(key(byte));
        }
        assert_eq!(peers.general_peers().len(), 3);
        assert!(peers.general_peers().contains(&key(10)));
    }

    #[test]
    fn test_refresh_priority_moves_miners() {
        let mut peers = manager(8);
        peers.add_peer(key(1));
        peers.add_peer(key(2));
        peers.refresh_priority(vec![key(2), key(0), key(3)]);

        assert_eq!(peers.priority_peers(), &[key(2), key(3)]);
        assert_eq!(peers.general_peers(), &[key(1)]);

        // key 2 drops out of the mutable range
        peers.refresh_priority(vec![key(3)]);
        assert!(peers.general_peers().contains(&key(2)));
        assert_eq!(peers.peer_count(), 3);
    }

    #[test]
    fn test_random_peers_are_distinct() {
        let mut peers = manager(8);
        assert_eq!(peers.random_peer(), None);
        for byte in 1..=5 {
            peers.add_peer(key(byte));
        }
        let picked = peers.random_peers(3);
        assert!(picked.len() <= 3 && !picked.is_empty());
        let unique: std::collections::HashSet<_> = picked.iter().collect();
        assert_eq!(unique.len(), picked.len());
    }

    #[test]
    fn test_fan_out_grows_logarithmically() {
        let mut peers = manager(64);
        assert_eq!(peers.fan_out(), 1);
        for byte in 1..=8 {
            peers.add_peer(key(byte));
        }
        assert_eq!(peers.fan_out(), 4);
    }
}

//! Test utilities for chain fixtures

use crate::account::KeyPair;
use crate::config::{Config, ConsensusConfig};
use crate::consensus::{ProofOfTransaction, ADJUSTMENT_WINDOW};
use crate::core::{
    AccountState, Block, BlockContainer, ChainId, GenesisAccount, Hash, PublicKey,
    StateProcessor, Transaction, TxKind,
};
use crate::engine::{build_block, build_genesis, install_genesis, BlockTemplate, ChainWorker};
use crate::network::{DhtTransport, MemoryDht, PeerManager};
use crate::storage::{Repository, Storage};
use std::sync::Arc;

pub const GENESIS_TIME: i64 = 1_700_000_000;

/// Short ranges so forks, votes and pruning show up within a few blocks.
pub fn test_consensus() -> ConsensusConfig {
    ConsensusConfig {
        mutable_range: 4,
        warning_range_factor: 3,
        attack_depth: 3,
        block_time: 10,
        min_block_time: 1,
        max_block_time: 20,
        vote_quorum: 3,
    }
}

pub fn test_config() -> Config {
    Config {
        consensus: test_consensus(),
        ..Config::default()
    }
}

/// One node's copy of a test chain.
pub struct TestChain {
    pub chain_id: ChainId,
    pub genesis: BlockContainer,
    pub storage: Storage,
    pub pot: ProofOfTransaction,
}

impl TestChain {
    /// Balance allocated to the genesis creator.
    pub const FUNDS: u64 = 1_000_000;

    /// New chain created by `creator` (funded, power 1) plus `extra` allocations.
    pub fn new(config: &Config, creator: &KeyPair, extra: &[(PublicKey, AccountState)]) -> TestChain {
        let mut accounts = vec![GenesisAccount {
            public_key: creator.public_key(),
            state: AccountState::new(Self::FUNDS, 1),
        }];
        accounts.extend(extra.iter().map(|(public_key, state)| GenesisAccount {
            public_key: public_key.clone(),
            state: *state,
        }));
        let chain_id = ChainId::new(b"test-chain".to_vec());
        let pot = ProofOfTransaction::new(config.consensus.clone());
        let genesis = build_genesis(&pot, creator, &chain_id, accounts, GENESIS_TIME).unwrap();
        let chain = TestChain {
            storage: Storage::temporary(&config.consensus).unwrap(),
            chain_id,
            genesis,
            pot,
        };
        install_genesis(&chain.storage, &chain.chain_id, &chain.genesis).unwrap();
        chain
    }

    /// Another node that starts from the same genesis.
    pub fn replica(&self, config: &Config) -> TestChain {
        let replica = self.fresh_node(config);
        install_genesis(&replica.storage, &replica.chain_id, &replica.genesis).unwrap();
        replica
    }

    /// Another node that knows the chain id but has stored nothing.
    pub fn fresh_node(&self, config: &Config) -> TestChain {
        TestChain {
            chain_id: self.chain_id.clone(),
            genesis: self.genesis.clone(),
            storage: Storage::temporary(&config.consensus).unwrap(),
            pot: ProofOfTransaction::new(config.consensus.clone()),
        }
    }

    pub fn best(&self) -> BlockContainer {
        let hash = self
            .storage
            .state_db()
            .best_block_hash(&self.chain_id)
            .unwrap()
            .unwrap();
        self.storage
            .block_store()
            .get_block_container(&self.chain_id, &hash)
            .unwrap()
            .unwrap()
    }

    fn block(&self, hash: &Hash) -> Block {
        self.storage
            .block_store()
            .get_block(&self.chain_id, hash)
            .unwrap()
            .unwrap()
    }

    pub fn account(&self, public_key: &PublicKey) -> Option<AccountState> {
        self.storage
            .state_db()
            .account(&self.chain_id, public_key)
            .unwrap()
    }

    pub fn balance(&self, public_key: &PublicKey) -> u64 {
        self.account(public_key).map(|a| a.balance).unwrap_or(0)
    }

    pub fn transfer(
        &self,
        sender: &KeyPair,
        receiver: &PublicKey,
        amount: u64,
        fee: u64,
        nonce: u64,
    ) -> Transaction {
        Transaction::new_signed(
            sender,
            self.chain_id.clone(),
            GENESIS_TIME,
            fee,
            nonce,
            TxKind::Wiring {
                receiver: receiver.clone(),
                amount,
            },
        )
        .unwrap()
    }

    pub fn note(&self, sender: &KeyPair, fee: u64, nonce: u64) -> Transaction {
        Transaction::new_signed(
            sender,
            self.chain_id.clone(),
            GENESIS_TIME,
            fee,
            nonce,
            TxKind::Note {
                memo: b"note".to_vec(),
            },
        )
        .unwrap()
    }

    /// Mine on top of this node's best block at the earliest instant the
    /// miner's PoT allows, and make the block this node's best.
    pub fn mine(&self, miner: &KeyPair, tx: Option<Transaction>) -> BlockContainer {
        self.mine_claiming(miner, tx, None)
    }

    /// Like `mine`, but the block names `immutable_block_hash` as its
    /// immutable point when one is given.
    pub fn mine_claiming(
        &self,
        miner: &KeyPair,
        tx: Option<Transaction>,
        immutable_block_hash: Option<Hash>,
    ) -> BlockContainer {
        let parent = self.best().get_block().clone();
        let ancestor = if parent.get_block_num() > ADJUSTMENT_WINDOW {
            let mut cursor = parent.clone();
            for _ in 0..ADJUSTMENT_WINDOW {
                cursor = self.block(&cursor.get_previous_block_hash());
            }
            Some(cursor)
        } else {
            None
        };
        let base_target = self
            .pot
            .calculate_required_base_target(&parent, ancestor.as_ref())
            .unwrap();
        let power = self.account(&miner.public_key()).unwrap().power();
        let hit = self.pot.calculate_random_hit(
            &self
                .pot
                .calculate_generation_signature(&parent.get_generation_signature(), &miner.public_key()),
        );
        let interval = self
            .pot
            .calculate_mining_time_interval(hit, base_target, power);

        let mutable_range = self.pot.config().mutable_range;
        let immutable_block_hash = immutable_block_hash.unwrap_or_else(|| {
            self.storage
                .block_store()
                .main_chain_block_at(
                    &self.chain_id,
                    (parent.get_block_num() + 1).saturating_sub(mutable_range),
                )
                .unwrap()
                .unwrap()
        });
        let processor = StateProcessor::new(self.chain_id.clone());
        let container = build_block(
            &self.pot,
            &processor,
            miner,
            &self.chain_id,
            BlockTemplate {
                parent: &parent,
                ancestor: ancestor.as_ref(),
                immutable_block_hash,
                tx,
                timestamp: parent.get_timestamp() + interval as i64,
            },
            self.storage.state_db(),
            true,
        )
        .unwrap()
        .unwrap();
        self.apply(&container);
        container
    }

    /// Forward-apply `container` on top of the best block and commit it.
    pub fn apply(&self, container: &BlockContainer) {
        let processor = StateProcessor::new(self.chain_id.clone());
        let track = self.storage.state_db().start_tracking();
        assert!(processor
            .forward_process(container, &track, true)
            .unwrap()
            .is_applied());
        track.set_best_block_hash(&self.chain_id, &container.hash());
        self.storage
            .block_store()
            .save_block_container(&self.chain_id, container, false)
            .unwrap();
        self.storage
            .commit_main_chain_update(
                &self.chain_id,
                track.into_changes(),
                &[],
                std::slice::from_ref(container),
            )
            .unwrap();
    }

    /// Store blocks off the main chain without touching state.
    pub fn store_side(&self, containers: &[&BlockContainer]) {
        for container in containers {
            self.storage
                .block_store()
                .save_block_container(&self.chain_id, container, false)
                .unwrap();
        }
    }

    pub fn worker(&self, config: &Config, key_pair: &KeyPair) -> ChainWorker {
        self.worker_on(config, key_pair, Arc::new(MemoryDht::new(1_024)))
    }

    pub fn worker_on(
        &self,
        config: &Config,
        key_pair: &KeyPair,
        dht: Arc<dyn DhtTransport>,
    ) -> ChainWorker {
        let peers = PeerManager::with_seed(key_pair.public_key(), &config.engine, 7);
        ChainWorker::with_peers(
            self.chain_id.clone(),
            config,
            self.storage.clone(),
            dht,
            key_pair.clone(),
            peers,
        )
        .unwrap()
    }
}

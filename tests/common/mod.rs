//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use strand_chain::consensus::ProofOfTransaction;
use strand_chain::engine::{build_genesis, install_genesis};
use strand_chain::storage::Repository;
use strand_chain::{
    AccountState, BlockContainer, ChainId, ChainWorker, Config, ConsensusConfig, DhtTransport,
    GenesisAccount, KeyPair, PeerManager, PublicKey, Storage,
};

pub const GENESIS_TIME: i64 = 1_700_000_000;
pub const FUNDS: u64 = 1_000_000;

pub fn consensus() -> ConsensusConfig {
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

/// Test config whose node bootstraps from `peers`.
pub fn config_with_peers(peers: &[&KeyPair]) -> Config {
    let mut config = Config {
        consensus: consensus(),
        ..Config::default()
    };
    config.node.bootstrap_peers = peers.iter().map(|k| k.public_key().to_hex()).collect();
    config
}

pub fn chain_id() -> ChainId {
    ChainId::new(b"integration".to_vec())
}

/// Genesis block funding `creator` with power 1, plus `extra` allocations.
pub fn genesis(creator: &KeyPair, extra: &[(PublicKey, AccountState)]) -> BlockContainer {
    let mut accounts = vec![GenesisAccount {
        public_key: creator.public_key(),
        state: AccountState::new(FUNDS, 1),
    }];
    for (public_key, state) in extra {
        accounts.push(GenesisAccount {
            public_key: public_key.clone(),
            state: *state,
        });
    }
    let pot = ProofOfTransaction::new(consensus());
    build_genesis(&pot, creator, &chain_id(), accounts, GENESIS_TIME).unwrap()
}

/// Temporary storage with `genesis` installed as best block.
pub fn storage_with(genesis: &BlockContainer) -> Storage {
    let storage = Storage::temporary(&consensus()).unwrap();
    install_genesis(&storage, &chain_id(), genesis).unwrap();
    storage
}

pub fn worker(
    config: &Config,
    storage: &Storage,
    dht: Arc<dyn DhtTransport>,
    key_pair: &KeyPair,
    seed: u64,
) -> ChainWorker {
    let peers = PeerManager::with_seed(key_pair.public_key(), &config.engine, seed);
    ChainWorker::with_peers(
        chain_id(),
        config,
        storage.clone(),
        dht,
        key_pair.clone(),
        peers,
    )
    .unwrap()
}

pub fn account(storage: &Storage, public_key: &PublicKey) -> Option<AccountState> {
    storage.state_db().account(&chain_id(), public_key).unwrap()
}

// Node binary: one-shot account and chain commands, a long-running node, and
// an in-process devnet where several nodes share a MemoryDht.
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use serde_json::json;
use std::error::Error;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use strand_chain::account::{load_or_create_key_pair, save_key_pair};
use strand_chain::{
    current_timestamp, AccountState, BlockContainer, ChainId, Chains, Command, Config,
    DhtTransport, GenesisAccount, KeyPair, MemoryDht, Opt, PublicKey, Storage, Transaction,
    TxKind,
};

const DHT_QUEUE_CAPACITY: usize = 4_096;
const PUMP_INTERVAL: Duration = Duration::from_millis(50);
const DEVNET_FUNDS: u64 = 10_000;

fn main() {
    // Info by default, RUST_LOG overrides
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let opt = Opt::parse();
    if let Err(e) = run_command(opt) {
        error!("Error: {e}");
        process::exit(1);
    }
}

fn open_node(config: &Config) -> Result<(Chains, Arc<MemoryDht>), Box<dyn Error>> {
    let storage = Storage::open(&config.database_path(), &config.consensus)?;
    let key_pair = load_or_create_key_pair(&config.node.key_file)?;
    let dht = Arc::new(MemoryDht::new(DHT_QUEUE_CAPACITY));
    let transport: Arc<dyn DhtTransport> = dht.clone();
    let chains = Chains::new(config.clone(), storage, transport, key_pair)?;
    Ok((chains, dht))
}

fn run_command(opt: Opt) -> Result<(), Box<dyn Error>> {
    let config = Config::load(opt.config.as_deref())?;
    match opt.command {
        Command::CreateAccount => {
            let path = &config.node.key_file;
            if path.exists() {
                return Err(format!("An account already exists at {}", path.display()).into());
            }
            let key_pair = KeyPair::generate()?;
            save_key_pair(path, &key_pair)?;
            println!("Your new account: {}", key_pair.public_key());
        }
        Command::CreateChain { name, allocations } => {
            if name.is_empty() {
                return Err("Chain name must not be empty".into());
            }
            let mut accounts = vec![];
            for alloc in allocations {
                accounts.push(GenesisAccount {
                    public_key: PublicKey::from_hex(&alloc.public_key)?,
                    state: AccountState::new(alloc.balance, alloc.power),
                });
            }
            let (chains, _) = open_node(&config)?;
            let chain_id = chains.create_chain(&name, accounts, current_timestamp()?)?;
            println!("Created chain {chain_id}");
        }
        Command::Follow { chain } => {
            let (chains, _) = open_node(&config)?;
            chains.follow_chain(&ChainId::from_hex(&chain)?)?;
            println!("Following {chain}");
        }
        Command::Unfollow { chain } => {
            let (chains, _) = open_node(&config)?;
            chains.unfollow_chain(&ChainId::from_hex(&chain)?)?;
            println!("Unfollowed {chain}");
        }
        Command::GetBalance { chain, account } => {
            let chain_id = ChainId::from_hex(&chain)?;
            let (chains, _) = open_node(&config)?;
            let public_key = match account {
                Some(hex) => PublicKey::from_hex(&hex)?,
                None => load_or_create_key_pair(&config.node.key_file)?.public_key(),
            };
            let state = chains.account(&chain_id, &public_key)?.unwrap_or_default();
            println!(
                "Balance of {public_key}: {} (power {})",
                state.balance,
                state.power()
            );
        }
        Command::Printchain { chain, json, limit } => {
            let chain_id = ChainId::from_hex(&chain)?;
            let (chains, _) = open_node(&config)?;
            let blocks = main_chain(&chains, &chain_id, limit.unwrap_or(usize::MAX))?;
            if json {
                let entries: Vec<serde_json::Value> = blocks.iter().map(block_json).collect();
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for container in &blocks {
                    print_block(container);
                }
            }
        }
        Command::Send {
            chain,
            to,
            amount,
            fee,
        } => {
            if amount == 0 {
                return Err("Amount must be positive".into());
            }
            let chain_id = ChainId::from_hex(&chain)?;
            let receiver = PublicKey::from_hex(&to)?;
            let (chains, _) = open_node(&config)?;
            let key_pair = load_or_create_key_pair(&config.node.key_file)?;
            let sender = chains
                .account(&chain_id, &key_pair.public_key())?
                .ok_or("The local account has no state on this chain")?;

            let tx = Transaction::new_signed(
                &key_pair,
                chain_id.clone(),
                current_timestamp()?,
                fee,
                sender.nonce + 1,
                TxKind::Wiring { receiver, amount },
            )?;
            chains.submit_transaction(&chain_id, tx.clone())?;
            println!("Submitted {}", tx.tx_id());

            // without peers only the local account can mine it
            let wait = Duration::from_secs(config.consensus.max_block_time * 2);
            let started = Instant::now();
            while started.elapsed() < wait {
                chains.tick_all(current_timestamp()?)?;
                if chains
                    .block_store()
                    .get_transaction(&chain_id, &tx.tx_id())?
                    .is_some()
                {
                    println!("Success!");
                    return Ok(());
                }
                thread::sleep(Duration::from_secs(1));
            }
            println!("Transaction is still pending");
        }
        Command::StartNode { seconds } => {
            let (chains, dht) = open_node(&config)?;
            let followed = chains.followed_chains()?;
            if followed.is_empty() {
                warn!("No chains followed; use createchain or follow first");
            }
            chains.start()?;
            let deadline = seconds.map(|s| Instant::now() + Duration::from_secs(s));
            while deadline.map(|d| Instant::now() < d).unwrap_or(true) {
                dht.pump();
                thread::sleep(PUMP_INTERVAL);
            }
            chains.stop()?;
        }
        Command::Devnet { nodes, seconds } => run_devnet(&config, nodes.max(1), seconds)?,
    }
    Ok(())
}

/// Main-chain containers from the best block down, as far as stored locally.
fn main_chain(
    chains: &Chains,
    chain_id: &ChainId,
    limit: usize,
) -> Result<Vec<BlockContainer>, Box<dyn Error>> {
    let mut blocks = vec![];
    let mut cursor = chains.best_block_container(chain_id)?;
    while let Some(container) = cursor {
        if blocks.len() >= limit {
            break;
        }
        cursor = if container.get_block().is_genesis() {
            None
        } else {
            chains
                .block_store()
                .get_block_container(chain_id, &container.previous_hash())?
        };
        blocks.push(container);
    }
    Ok(blocks)
}

fn describe_tx(tx: &Transaction) -> String {
    match tx.get_kind() {
        TxKind::Genesis { accounts } => format!("genesis allocating {} account(s)", accounts.len()),
        TxKind::Note { memo } => format!("note of {} byte(s)", memo.len()),
        TxKind::Wiring { receiver, amount } => format!("wiring {amount} to {receiver}"),
    }
}

fn print_block(container: &BlockContainer) {
    let block = container.get_block();
    println!("Height: {}", block.get_block_num());
    println!("Hash: {}", container.hash());
    println!("Previous: {}", block.get_previous_block_hash());
    println!("Timestamp: {}", block.get_timestamp());
    println!("Miner: {}", block.get_miner());
    println!(
        "Base target: {}, cumulative difficulty: {}",
        block.get_base_target(),
        block.get_cumulative_difficulty()
    );
    if let Some(tx) = container.get_tx() {
        println!("- Tx {} from {}: {}", tx.tx_id(), tx.get_sender(), describe_tx(tx));
    }
    println!()
}

fn block_json(container: &BlockContainer) -> serde_json::Value {
    let block = container.get_block();
    json!({
        "height": block.get_block_num(),
        "hash": container.hash().to_hex(),
        "previous": block.get_previous_block_hash().to_hex(),
        "immutable": block.get_immutable_block_hash().to_hex(),
        "timestamp": block.get_timestamp(),
        "miner": block.get_miner().to_hex(),
        "base_target": block.get_base_target(),
        "cumulative_difficulty": block.get_cumulative_difficulty(),
        "tx": container.get_tx().map(|tx| json!({
            "id": tx.tx_id().to_hex(),
            "sender": tx.get_sender().to_hex(),
            "fee": tx.get_fee(),
            "nonce": tx.get_nonce(),
            "kind": describe_tx(tx),
        })),
    })
}

/// Several nodes in one process: the first creates a chain funding everyone,
/// the rest follow it, and each node keeps wiring coins to the next.
fn run_devnet(config: &Config, count: usize, seconds: u64) -> Result<(), Box<dyn Error>> {
    let dht = Arc::new(MemoryDht::new(DHT_QUEUE_CAPACITY));
    let transport: Arc<dyn DhtTransport> = dht.clone();
    let keys: Vec<KeyPair> = (0..count)
        .map(|_| KeyPair::generate())
        .collect::<Result<_, _>>()?;

    let allocations: Vec<GenesisAccount> = keys
        .iter()
        .map(|key| GenesisAccount {
            public_key: key.public_key(),
            state: AccountState::new(DEVNET_FUNDS, 1),
        })
        .collect();

    let mut nodes = vec![];
    let mut chain_id = None;
    for (index, key) in keys.iter().enumerate() {
        let mut node_config = config.clone();
        node_config.node.bootstrap_peers = vec![keys[0].public_key().to_hex()];
        let storage = Storage::temporary(&node_config.consensus)?;
        let chains = Chains::new(node_config, storage, transport.clone(), key.clone())?;
        match &chain_id {
            None => {
                let id = chains.create_chain("devnet", allocations.clone(), current_timestamp()?)?;
                chain_id = Some(id);
            }
            Some(id) => chains.follow_chain(id)?,
        }
        info!("Devnet node {index} is {}", key.public_key());
        nodes.push(chains);
    }
    let chain_id = chain_id.ok_or("devnet has no nodes")?;
    for node in &nodes {
        node.start()?;
    }

    let started = Instant::now();
    let mut last_report = Instant::now();
    let mut last_send = Instant::now();
    while started.elapsed() < Duration::from_secs(seconds) {
        dht.pump();
        if last_send.elapsed() >= Duration::from_secs(config.consensus.block_time) {
            for (index, node) in nodes.iter().enumerate() {
                let key = &keys[index];
                let receiver = keys[(index + 1) % count].public_key();
                if let Err(e) = send_one(node, &chain_id, key, receiver) {
                    warn!("Devnet node {index} could not send: {e}");
                }
            }
            last_send = Instant::now();
        }
        if last_report.elapsed() >= Duration::from_secs(5) {
            report(&nodes, &chain_id)?;
            last_report = Instant::now();
        }
        thread::sleep(PUMP_INTERVAL);
    }

    for node in &nodes {
        node.stop()?;
    }
    report(&nodes, &chain_id)
}

fn send_one(
    node: &Chains,
    chain_id: &ChainId,
    key: &KeyPair,
    receiver: PublicKey,
) -> Result<(), Box<dyn Error>> {
    let state = match node.account(chain_id, &key.public_key())? {
        Some(state) if state.balance > 1 => state,
        _ => return Ok(()),
    };
    let tx = Transaction::new_signed(
        key,
        chain_id.clone(),
        current_timestamp()?,
        1,
        state.nonce + 1,
        TxKind::Wiring {
            receiver,
            amount: 1,
        },
    )?;
    node.submit_transaction(chain_id, tx)?;
    Ok(())
}

fn report(nodes: &[Chains], chain_id: &ChainId) -> Result<(), Box<dyn Error>> {
    for (index, node) in nodes.iter().enumerate() {
        match node.best_block_container(chain_id)? {
            Some(best) => println!(
                "node {index}: height {} best {}",
                best.block_num(),
                best.hash()
            ),
            None => println!("node {index}: no best block yet"),
        }
    }
    Ok(())
}

//! Per-chain consensus engine
//!
//! `Chains` owns one `ChainWorker` per followed chain. While started, every
//! worker runs on its own thread and is reached only through `ChainCommand`
//! messages; stopped workers sit idle in the map and are driven directly.

pub mod chain_state;
pub mod fork;
pub mod miner;
pub mod worker;

pub use chain_state::{ChainState, Phase, VotingRound};
pub use fork::ForkOutcome;
pub use miner::{build_block, build_genesis, chain_seed, BlockTemplate};
pub use worker::ChainWorker;

use crate::account::KeyPair;
use crate::config::{Config, EngineConfig};
use crate::consensus::ProofOfTransaction;
use crate::core::{
    AccountState, BlockContainer, ChainId, GenesisAccount, ProcessOutcome, PublicKey,
    StateProcessor, Transaction,
};
use crate::error::{ChainError, Result};
use crate::network::DhtTransport;
use crate::storage::{BlockStore, Repository, StateDb, Storage};
use crate::utils::current_timestamp;
use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Requests other threads send to a running worker.
pub enum ChainCommand {
    SubmitTransaction {
        tx: Transaction,
        reply: Sender<Result<()>>,
    },
    PendingTransactions {
        reply: Sender<Vec<Transaction>>,
    },
}

enum WorkerSlot {
    Idle(Box<ChainWorker>),
    Running {
        commands: Sender<ChainCommand>,
        running: Arc<AtomicBool>,
        thread: JoinHandle<Box<ChainWorker>>,
    },
}

/// Sleep before the next tick: doubles while the DHT queue is congested,
/// halves otherwise, bounded by the configured limits.
pub fn next_tick_interval(
    current_ms: u64,
    queue_len: usize,
    queue_capacity: usize,
    engine: &EngineConfig,
) -> u64 {
    let congested =
        queue_capacity > 0 && queue_len as f64 > queue_capacity as f64 * engine.backpressure_ratio;
    let next = if congested {
        current_ms.saturating_mul(2)
    } else {
        current_ms / 2
    };
    next.clamp(engine.min_tick_interval_ms, engine.max_tick_interval_ms)
}

/// Make `genesis` the best and sync block of a chain nobody has stored yet.
pub fn install_genesis(storage: &Storage, chain_id: &ChainId, genesis: &BlockContainer) -> Result<()> {
    let track = storage.state_db().start_tracking();
    let processor = StateProcessor::new(chain_id.clone());
    match processor.forward_process(genesis, &track, true)? {
        ProcessOutcome::Applied(_) => {}
        other => {
            return Err(ChainError::InvalidBlock(format!(
                "genesis does not apply: {other:?}"
            )))
        }
    }
    track.set_best_block_hash(chain_id, &genesis.hash());
    track.set_sync_block_hash(chain_id, &genesis.hash());
    track.follow_chain(chain_id);

    storage
        .block_store()
        .save_block_container(chain_id, genesis, false)?;
    storage.commit_main_chain_update(
        chain_id,
        track.into_changes(),
        &[],
        std::slice::from_ref(genesis),
    )
}

fn run_worker(
    worker: &mut ChainWorker,
    inbox: Receiver<ChainCommand>,
    engine: EngineConfig,
    dht: Arc<dyn DhtTransport>,
) {
    let running = worker.running_flag();
    let mut interval = engine.initial_tick_interval_ms;
    while running.load(Ordering::SeqCst) {
        match current_timestamp() {
            Ok(now) => worker.tick(now),
            Err(e) => error!("Chain {} skipped a tick: {e}", worker.chain_id()),
        }
        interval = next_tick_interval(interval, dht.queue_len(), dht.queue_capacity(), &engine);

        let deadline = Instant::now() + Duration::from_millis(interval);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match inbox.recv_timeout(remaining) {
                Ok(command) => worker.handle_command(command),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => return,
            }
            if !running.load(Ordering::SeqCst) {
                return;
            }
        }
    }
}

pub struct Chains {
    config: Config,
    storage: Storage,
    dht: Arc<dyn DhtTransport>,
    key_pair: KeyPair,
    workers: Mutex<HashMap<ChainId, WorkerSlot>>,
    started: AtomicBool,
}

impl Chains {
    /// Load a worker for every chain the database follows.
    pub fn new(
        config: Config,
        storage: Storage,
        dht: Arc<dyn DhtTransport>,
        key_pair: KeyPair,
    ) -> Result<Chains> {
        let mut workers = HashMap::new();
        for chain_id in storage.state_db().followed_chains()? {
            let worker = ChainWorker::new(
                chain_id.clone(),
                &config,
                storage.clone(),
                dht.clone(),
                key_pair.clone(),
            )?;
            workers.insert(chain_id, WorkerSlot::Idle(Box::new(worker)));
        }
        info!("Loaded {} followed chain(s)", workers.len());
        Ok(Chains {
            config,
            storage,
            dht,
            key_pair,
            workers: Mutex::new(workers),
            started: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<ChainId, WorkerSlot>>> {
        self.workers
            .lock()
            .map_err(|_| ChainError::Database("Chain worker map poisoned".to_string()))
    }

    fn spawn(&self, worker: Box<ChainWorker>) -> Result<WorkerSlot> {
        let (commands, inbox) = channel();
        let running = worker.running_flag();
        running.store(true, Ordering::SeqCst);
        let engine = self.config.engine.clone();
        let dht = self.dht.clone();
        let thread = thread::Builder::new()
            .name(format!("chain-{}", worker.chain_id()))
            .spawn(move || {
                let mut worker = worker;
                run_worker(&mut worker, inbox, engine, dht);
                worker
            })?;
        Ok(WorkerSlot::Running {
            commands,
            running,
            thread,
        })
    }

    fn insert_worker(&self, chain_id: ChainId, worker: ChainWorker) -> Result<()> {
        let slot = if self.started.load(Ordering::SeqCst) {
            self.spawn(Box::new(worker))?
        } else {
            WorkerSlot::Idle(Box::new(worker))
        };
        self.lock()?.insert(chain_id, slot);
        Ok(())
    }

    fn new_worker(&self, chain_id: &ChainId) -> Result<ChainWorker> {
        ChainWorker::new(
            chain_id.clone(),
            &self.config,
            self.storage.clone(),
            self.dht.clone(),
            self.key_pair.clone(),
        )
    }

    /// Start replicating `chain_id`. Following an already followed chain is a no-op.
    pub fn follow_chain(&self, chain_id: &ChainId) -> Result<()> {
        if self.lock()?.contains_key(chain_id) {
            return Ok(());
        }
        let track = self.storage.state_db().start_tracking();
        track.follow_chain(chain_id);
        track.commit()?;

        let worker = self.new_worker(chain_id)?;
        self.insert_worker(chain_id.clone(), worker)?;
        info!("Following chain {chain_id}");
        Ok(())
    }

    /// Stop replicating `chain_id` and delete everything stored for it.
    pub fn unfollow_chain(&self, chain_id: &ChainId) -> Result<()> {
        let slot = self
            .lock()?
            .remove(chain_id)
            .ok_or_else(|| ChainError::UnknownChain(chain_id.to_hex()))?;
        Self::stop_slot(slot);

        let state_db = self.storage.state_db();
        state_db.write_changes(state_db.chain_wipe(chain_id)?)?;
        self.storage.block_store().remove_chain(chain_id)?;
        info!("Unfollowed chain {chain_id}");
        Ok(())
    }

    /// Create a new chain whose genesis allocates `accounts`, and follow it.
    /// The local account is added with mining power when not allocated.
    pub fn create_chain(
        &self,
        name: &str,
        mut accounts: Vec<GenesisAccount>,
        now: i64,
    ) -> Result<ChainId> {
        let creator = self.key_pair.public_key();
        if !accounts.iter().any(|a| a.public_key == creator) {
            accounts.insert(
                0,
                GenesisAccount {
                    public_key: creator,
                    state: AccountState::new(0, 1),
                },
            );
        }

        let chain_id = ChainId::derive(name, &chain_seed(&self.key_pair, now));
        let pot = ProofOfTransaction::new(self.config.consensus.clone());
        let genesis = build_genesis(&pot, &self.key_pair, &chain_id, accounts, now)?;
        install_genesis(&self.storage, &chain_id, &genesis)?;

        let worker = self.new_worker(&chain_id)?;
        self.insert_worker(chain_id.clone(), worker)?;
        info!("Created chain {chain_id} with genesis {}", genesis.hash());
        Ok(chain_id)
    }

    /// Hand a transaction to the chain's worker; it is validated against the
    /// best state before being pooled.
    pub fn submit_transaction(&self, chain_id: &ChainId, tx: Transaction) -> Result<()> {
        let mut workers = self.lock()?;
        let commands = match workers.get_mut(chain_id) {
            Some(WorkerSlot::Idle(worker)) => return worker.submit_transaction(tx),
            Some(WorkerSlot::Running { commands, .. }) => commands.clone(),
            None => return Err(ChainError::UnknownChain(chain_id.to_hex())),
        };
        drop(workers);

        let (reply, response) = channel();
        commands
            .send(ChainCommand::SubmitTransaction { tx, reply })
            .map_err(|_| ChainError::ChainStopped(chain_id.to_hex()))?;
        response
            .recv()
            .map_err(|_| ChainError::ChainStopped(chain_id.to_hex()))?
    }

    pub fn pending_transactions(&self, chain_id: &ChainId) -> Result<Vec<Transaction>> {
        let workers = self.lock()?;
        let commands = match workers.get(chain_id) {
            Some(WorkerSlot::Idle(worker)) => return Ok(worker.pending_transactions()),
            Some(WorkerSlot::Running { commands, .. }) => commands.clone(),
            None => return Err(ChainError::UnknownChain(chain_id.to_hex())),
        };
        drop(workers);

        let (reply, response) = channel();
        commands
            .send(ChainCommand::PendingTransactions { reply })
            .map_err(|_| ChainError::ChainStopped(chain_id.to_hex()))?;
        response
            .recv()
            .map_err(|_| ChainError::ChainStopped(chain_id.to_hex()))
    }

    /// Committed best block, read straight from storage.
    pub fn best_block_container(&self, chain_id: &ChainId) -> Result<Option<BlockContainer>> {
        match self.storage.state_db().best_block_hash(chain_id)? {
            Some(hash) => self.storage.block_store().get_block_container(chain_id, &hash),
            None => Ok(None),
        }
    }

    pub fn account(&self, chain_id: &ChainId, public_key: &PublicKey) -> Result<Option<AccountState>> {
        self.storage.state_db().account(chain_id, public_key)
    }

    pub fn state_db(&self) -> &StateDb {
        self.storage.state_db()
    }

    pub fn block_store(&self) -> &BlockStore {
        self.storage.block_store()
    }

    pub fn followed_chains(&self) -> Result<Vec<ChainId>> {
        let mut chains: Vec<ChainId> = self.lock()?.keys().cloned().collect();
        chains.sort();
        Ok(chains)
    }

    /// Run every worker on its own thread.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut workers = self.lock()?;
        let slots: Vec<(ChainId, WorkerSlot)> = workers.drain().collect();
        for (chain_id, slot) in slots {
            let slot = match slot {
                WorkerSlot::Idle(worker) => self.spawn(worker)?,
                running => running,
            };
            workers.insert(chain_id, slot);
        }
        info!("Started {} chain worker(s)", workers.len());
        Ok(())
    }

    // Signal, wake and join one worker thread.
    fn stop_slot(slot: WorkerSlot) -> Option<Box<ChainWorker>> {
        match slot {
            WorkerSlot::Idle(worker) => Some(worker),
            WorkerSlot::Running {
                commands,
                running,
                thread,
            } => {
                running.store(false, Ordering::SeqCst);
                drop(commands);
                match thread.join() {
                    Ok(worker) => Some(worker),
                    Err(_) => {
                        error!("A chain worker thread panicked");
                        None
                    }
                }
            }
        }
    }

    /// Stop every worker thread; workers stay loaded and can be restarted.
    pub fn stop(&self) -> Result<()> {
        if self.started.swap(false, Ordering::SeqCst) {
            let mut workers = self.lock()?;
            let slots: Vec<(ChainId, WorkerSlot)> = workers.drain().collect();
            for (chain_id, slot) in slots {
                if let Some(worker) = Self::stop_slot(slot) {
                    workers.insert(chain_id, WorkerSlot::Idle(worker));
                }
            }
            info!("Stopped chain workers");
        }
        self.storage.flush()
    }

    /// Drive one tick of every idle worker. Used by tests and single-threaded tools.
    pub fn tick_all(&self, now: i64) -> Result<()> {
        let mut workers = self.lock()?;
        for slot in workers.values_mut() {
            if let WorkerSlot::Idle(worker) = slot {
                worker.tick(now);
            }
        }
        Ok(())
    }
}

impl Drop for Chains {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Failed to stop chain workers: {e}");
        }
    }
}

// One chain's consensus loop. A worker owns its `ChainState` outright; the
// only shared pieces are the storage handle, the DHT transport and the key
// pair, all injected at construction.

use crate::account::KeyPair;
use crate::config::Config;
use crate::consensus::{
    check_intrinsic, check_signatures, ProofOfTransaction, Rejection, ADJUSTMENT_WINDOW,
};
use crate::core::{
    AccountState, Block, BlockContainer, ChainId, Hash, PublicKey, StateProcessor, Transaction,
};
use crate::engine::chain_state::{ChainState, Phase};
use crate::engine::miner::{build_block, BlockTemplate};
use crate::engine::ChainCommand;
use crate::error::{ChainError, Result};
use crate::network::{Channel, DhtEvent, DhtTransport, MutableItem, PeerManager, RequestContext};
use crate::storage::{Repository, Storage, TransactionPool};
use log::{debug, error, info, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;

// blocks kept in the receive buffer per mutable range
const BUFFER_FACTOR: u64 = 2;

pub struct ChainWorker {
    pub(super) chain_id: ChainId,
    pub(super) config: Config,
    pub(super) storage: Storage,
    pub(super) dht: Arc<dyn DhtTransport>,
    pub(super) key_pair: KeyPair,
    pub(super) pot: ProofOfTransaction,
    pub(super) processor: StateProcessor,
    pub(super) state: ChainState,
    events: Receiver<DhtEvent>,
    event_sender: Sender<DhtEvent>,
    running: Arc<AtomicBool>,
}

impl ChainWorker {
    /// Load a followed chain's persisted pointers and peers.
    pub fn new(
        chain_id: ChainId,
        config: &Config,
        storage: Storage,
        dht: Arc<dyn DhtTransport>,
        key_pair: KeyPair,
    ) -> Result<ChainWorker> {
        let peers = PeerManager::new(key_pair.public_key(), &config.engine);
        Self::with_peers(chain_id, config, storage, dht, key_pair, peers)
    }

    pub fn with_peers(
        chain_id: ChainId,
        config: &Config,
        storage: Storage,
        dht: Arc<dyn DhtTransport>,
        key_pair: KeyPair,
        mut peers: PeerManager,
    ) -> Result<ChainWorker> {
        let state_db = storage.state_db();
        let store = storage.block_store();

        let best = match state_db.best_block_hash(&chain_id)? {
            Some(hash) => store.get_block_container(&chain_id, &hash)?,
            None => None,
        };
        let sync_block = match state_db.sync_block_hash(&chain_id)? {
            Some(hash) => store.get_block_container(&chain_id, &hash)?,
            None => None,
        };

        for peer in state_db.peers(&chain_id)? {
            peers.add_peer(peer);
        }
        for hex in &config.node.bootstrap_peers {
            peers.add_peer(PublicKey::from_hex(hex)?);
        }

        let tx_pool = TransactionPool::new(chain_id.clone(), config.engine.max_pending_transactions);
        let buffer_capacity = (config.consensus.mutable_range * BUFFER_FACTOR) as usize;
        let mut state = ChainState::new(chain_id.clone(), peers, tx_pool, buffer_capacity);
        state.best = best;
        state.sync_block = sync_block;

        let (event_sender, events) = channel();
        let worker = ChainWorker {
            pot: ProofOfTransaction::new(config.consensus.clone()),
            processor: StateProcessor::new(chain_id.clone()),
            chain_id,
            config: config.clone(),
            storage,
            dht,
            key_pair,
            state,
            events,
            event_sender,
            running: Arc::new(AtomicBool::new(true)),
        };
        if let Some(best) = &worker.state.best {
            info!(
                "Chain {} resumes at height {} ({})",
                worker.chain_id,
                best.block_num(),
                best.hash()
            );
        }
        Ok(worker)
    }

    pub fn chain_id(&self) -> &ChainId {
        &self.chain_id
    }

    pub fn state(&self) -> &ChainState {
        &self.state
    }

    pub fn best_block_container(&self) -> Option<&BlockContainer> {
        self.state.best.as_ref()
    }

    pub fn phase(&self, now: i64) -> Phase {
        self.state.phase(now, &self.config.consensus)
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn add_peer(&mut self, peer: PublicKey) -> Result<()> {
        if self.state.peers.add_peer(peer.clone()) {
            self.persist_peers(&[peer])?;
        }
        Ok(())
    }

    fn persist_peers(&self, peers: &[PublicKey]) -> Result<()> {
        if peers.is_empty() {
            return Ok(());
        }
        let track = self.storage.state_db().start_tracking();
        for peer in peers {
            track.add_peer(&self.chain_id, peer);
        }
        track.commit()
    }

    fn own_account(&self) -> Result<Option<AccountState>> {
        self.storage
            .state_db()
            .account(&self.chain_id, &self.key_pair.public_key())
    }

    /// Validate `tx` against the best state and queue it for mining and gossip.
    pub fn submit_transaction(&mut self, tx: Transaction) -> Result<()> {
        self.state
            .tx_pool
            .add_transaction(tx.clone(), self.storage.state_db())?;
        info!("Accepted tx {} on chain {}", tx.tx_id(), self.chain_id);
        self.dht.put_immutable(tx.tx_id(), tx.serialize()?)
    }

    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.state.tx_pool.pending()
    }

    pub(super) fn handle_command(&mut self, command: ChainCommand) {
        // the caller may have given up waiting
        match command {
            ChainCommand::SubmitTransaction { tx, reply } => {
                let _ = reply.send(self.submit_transaction(tx));
            }
            ChainCommand::PendingTransactions { reply } => {
                let _ = reply.send(self.pending_transactions());
            }
        }
    }

    /// One pass of the consensus loop at wall-clock second `now`.
    pub fn tick(&mut self, now: i64) {
        self.drain_events(now);
        self.state
            .expire_requests(now, self.config.engine.request_retry_secs);

        match self.phase(now) {
            Phase::Empty if self.state.best.is_none() => {
                self.run_step("bootstrap", now, Self::bootstrap);
                self.run_step("gossip", now, Self::gossip);
                return;
            }
            Phase::Empty => self.run_step("stale resync", now, Self::stale_resync),
            Phase::Syncing | Phase::Steady => {}
        }

        self.run_step("sync", now, Self::sync_batch);
        if !self.state.is_voting() {
            self.run_step("fork", now, Self::process_fork_candidates);
        }
        if self.state.is_voting() {
            self.run_step("voting", now, Self::voting_step);
        }
        self.run_step("mining", now, Self::mine_if_eligible);
        self.run_step("gossip", now, Self::gossip);
    }

    // A failed step is logged and abandoned until the next tick.
    fn run_step<F>(&mut self, name: &str, now: i64, step: F)
    where
        F: FnOnce(&mut Self, i64) -> Result<()>,
    {
        if let Err(e) = step(self, now) {
            error!("Chain {} {name} step failed: {e}", self.chain_id);
        }
    }

    fn drain_events(&mut self, now: i64) {
        while let Ok(event) = self.events.try_recv() {
            if !self.running.load(Ordering::SeqCst) {
                trace!("Discarding DHT reply after stop");
                continue;
            }
            if let Err(e) = self.handle_event(event, now) {
                warn!("Chain {} dropped DHT reply: {e}", self.chain_id);
            }
        }
    }

    fn handle_event(&mut self, event: DhtEvent, now: i64) -> Result<()> {
        let DhtEvent { context, payload } = event;
        match context {
            RequestContext::Block { hash } => {
                self.state.requested.remove(&hash);
                match payload {
                    Some(bytes) => self.on_block(hash, Block::deserialize(&bytes)?, now)?,
                    None => self.state.wanted_block = Some(hash),
                }
            }
            RequestContext::Tx { hash } => {
                self.state.requested.remove(&hash);
                match payload {
                    Some(bytes) => self.on_tx(hash, Transaction::deserialize(&bytes)?, now)?,
                    None => self.state.wanted_tx = Some(hash),
                }
            }
            _ if payload.is_none() => {}
            RequestContext::TipBlock { .. } | RequestContext::VoteTip { .. } => {
                let bytes = payload.unwrap_or_default();
                let container = BlockContainer::deserialize(&bytes)?;
                let vote = matches!(context, RequestContext::VoteTip { .. });
                self.on_tip(container, vote)?;
            }
            RequestContext::TipTx { .. } => {
                let tx = Transaction::deserialize(&payload.unwrap_or_default())?;
                self.pool_remote_tx(tx)?;
            }
            RequestContext::BlockRequest { .. } => {
                if let Some(hash) = Hash::from_slice(&payload.unwrap_or_default()) {
                    self.state.remote_block_requests.insert(hash);
                }
            }
            RequestContext::TxRequest { .. } => {
                if let Some(hash) = Hash::from_slice(&payload.unwrap_or_default()) {
                    self.state.remote_tx_requests.insert(hash);
                }
            }
        }
        Ok(())
    }

    /// A peer's tip; solicited during a vote it also counts as a vote.
    pub(super) fn on_tip(&mut self, container: BlockContainer, vote: bool) -> Result<()> {
        if vote && self.state.is_voting() {
            let weight = self.config.consensus.vote_weight(container.block_num());
            self.state.voting_pool.add_tip_vote(container.clone(), weight);
        }
        self.accept_container(container)
    }

    fn on_block(&mut self, hash: Hash, block: Block, now: i64) -> Result<()> {
        if block.hash() != hash {
            warn!("DHT returned a block that does not match {hash}");
            return Ok(());
        }
        let tx_hash = match block.get_tx_hash() {
            Some(tx_hash) => tx_hash,
            None => return self.accept_container(BlockContainer::new(block, None)),
        };
        let known = match self
            .storage
            .block_store()
            .get_transaction(&self.chain_id, &tx_hash)?
        {
            Some(tx) => Some(tx),
            None => self
                .state
                .tx_pool
                .pending()
                .into_iter()
                .find(|tx| tx.tx_id() == tx_hash),
        };
        match known {
            Some(tx) => self.accept_container(BlockContainer::new(block, Some(tx))),
            None => {
                self.state.park_partial_block(tx_hash, block, now);
                self.request_tx(tx_hash, now);
                Ok(())
            }
        }
    }

    fn on_tx(&mut self, hash: Hash, tx: Transaction, _now: i64) -> Result<()> {
        if tx.tx_id() != hash {
            warn!("DHT returned a transaction that does not match {hash}");
            return Ok(());
        }
        match self.state.partial_blocks.remove(&hash) {
            Some((block, _)) => self.accept_container(BlockContainer::new(block, Some(tx))),
            None => self.pool_remote_tx(tx),
        }
    }

    fn pool_remote_tx(&mut self, tx: Transaction) -> Result<()> {
        if self.state.tx_pool.contains(&tx.tx_id()) {
            return Ok(());
        }
        match self
            .state
            .tx_pool
            .add_transaction(tx, self.storage.state_db())
        {
            Ok(()) => Ok(()),
            Err(ChainError::Transaction(reason)) => {
                trace!("Ignoring gossiped tx: {reason}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Buffer a received container for the fork and sync steps.
    pub(crate) fn accept_container(&mut self, container: BlockContainer) -> Result<()> {
        let hash = container.hash();
        if self.state.rejected.contains(&hash) {
            return Ok(());
        }
        if container.get_block().get_chain_id() != &self.chain_id {
            warn!("Rejecting block {hash} of a foreign chain");
            self.state.reject(hash);
            return Ok(());
        }
        if self
            .storage
            .block_store()
            .is_main_chain_block(&self.chain_id, &hash)?
        {
            return Ok(());
        }
        let new_peers = self.state.peers.add_peers_from(&container);
        self.persist_peers(&new_peers)?;
        if self.state.buffer_container(container) {
            trace!("Buffered block {hash} on chain {}", self.chain_id);
        }
        Ok(())
    }

    /// Checks that need nothing but the container itself.
    pub(super) fn standalone_check(
        &self,
        container: &BlockContainer,
        now: i64,
    ) -> std::result::Result<(), Rejection> {
        let block = container.get_block();
        if block.get_timestamp() > now {
            return Err(Rejection::FutureTimestamp {
                timestamp: block.get_timestamp(),
                now,
            });
        }
        check_intrinsic(container, &self.chain_id)?;
        check_signatures(container)
    }

    pub(super) fn request_block(&mut self, hash: Hash, now: i64) {
        if self
            .state
            .should_request(hash, now, self.config.engine.request_retry_secs)
        {
            debug!("Chain {} requesting block {hash}", self.chain_id);
            self.dht.request_immutable(
                hash,
                RequestContext::Block { hash },
                self.event_sender.clone(),
            );
        }
    }

    fn request_tx(&mut self, hash: Hash, now: i64) {
        if self
            .state
            .should_request(hash, now, self.config.engine.request_retry_secs)
        {
            self.dht
                .request_immutable(hash, RequestContext::Tx { hash }, self.event_sender.clone());
        }
    }

    fn request_tip(&mut self, peer: &PublicKey, vote: bool) {
        let context = if vote {
            RequestContext::VoteTip { peer: peer.clone() }
        } else {
            RequestContext::TipBlock { peer: peer.clone() }
        };
        self.dht.request_mutable(
            peer,
            &Channel::BlockTip.salt(&self.chain_id),
            context,
            self.event_sender.clone(),
        );
    }

    pub(super) fn solicit_votes(&mut self) {
        let fan_out = self.state.peers.fan_out();
        for peer in self.state.peers.random_peers(fan_out) {
            self.request_tip(&peer, true);
        }
    }

    fn bootstrap(&mut self, now: i64) -> Result<()> {
        let mut candidates: Vec<BlockContainer> =
            self.state.block_buffer.values().cloned().collect();
        candidates.sort_by(|a, b| b.cumulative_difficulty().cmp(&a.cumulative_difficulty()));

        for candidate in candidates {
            match self.standalone_check(&candidate, now) {
                Ok(()) => {
                    info!(
                        "Chain {} bootstrapping from block {} at height {}",
                        self.chain_id,
                        candidate.hash(),
                        candidate.block_num()
                    );
                    return self.initial_resync(candidate, now);
                }
                Err(rejection) => {
                    warn!("Rejecting bootstrap block {}: {rejection}", candidate.hash());
                    self.state.reject(candidate.hash());
                }
            }
        }

        if let Some(peer) = self.state.peers.random_peer() {
            self.request_tip(&peer, false);
        }
        Ok(())
    }

    fn stale_resync(&mut self, now: i64) -> Result<()> {
        let best_difficulty = self.state.best_cumulative_difficulty();
        let candidate = self
            .state
            .block_buffer
            .values()
            .filter(|c| c.cumulative_difficulty() > best_difficulty)
            .max_by_key(|c| c.cumulative_difficulty())
            .cloned();
        match candidate {
            Some(candidate) => match self.standalone_check(&candidate, now) {
                Ok(()) => {
                    info!("Chain {} is stale, resyncing from {}", self.chain_id, candidate.hash());
                    self.initial_resync(candidate, now)
                }
                Err(rejection) => {
                    warn!("Rejecting block {}: {rejection}", candidate.hash());
                    self.state.reject(candidate.hash());
                    Ok(())
                }
            },
            None => {
                if let Some(peer) = self.state.peers.random_peer() {
                    self.request_tip(&peer, false);
                }
                Ok(())
            }
        }
    }

    /// Block `ancestor_distance` heights below `from`, searching `extra`,
    /// the receive buffer and the block store. `Err(hash)` names the first
    /// missing block on the way.
    pub(super) fn walk_back(
        &self,
        from: &Block,
        ancestor_distance: u64,
        extra: &[BlockContainer],
    ) -> Result<std::result::Result<Block, Hash>> {
        let mut cursor = from.clone();
        for _ in 0..ancestor_distance {
            let parent = cursor.get_previous_block_hash();
            cursor = match self.lookup_block(&parent, extra)? {
                Some(block) => block,
                None => return Ok(Err(parent)),
            };
        }
        Ok(Ok(cursor))
    }

    pub(super) fn lookup_block(&self, hash: &Hash, extra: &[BlockContainer]) -> Result<Option<Block>> {
        if let Some(found) = extra.iter().find(|c| c.hash() == *hash) {
            return Ok(Some(found.get_block().clone()));
        }
        if let Some(found) = self.state.block_buffer.get(hash) {
            return Ok(Some(found.get_block().clone()));
        }
        self.storage.block_store().get_block(&self.chain_id, hash)
    }

    pub(super) fn lookup_container(&self, hash: &Hash) -> Result<Option<BlockContainer>> {
        if let Some(found) = self.state.block_buffer.get(hash) {
            return Ok(Some(found.clone()));
        }
        self.storage
            .block_store()
            .get_block_container(&self.chain_id, hash)
    }

    /// Ancestor the base target of `parent`'s child depends on.
    pub(super) fn base_target_ancestor(
        &self,
        parent: &Block,
        extra: &[BlockContainer],
    ) -> Result<std::result::Result<Option<Block>, Hash>> {
        if parent.get_block_num() <= ADJUSTMENT_WINDOW {
            return Ok(Ok(None));
        }
        Ok(self.walk_back(parent, ADJUSTMENT_WINDOW, extra)?.map(Some))
    }

    /// Earliest interval after the best block at which we may mine, if at all.
    pub fn mining_interval(&self) -> Result<Option<u64>> {
        let best = match &self.state.best {
            Some(best) => best.get_block().clone(),
            None => return Ok(None),
        };
        let power = self.own_account()?.map(|a| a.power()).unwrap_or(0);
        if power == 0 {
            return Ok(None);
        }
        let ancestor = match self.base_target_ancestor(&best, &[])? {
            Ok(ancestor) => ancestor,
            Err(_) => return Ok(None),
        };
        let base_target = match self
            .pot
            .calculate_required_base_target(&best, ancestor.as_ref())
        {
            Some(base_target) => base_target,
            None => return Ok(None),
        };
        let generation_signature = self.pot.calculate_generation_signature(
            &best.get_generation_signature(),
            &self.key_pair.public_key(),
        );
        let hit = self.pot.calculate_random_hit(&generation_signature);
        Ok(Some(
            self.pot
                .calculate_mining_time_interval(hit, base_target, power),
        ))
    }

    /// Whether the local account may publish the next block at `now`.
    pub fn minable(&self, now: i64) -> Result<bool> {
        let best_timestamp = match &self.state.best {
            Some(best) => best.timestamp(),
            None => return Ok(false),
        };
        Ok(match self.mining_interval()? {
            Some(interval) => now - best_timestamp >= interval as i64,
            None => false,
        })
    }

    fn mine_if_eligible(&mut self, now: i64) -> Result<()> {
        if self.minable(now)? {
            self.mine(now)?;
        }
        Ok(())
    }

    fn mine(&mut self, now: i64) -> Result<()> {
        let best = match &self.state.best {
            Some(best) => best.clone(),
            None => return Ok(()),
        };
        let parent = best.get_block();
        let immutable_height = (parent.get_block_num() + 1)
            .saturating_sub(self.config.consensus.mutable_range);
        let immutable_block_hash = match self
            .storage
            .block_store()
            .main_chain_block_at(&self.chain_id, immutable_height)?
        {
            Some(hash) => hash,
            None => {
                debug!("Chain {} cannot mine before syncing to height {immutable_height}", self.chain_id);
                return Ok(());
            }
        };
        let ancestor = match self.base_target_ancestor(parent, &[])? {
            Ok(ancestor) => ancestor,
            Err(_) => return Ok(()),
        };

        let state_db = self.storage.state_db().clone();
        let tx = match self.state.tx_pool.best_transaction().cloned() {
            Some(tx) => match self.state.tx_pool.check_transaction(&tx, &state_db) {
                Ok(()) => Some(tx),
                Err(_) => {
                    self.state.tx_pool.remove(&tx.tx_id());
                    None
                }
            },
            None => None,
        };

        let synced = self.state.synced_to_genesis();
        let built = build_block(
            &self.pot,
            &self.processor,
            &self.key_pair,
            &self.chain_id,
            BlockTemplate {
                parent,
                ancestor: ancestor.as_ref(),
                immutable_block_hash,
                tx: tx.clone(),
                timestamp: now,
            },
            &state_db,
            synced,
        )?;
        let container = match built {
            Some(container) => container,
            None => {
                if let Some(tx) = tx {
                    self.state.tx_pool.remove(&tx.tx_id());
                }
                return Ok(());
            }
        };

        let track = state_db.start_tracking();
        let outcome = self.processor.forward_process(&container, &track, synced)?;
        if !outcome.is_applied() {
            warn!("Mined block does not apply: {outcome:?}");
            return Ok(());
        }
        track.set_best_block_hash(&self.chain_id, &container.hash());
        let changes = track.into_changes();

        self.storage
            .block_store()
            .save_block_container(&self.chain_id, &container, false)?;
        self.storage.commit_main_chain_update(
            &self.chain_id,
            changes,
            &[],
            std::slice::from_ref(&container),
        )?;

        info!(
            "Mined block {} at height {} on chain {}",
            container.hash(),
            container.block_num(),
            self.chain_id
        );
        if let Some(tx) = container.get_tx() {
            self.state.tx_pool.remove(&tx.tx_id());
        }
        self.state.best = Some(container.clone());
        self.after_best_change(&[], std::slice::from_ref(&container), now)?;
        Ok(())
    }

    /// Pool upkeep, priority peers and tip publication after the best block moved.
    pub(super) fn after_best_change(
        &mut self,
        undo: &[BlockContainer],
        new: &[BlockContainer],
        now: i64,
    ) -> Result<()> {
        let state_db = self.storage.state_db().clone();
        let undone: Vec<Transaction> = undo.iter().filter_map(|c| c.get_tx().cloned()).collect();
        for container in new {
            if let Some(tx) = container.get_tx() {
                self.state.tx_pool.remove(&tx.tx_id());
            }
            self.state.block_buffer.remove(&container.hash());
        }
        let restored = self.state.tx_pool.restore(undone, &state_db)?;
        let mut touched: Vec<PublicKey> = vec![];
        for container in undo.iter().chain(new) {
            for account in container.touched_accounts() {
                if !touched.contains(&account) {
                    touched.push(account);
                }
            }
        }
        let evicted = self.state.tx_pool.recheck_accounts(&touched, &state_db)?;
        if restored > 0 || evicted > 0 {
            debug!("Chain {} pool: {restored} restored, {evicted} evicted", self.chain_id);
        }

        self.refresh_priority_peers()?;
        self.publish_tip(now, true)
    }

    fn refresh_priority_peers(&mut self) -> Result<()> {
        let mut cursor = match &self.state.best {
            Some(best) => best.get_block().clone(),
            None => return Ok(()),
        };
        let mut miners = vec![cursor.get_miner().clone()];
        for _ in 1..self.config.consensus.mutable_range {
            if cursor.is_genesis() {
                break;
            }
            cursor = match self
                .storage
                .block_store()
                .get_block(&self.chain_id, &cursor.get_previous_block_hash())?
            {
                Some(block) => block,
                None => break,
            };
            miners.push(cursor.get_miner().clone());
        }
        self.state.peers.refresh_priority(miners);
        Ok(())
    }

    fn put_mutable(&mut self, channel: Channel, value: Vec<u8>, now: i64) -> Result<()> {
        let seq = self.state.next_seq(now);
        let item = MutableItem::new_signed(&self.key_pair, channel.salt(&self.chain_id), seq, value)?;
        self.dht.put_mutable(item)
    }

    /// Publish the best block on our tip channel; unforced republishing only
    /// happens once per retry period.
    fn publish_tip(&mut self, now: i64, force: bool) -> Result<()> {
        let best = match &self.state.best {
            Some(best) => best.clone(),
            None => return Ok(()),
        };
        let hash = best.hash();
        let fresh = match self.state.last_tip_published {
            Some((published, at)) => {
                published == hash && now - at < self.config.engine.request_retry_secs
            }
            None => false,
        };
        if fresh && !force {
            return Ok(());
        }

        self.dht.put_immutable(hash, best.get_block().serialize()?)?;
        if let Some(tx) = best.get_tx() {
            self.dht.put_immutable(tx.tx_id(), tx.serialize()?)?;
        }
        self.put_mutable(Channel::BlockTip, best.serialize()?, now)?;
        self.state.last_tip_published = Some((hash, now));
        Ok(())
    }

    fn gossip(&mut self, now: i64) -> Result<()> {
        self.publish_tip(now, false)?;

        if let Some(tx) = self.state.tx_pool.best_transaction().cloned() {
            let tx_id = tx.tx_id();
            if self.state.last_tx_published != Some(tx_id) {
                self.dht.put_immutable(tx_id, tx.serialize()?)?;
                self.put_mutable(Channel::TxTip, tx.serialize()?, now)?;
                self.state.last_tx_published = Some(tx_id);
            }
        }

        if let Some(hash) = self.state.wanted_block.take() {
            self.put_mutable(Channel::BlockRequest, hash.as_bytes().to_vec(), now)?;
        }
        if let Some(hash) = self.state.wanted_tx.take() {
            self.put_mutable(Channel::TxRequest, hash.as_bytes().to_vec(), now)?;
        }

        let fan_out = self.state.peers.fan_out();
        for peer in self.state.peers.random_peers(fan_out) {
            self.request_tip(&peer, false);
            let sender = self.event_sender.clone();
            let channels = [
                (Channel::TxTip, RequestContext::TipTx { peer: peer.clone() }),
                (Channel::BlockRequest, RequestContext::BlockRequest { peer: peer.clone() }),
                (Channel::TxRequest, RequestContext::TxRequest { peer: peer.clone() }),
            ];
            for (channel, context) in channels {
                self.dht
                    .request_mutable(&peer, &channel.salt(&self.chain_id), context, sender.clone());
            }
        }

        self.answer_remote_requests()
    }

    fn answer_remote_requests(&mut self) -> Result<()> {
        let store = self.storage.block_store().clone();
        for hash in std::mem::take(&mut self.state.remote_block_requests) {
            if let Some(container) = store.get_block_container(&self.chain_id, &hash)? {
                trace!("Answering remote request for block {hash}");
                self.dht
                    .put_immutable(hash, container.get_block().serialize()?)?;
                if let Some(tx) = container.get_tx() {
                    self.dht.put_immutable(tx.tx_id(), tx.serialize()?)?;
                }
            }
        }
        for hash in std::mem::take(&mut self.state.remote_tx_requests) {
            let tx = match store.get_transaction(&self.chain_id, &hash)? {
                Some(tx) => Some(tx),
                None => self
                    .state
                    .tx_pool
                    .pending()
                    .into_iter()
                    .find(|tx| tx.tx_id() == hash),
            };
            if let Some(tx) = tx {
                self.dht.put_immutable(hash, tx.serialize()?)?;
            }
        }
        Ok(())
    }
}

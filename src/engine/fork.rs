// Backward sync, fork resolution and voting for one chain.
//
// A fork candidate is first walked back through the buffer and the block
// store until it meets the local main chain. Forks that meet it within the
// mutable range are validated block by block and re-branched onto; deeper
// forks either go to a vote (their immutable point leads back to the main
// chain) or are dropped as attack chains.

use crate::consensus::{is_valid_block, Rejection, Validity};
use crate::core::{BlockContainer, Hash, ProcessOutcome};
use crate::engine::chain_state::VotingRound;
use crate::engine::worker::ChainWorker;
use crate::error::Result;
use crate::storage::Repository;
use log::{debug, info, warn};

// sync steps attempted per tick while blocks are available locally
const SYNC_STEPS_PER_TICK: usize = 32;

/// What became of a fork candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkOutcome {
    /// The candidate is now the best block
    Switched,
    /// Data is missing; requests are out and the candidate stays buffered
    Deferred,
    /// Too deep to accept on difficulty alone, a vote was started
    Voting,
    /// The chain view was rebuilt from the candidate
    Resynced,
    /// Not heavier than the best block
    NotBetter,
    Rejected,
    /// Never met the main chain within the attack depth
    Attack,
    /// Rolling back our own blocks failed; nothing was committed
    Aborted,
}

enum Connection {
    /// Blocks from the fork point up to the candidate, low to high
    MainChain(Vec<BlockContainer>),
    Missing,
    Beyond,
    ForeignGenesis,
}

enum DeepFork {
    LeadsToMainChain,
    Unknown,
    Attack,
}

impl ChainWorker {
    /// Backward-apply blocks below the sync pointer for as long as they are
    /// available locally.
    pub(super) fn sync_batch(&mut self, now: i64) -> Result<()> {
        for _ in 0..SYNC_STEPS_PER_TICK {
            if !self.sync_step(now)? {
                break;
            }
        }
        Ok(())
    }

    /// Move the sync pointer one block toward genesis. Returns whether it moved.
    pub(crate) fn sync_step(&mut self, now: i64) -> Result<bool> {
        let sync = match &self.state.sync_block {
            Some(sync) if !sync.get_block().is_genesis() => sync.clone(),
            _ => return Ok(false),
        };
        let parent_hash = sync.previous_hash();
        let parent = match self.lookup_container(&parent_hash)? {
            Some(parent) => parent,
            None => {
                self.request_block(parent_hash, now);
                return Ok(false);
            }
        };

        if let Err(rejection) = self.standalone_check(&parent, now) {
            warn!("Rejecting sync block {parent_hash}: {rejection}");
            self.state.reject(parent_hash);
            return Ok(false);
        }
        if parent.block_num() + 1 != sync.block_num() {
            warn!("Sync block {parent_hash} sits at the wrong height");
            self.state.reject(parent_hash);
            return Ok(false);
        }

        let state_db = self.storage.state_db().clone();
        let track = state_db.start_tracking();
        let installed = self.processor.backward_process(&parent, &track)?;
        track.set_sync_block_hash(&self.chain_id, &parent_hash);
        let changes = track.into_changes();

        self.storage
            .block_store()
            .save_block_container(&self.chain_id, &parent, false)?;
        self.storage.commit_main_chain_update(
            &self.chain_id,
            changes,
            &[],
            std::slice::from_ref(&parent),
        )?;

        debug!(
            "Chain {} synced back to height {} ({installed} account(s) learned)",
            self.chain_id,
            parent.block_num()
        );
        if parent.get_block().is_genesis() {
            info!("Chain {} is synced to genesis", self.chain_id);
        }
        self.state.block_buffer.remove(&parent_hash);
        self.state.sync_block = Some(parent);
        Ok(true)
    }

    /// Try buffered containers heavier than the best block, heaviest first,
    /// until one of them moves the best block or starts a vote. Candidates
    /// that stay incomplete for too long are dropped from the buffer.
    pub(super) fn process_fork_candidates(&mut self, now: i64) -> Result<()> {
        let best_difficulty = self.state.best_cumulative_difficulty();
        let mut candidates: Vec<BlockContainer> = self
            .state
            .block_buffer
            .values()
            .filter(|c| c.cumulative_difficulty() > best_difficulty)
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            b.cumulative_difficulty()
                .cmp(&a.cumulative_difficulty())
                .then_with(|| a.hash().cmp(&b.hash()))
        });

        for candidate in candidates {
            let hash = candidate.hash();
            match self.try_fork(candidate, now, false)? {
                ForkOutcome::Switched | ForkOutcome::Voting | ForkOutcome::Resynced => break,
                ForkOutcome::Deferred => {
                    let waited = self.state.defer(hash, now);
                    if waited > self.config.engine.max_deferral_secs {
                        warn!("Dropping fork candidate {hash}: still incomplete after {waited}s");
                        self.state.block_buffer.remove(&hash);
                        self.state.deferred.remove(&hash);
                    }
                }
                _ => {
                    self.state.deferred.remove(&hash);
                }
            }
        }
        Ok(())
    }

    /// Resolve one candidate tip. `from_vote` marks a tip chosen by a vote,
    /// which may be adopted by resync instead of starting another vote.
    pub(crate) fn try_fork(
        &mut self,
        tip: BlockContainer,
        now: i64,
        from_vote: bool,
    ) -> Result<ForkOutcome> {
        if tip.cumulative_difficulty() <= self.state.best_cumulative_difficulty() {
            return Ok(ForkOutcome::NotBetter);
        }
        if let Err(rejection) = self.standalone_check(&tip, now) {
            warn!("Rejecting fork tip {}: {rejection}", tip.hash());
            self.state.reject(tip.hash());
            return Ok(ForkOutcome::Rejected);
        }

        match self.connect_to_main_chain(&tip, now)? {
            Connection::MainChain(fork) => {
                if let Some(outcome) = self.validate_fork(&fork, now)? {
                    return Ok(outcome);
                }
                for container in &fork {
                    self.storage
                        .block_store()
                        .save_block_container(&self.chain_id, container, false)?;
                }
                self.re_branch(tip, now)
            }
            Connection::Missing => Ok(ForkOutcome::Deferred),
            Connection::ForeignGenesis => {
                warn!("Fork {} descends from another genesis", tip.hash());
                self.state.reject(tip.hash());
                Ok(ForkOutcome::Rejected)
            }
            Connection::Beyond => match self.classify_deep_fork(&tip, now)? {
                DeepFork::Unknown => Ok(ForkOutcome::Deferred),
                DeepFork::Attack => {
                    warn!(
                        "Ignoring fork {} at height {}: no immutable point on our chain",
                        tip.hash(),
                        tip.block_num()
                    );
                    self.state.reject(tip.hash());
                    Ok(ForkOutcome::Attack)
                }
                DeepFork::LeadsToMainChain if from_vote => {
                    info!("Vote chose deep fork {}, resyncing", tip.hash());
                    self.initial_resync(tip, now)?;
                    Ok(ForkOutcome::Resynced)
                }
                DeepFork::LeadsToMainChain => {
                    self.enter_voting(tip, now);
                    Ok(ForkOutcome::Voting)
                }
            },
        }
    }

    // Walk back from `tip` at most a mutable range of blocks.
    fn connect_to_main_chain(&mut self, tip: &BlockContainer, now: i64) -> Result<Connection> {
        let store = self.storage.block_store().clone();
        let mut fork = vec![tip.clone()];
        let mut cursor = tip.clone();

        for _ in 0..self.config.consensus.mutable_range {
            if cursor.get_block().is_genesis() {
                return Ok(Connection::ForeignGenesis);
            }
            let parent_hash = cursor.previous_hash();
            if store.is_main_chain_block(&self.chain_id, &parent_hash)? {
                fork.reverse();
                return Ok(Connection::MainChain(fork));
            }
            cursor = match self.lookup_container(&parent_hash)? {
                Some(parent) => parent,
                None => {
                    self.request_block(parent_hash, now);
                    return Ok(Connection::Missing);
                }
            };
            fork.push(cursor.clone());
        }
        Ok(Connection::Beyond)
    }

    /// Full validation of `fork` (low to high) on top of the main chain.
    /// `None` means every block passed.
    fn validate_fork(&mut self, fork: &[BlockContainer], now: i64) -> Result<Option<ForkOutcome>> {
        for (index, container) in fork.iter().enumerate() {
            let parent = match index {
                0 => self.lookup_block(&container.previous_hash(), &[])?,
                _ => Some(fork[index - 1].get_block().clone()),
            };
            let ancestor = match &parent {
                Some(parent) => match self.base_target_ancestor(parent, fork)? {
                    Ok(ancestor) => ancestor,
                    Err(missing) => {
                        self.request_block(missing, now);
                        return Ok(Some(ForkOutcome::Deferred));
                    }
                },
                None => None,
            };

            let claimed = container.get_block().get_immutable_block_hash();
            let validity = match is_valid_block(
                &self.pot,
                &self.chain_id,
                container,
                parent.as_ref(),
                ancestor.as_ref(),
                now,
            ) {
                Validity::Valid => match self.immutable_point_of(container, fork, now)? {
                    Some(expected) if expected == claimed => Validity::Valid,
                    Some(expected) => Validity::Invalid(Rejection::Malformed(format!(
                        "immutable point {claimed} should be {expected}"
                    ))),
                    None => return Ok(Some(ForkOutcome::Deferred)),
                },
                other => other,
            };

            match validity {
                Validity::Valid => {}
                Validity::MissingParent(hash) => {
                    self.request_block(hash, now);
                    return Ok(Some(ForkOutcome::Deferred));
                }
                Validity::MissingAncestor => return Ok(Some(ForkOutcome::Deferred)),
                Validity::Invalid(rejection) => {
                    warn!(
                        "Rejecting fork block {} at height {}: {rejection}",
                        container.hash(),
                        container.block_num()
                    );
                    for invalid in &fork[index..] {
                        self.state.reject(invalid.hash());
                    }
                    return Ok(Some(ForkOutcome::Rejected));
                }
            }
        }
        Ok(None)
    }

    // Hash of the block a mutable range below `container` on the chain made
    // of `fork` (low to high) on top of the main chain. `None` when that
    // block is not known locally yet.
    fn immutable_point_of(
        &mut self,
        container: &BlockContainer,
        fork: &[BlockContainer],
        now: i64,
    ) -> Result<Option<Hash>> {
        let height = container
            .block_num()
            .saturating_sub(self.config.consensus.mutable_range);
        let fork_base = fork.first().map(|lowest| lowest.block_num()).unwrap_or(0);
        if height >= fork_base {
            let index = (height - fork_base) as usize;
            return Ok(fork.get(index).map(|block| block.hash()));
        }
        if let Some(hash) = self
            .storage
            .block_store()
            .main_chain_block_at(&self.chain_id, height)?
        {
            return Ok(Some(hash));
        }
        let lowest = match fork.first() {
            Some(lowest) => lowest.get_block(),
            None => return Ok(None),
        };
        match self.walk_back(lowest, fork_base - height, fork)? {
            Ok(block) => Ok(Some(block.hash())),
            Err(missing) => {
                self.request_block(missing, now);
                Ok(None)
            }
        }
    }

    // Follow immutable points back toward the main chain.
    fn classify_deep_fork(&mut self, tip: &BlockContainer, now: i64) -> Result<DeepFork> {
        let store = self.storage.block_store().clone();
        let mut point = tip.get_block().get_immutable_block_hash();
        for _ in 0..self.config.consensus.attack_depth {
            if store.is_main_chain_block(&self.chain_id, &point)? {
                return Ok(DeepFork::LeadsToMainChain);
            }
            point = match self.lookup_block(&point, &[])? {
                Some(block) => block.get_immutable_block_hash(),
                None => {
                    self.request_block(point, now);
                    return Ok(DeepFork::Unknown);
                }
            };
        }
        Ok(DeepFork::Attack)
    }

    /// Switch the main chain to end at `tip`.
    ///
    /// Our blocks above the common ancestor are rolled back and the fork's
    /// blocks applied, all on one Track; flag flips, the best pointer and the
    /// account states then land in a single storage transaction. Any failure
    /// leaves storage untouched.
    pub(crate) fn re_branch(&mut self, tip: BlockContainer, now: i64) -> Result<ForkOutcome> {
        let best = match &self.state.best {
            Some(best) => best.clone(),
            None => return Ok(ForkOutcome::NotBetter),
        };
        if tip.cumulative_difficulty() <= best.cumulative_difficulty() {
            return Ok(ForkOutcome::NotBetter);
        }
        let diff = match self
            .storage
            .block_store()
            .get_fork_block_containers_info(&self.chain_id, &tip, &best)?
        {
            Some(diff) => diff,
            None => {
                debug!("Fork {} is not fully stored yet", tip.hash());
                return Ok(ForkOutcome::Deferred);
            }
        };

        let fork_height = diff
            .new
            .last()
            .map(|lowest| lowest.block_num().saturating_sub(1))
            .unwrap_or(0);
        if !self.state.synced_to_genesis() {
            if let Some(sync) = &self.state.sync_block {
                if sync.block_num() > fork_height {
                    debug!(
                        "Fork point {fork_height} is below sync height {}, waiting",
                        sync.block_num()
                    );
                    return Ok(ForkOutcome::Deferred);
                }
            }
        }

        let state_db = self.storage.state_db().clone();
        let track = state_db.start_tracking();

        for container in &diff.undo {
            match self.processor.rollback(container, &track)? {
                ProcessOutcome::Applied(_) => {}
                outcome => {
                    warn!(
                        "Cannot roll back block {} at height {}: {outcome:?}",
                        container.hash(),
                        container.block_num()
                    );
                    return Ok(ForkOutcome::Aborted);
                }
            }
        }

        for container in diff.new.iter().rev() {
            loop {
                let synced = self.state.synced_to_genesis();
                match self.processor.forward_process(container, &track, synced)? {
                    ProcessOutcome::Applied(_) => break,
                    ProcessOutcome::NoAccountInfo(account) => {
                        debug!("History of {account:?} missing, syncing further back");
                        if !self.sync_step(now)? {
                            return Ok(ForkOutcome::Deferred);
                        }
                    }
                    ProcessOutcome::Invalid(reason) => {
                        warn!(
                            "Fork block {} at height {} does not apply: {reason}",
                            container.hash(),
                            container.block_num()
                        );
                        self.state.reject(container.hash());
                        self.state.reject(tip.hash());
                        return Ok(ForkOutcome::Rejected);
                    }
                }
            }
        }

        track.set_best_block_hash(&self.chain_id, &tip.hash());
        let changes = track.into_changes();
        self.storage
            .commit_main_chain_update(&self.chain_id, changes, &diff.undo, &diff.new)?;

        info!(
            "Chain {} re-branched to {} at height {} ({} undone, {} applied)",
            self.chain_id,
            tip.hash(),
            tip.block_num(),
            diff.undo.len(),
            diff.new.len()
        );
        self.state.best = Some(tip);
        self.after_best_change(&diff.undo, &diff.new, now)?;
        Ok(ForkOutcome::Switched)
    }

    fn enter_voting(&mut self, trigger: BlockContainer, now: i64) {
        info!(
            "Chain {} votes on deep fork {} at height {}",
            self.chain_id,
            trigger.hash(),
            trigger.block_num()
        );
        self.state.voting = Some(VotingRound {
            started_at: now,
            trigger: trigger.hash(),
        });
        self.state.voting_pool.clear();
        let weight = self.config.consensus.vote_weight(trigger.block_num());
        self.state.voting_pool.add_tip_vote(trigger, weight);
        if let Some(best) = self.state.best.clone() {
            let weight = self.config.consensus.vote_weight(best.block_num());
            self.state.voting_pool.add_tip_vote(best, weight);
        }
        self.solicit_votes();
    }

    /// Collect tips until quorum or timeout, then follow the heaviest vote.
    pub(super) fn voting_step(&mut self, now: i64) -> Result<()> {
        let round = match &self.state.voting {
            Some(round) => round.clone(),
            None => return Ok(()),
        };
        let quorum = self.state.voting_pool.vote_count() >= self.config.consensus.vote_quorum;
        let timed_out = now - round.started_at >= self.config.consensus.max_block_time as i64;
        if !quorum && !timed_out {
            self.solicit_votes();
            return Ok(());
        }

        let winner = self
            .state
            .voting_pool
            .best_vote()
            .and_then(|(hash, weight)| {
                self.state
                    .voting_pool
                    .best_tip_for(&hash)
                    .cloned()
                    .map(|tip| (hash, weight, tip))
            });
        self.state.voting = None;
        self.state.voting_pool.clear();

        let (point, weight, tip) = match winner {
            Some(winner) => winner,
            None => return Ok(()),
        };
        info!(
            "Chain {} vote settled on immutable point {point} with weight {weight}",
            self.chain_id
        );
        if tip.hash() != round.trigger {
            self.state.reject(round.trigger);
        }
        if tip.cumulative_difficulty() > self.state.best_cumulative_difficulty() {
            let outcome = self.try_fork(tip, now, true)?;
            debug!("Voted fork outcome: {outcome:?}");
        }
        Ok(())
    }

    /// Rebuild this chain's view from `tip` alone: accounts are relearned by
    /// backward sync from `tip` down, the old main chain is demoted and the
    /// transaction pool starts over.
    pub(crate) fn initial_resync(&mut self, tip: BlockContainer, now: i64) -> Result<()> {
        let state_db = self.storage.state_db().clone();
        let store = self.storage.block_store().clone();
        let track = state_db.start_tracking();
        for account in state_db.account_keys(&self.chain_id)? {
            track.delete_account(&self.chain_id, &account);
        }
        self.processor.backward_process(&tip, &track)?;
        let hash = tip.hash();
        track.set_best_block_hash(&self.chain_id, &hash);
        track.set_sync_block_hash(&self.chain_id, &hash);
        let changes = track.into_changes();

        let old_height = self
            .state
            .best
            .as_ref()
            .map(|best| best.block_num())
            .unwrap_or(0);
        let mut flips: Vec<(u64, Hash, bool)> = store
            .main_chain_entries(&self.chain_id, 0, old_height)?
            .into_iter()
            .map(|(height, main)| (height, main, false))
            .collect();
        flips.push((tip.block_num(), hash, true));

        store.save_block_container(&self.chain_id, &tip, false)?;
        self.storage
            .commit_flag_changes(&self.chain_id, changes, &flips)?;

        info!(
            "Chain {} resynced at height {} ({hash})",
            self.chain_id,
            tip.block_num()
        );
        self.state.tx_pool.clear();
        self.state.clear_transient();
        self.state.retain_ancestors_of(&tip);
        self.state.best = Some(tip.clone());
        self.state.sync_block = Some(tip);
        self.after_best_change(&[], &[], now)
    }
}

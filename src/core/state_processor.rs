// Applies one block's effects to a Track, or undoes them. Nothing here
// commits: callers decide whether the Track's writes become durable.

use crate::core::{AccountSnapshot, AccountState, BlockContainer, ChainId, PublicKey, TxKind};
use crate::error::Result;
use crate::storage::{Repository, Track};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Post-block states of every touched account, in touch order
    Applied(Vec<AccountSnapshot>),
    /// History of this account is not known locally yet
    NoAccountInfo(PublicKey),
    Invalid(String),
}

impl ProcessOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ProcessOutcome::Applied(_))
    }
}

// Working set of account states for one block, kept in touch order.
struct Ledger {
    order: Vec<PublicKey>,
    states: HashMap<PublicKey, AccountState>,
}

impl Ledger {
    fn get_mut(&mut self, public_key: &PublicKey) -> &mut AccountState {
        if !self.states.contains_key(public_key) {
            self.order.push(public_key.clone());
        }
        self.states.entry(public_key.clone()).or_default()
    }

    fn snapshots(&self) -> Vec<AccountSnapshot> {
        self.order
            .iter()
            .map(|key| {
                AccountSnapshot::new(key.clone(), self.states.get(key).copied().unwrap_or_default())
            })
            .collect()
    }
}

pub struct StateProcessor {
    chain_id: ChainId,
}

impl StateProcessor {
    pub fn new(chain_id: ChainId) -> StateProcessor {
        StateProcessor { chain_id }
    }

    /// Load every touched account. Unknown accounts are fresh once the chain
    /// is synced back to genesis, and missing history before that.
    fn load(
        &self,
        container: &BlockContainer,
        repo: &dyn Repository,
        synced_to_genesis: bool,
    ) -> Result<std::result::Result<Ledger, PublicKey>> {
        let mut ledger = Ledger {
            order: vec![],
            states: HashMap::new(),
        };
        for public_key in container.touched_accounts() {
            let state = match repo.account(&self.chain_id, &public_key)? {
                Some(state) => state,
                None if synced_to_genesis || container.get_block().is_genesis() => {
                    AccountState::default()
                }
                None => return Ok(Err(public_key)),
            };
            ledger.order.push(public_key.clone());
            ledger.states.insert(public_key, state);
        }
        Ok(Ok(ledger))
    }

    /// Compute post-block states without writing anything.
    pub fn preview(
        &self,
        container: &BlockContainer,
        repo: &dyn Repository,
        synced_to_genesis: bool,
    ) -> Result<ProcessOutcome> {
        let mut ledger = match self.load(container, repo, synced_to_genesis)? {
            Ok(ledger) => ledger,
            Err(missing) => return Ok(ProcessOutcome::NoAccountInfo(missing)),
        };
        let miner = container.get_block().get_miner().clone();

        let tx = match container.get_tx() {
            Some(tx) => tx,
            None => return Ok(ProcessOutcome::Applied(ledger.snapshots())),
        };

        if let TxKind::Genesis { accounts } = tx.get_kind() {
            for account in accounts {
                *ledger.get_mut(&account.public_key) = account.state;
            }
            return Ok(ProcessOutcome::Applied(ledger.snapshots()));
        }

        let cost = match tx.total_cost() {
            Some(cost) => cost,
            None => return Ok(ProcessOutcome::Invalid("amount overflow".to_string())),
        };
        let sender = ledger.get_mut(tx.get_sender());
        let next_nonce = match sender.nonce.checked_add(1) {
            Some(next_nonce) => next_nonce,
            None => return Ok(ProcessOutcome::Invalid("sender nonce overflow".to_string())),
        };
        if tx.get_nonce() != next_nonce {
            return Ok(ProcessOutcome::Invalid(format!(
                "nonce {} does not follow {}",
                tx.get_nonce(),
                sender.nonce
            )));
        }
        if sender.balance < cost {
            return Ok(ProcessOutcome::Invalid(format!(
                "sender balance {} below cost {cost}",
                sender.balance
            )));
        }
        sender.balance -= cost;
        sender.nonce = next_nonce;

        if let TxKind::Wiring { receiver, amount } = tx.get_kind() {
            let receiver = ledger.get_mut(receiver);
            receiver.balance = match receiver.balance.checked_add(*amount) {
                Some(balance) => balance,
                None => return Ok(ProcessOutcome::Invalid("receiver overflow".to_string())),
            };
        }

        let miner_state = ledger.get_mut(&miner);
        miner_state.balance = match miner_state.balance.checked_add(tx.get_fee()) {
            Some(balance) => balance,
            None => return Ok(ProcessOutcome::Invalid("miner overflow".to_string())),
        };

        Ok(ProcessOutcome::Applied(ledger.snapshots()))
    }

    /// Apply `container` to `track`, checking the block's own snapshots
    /// against the recomputed states.
    pub fn forward_process(
        &self,
        container: &BlockContainer,
        track: &Track<'_>,
        synced_to_genesis: bool,
    ) -> Result<ProcessOutcome> {
        let outcome = self.preview(container, track, synced_to_genesis)?;
        let snapshots = match &outcome {
            ProcessOutcome::Applied(snapshots) => snapshots,
            _ => return Ok(outcome),
        };

        let block = container.get_block();
        if snapshots.len() != block.get_account_snapshots().len() {
            return Ok(ProcessOutcome::Invalid(
                "snapshot count does not match touched accounts".to_string(),
            ));
        }
        for snapshot in snapshots {
            if block.snapshot_of(&snapshot.public_key) != Some(snapshot.state) {
                return Ok(ProcessOutcome::Invalid(format!(
                    "snapshot of {:?} does not match recomputed state",
                    snapshot.public_key
                )));
            }
        }

        for snapshot in snapshots {
            track.set_account(&self.chain_id, &snapshot.public_key, &snapshot.state)?;
        }
        Ok(outcome)
    }

    /// Exact inverse of `forward_process` for a block on top of `track`.
    pub fn rollback(&self, container: &BlockContainer, track: &Track<'_>) -> Result<ProcessOutcome> {
        let block = container.get_block();
        if block.is_genesis() {
            return Ok(ProcessOutcome::Invalid("genesis cannot be rolled back".to_string()));
        }

        let mut ledger = match self.load(container, track, false)? {
            Ok(ledger) => ledger,
            Err(missing) => return Ok(ProcessOutcome::NoAccountInfo(missing)),
        };
        for snapshot in block.get_account_snapshots() {
            if ledger.states.get(&snapshot.public_key) != Some(&snapshot.state) {
                return Ok(ProcessOutcome::Invalid(format!(
                    "{:?} is not at this block's state",
                    snapshot.public_key
                )));
            }
        }

        if let Some(tx) = container.get_tx() {
            let cost = match tx.total_cost() {
                Some(cost) => cost,
                None => return Ok(ProcessOutcome::Invalid("amount overflow".to_string())),
            };
            let miner_state = ledger.get_mut(block.get_miner());
            miner_state.balance = match miner_state.balance.checked_sub(tx.get_fee()) {
                Some(balance) => balance,
                None => return Ok(ProcessOutcome::Invalid("miner underflow".to_string())),
            };
            if let TxKind::Wiring { receiver, amount } = tx.get_kind() {
                let receiver = ledger.get_mut(receiver);
                receiver.balance = match receiver.balance.checked_sub(*amount) {
                    Some(balance) => balance,
                    None => return Ok(ProcessOutcome::Invalid("receiver underflow".to_string())),
                };
            }
            let sender = ledger.get_mut(tx.get_sender());
            if sender.nonce == 0 {
                return Ok(ProcessOutcome::Invalid("sender nonce underflow".to_string()));
            }
            sender.nonce -= 1;
            sender.balance = match sender.balance.checked_add(cost) {
                Some(balance) => balance,
                None => return Ok(ProcessOutcome::Invalid("sender overflow".to_string())),
            };
        }

        let snapshots = ledger.snapshots();
        for snapshot in &snapshots {
            track.set_account(&self.chain_id, &snapshot.public_key, &snapshot.state)?;
        }
        Ok(ProcessOutcome::Applied(snapshots))
    }

    /// Install the block's snapshots for accounts not known locally. Walking
    /// from the tip down, the first snapshot seen is the account's latest.
    pub fn backward_process(&self, container: &BlockContainer, track: &Track<'_>) -> Result<usize> {
        let mut installed = 0;
        for snapshot in container.get_block().get_account_snapshots() {
            if track.account(&self.chain_id, &snapshot.public_key)?.is_none() {
                track.set_account(&self.chain_id, &snapshot.public_key, &snapshot.state)?;
                installed += 1;
            }
        }
        Ok(installed)
    }
}

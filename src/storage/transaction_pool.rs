use crate::core::{ChainId, Hash, PublicKey, Transaction};
use crate::error::{ChainError, Result};
use crate::storage::Repository;
use log::{debug, trace};
use std::collections::HashMap;

/// Pending transactions of one chain, at most one per sender.
///
/// A transaction is admitted only if it is the sender's next nonce and the
/// sender can pay amount plus fee against the current best state.
pub struct TransactionPool {
    chain_id: ChainId,
    capacity: usize,
    // K -> sender, V -> pending transaction
    inner: HashMap<PublicKey, Transaction>,
}

impl TransactionPool {
    pub fn new(chain_id: ChainId, capacity: usize) -> TransactionPool {
        TransactionPool {
            chain_id,
            capacity,
            inner: HashMap::new(),
        }
    }

    /// Why `tx` cannot be mined on top of `repo`, if anything.
    pub fn check_transaction(&self, tx: &Transaction, repo: &dyn Repository) -> Result<()> {
        if tx.get_chain_id() != &self.chain_id {
            return Err(ChainError::Transaction("wrong chain".to_string()));
        }
        if tx.is_genesis() {
            return Err(ChainError::Transaction(
                "genesis transactions cannot be pooled".to_string(),
            ));
        }
        if tx.get_receiver() == Some(tx.get_sender()) {
            return Err(ChainError::Transaction("transfer to self".to_string()));
        }
        if !tx.verify_signature() {
            return Err(ChainError::Transaction("bad signature".to_string()));
        }
        let account = repo
            .account(&self.chain_id, tx.get_sender())?
            .ok_or_else(|| ChainError::Transaction("unknown sender".to_string()))?;
        let expected = account
            .nonce
            .checked_add(1)
            .ok_or_else(|| ChainError::Transaction("sender nonce exhausted".to_string()))?;
        if tx.get_nonce() != expected {
            return Err(ChainError::Transaction(format!(
                "nonce {} (expected {expected})",
                tx.get_nonce()
            )));
        }
        let cost = tx
            .total_cost()
            .ok_or_else(|| ChainError::Transaction("amount overflow".to_string()))?;
        if account.balance < cost {
            return Err(ChainError::Transaction(format!(
                "balance {} below cost {cost}",
                account.balance
            )));
        }
        Ok(())
    }

    /// Admit `tx`, replacing the sender's pending transaction if it pays more.
    pub fn add_transaction(&mut self, tx: Transaction, repo: &dyn Repository) -> Result<()> {
        self.check_transaction(&tx, repo)?;

        let sender = tx.get_sender().clone();
        if let Some(pending) = self.inner.get(&sender) {
            if pending.tx_id() == tx.tx_id() {
                return Ok(());
            }
            if pending.get_fee() >= tx.get_fee() {
                return Err(ChainError::Transaction(
                    "sender already has a pending transaction with a higher fee".to_string(),
                ));
            }
        } else if self.inner.len() >= self.capacity {
            let cheapest = self
                .inner
                .values()
                .min_by_key(|pending| pending.get_fee())
                .map(|pending| (pending.get_sender().clone(), pending.get_fee()));
            match cheapest {
                Some((evicted, fee)) if fee < tx.get_fee() => {
                    self.inner.remove(&evicted);
                }
                _ => return Err(ChainError::Transaction("pool is full".to_string())),
            }
        }

        trace!("Pooled tx {} on chain {}", tx.tx_id(), self.chain_id);
        self.inner.insert(sender, tx);
        Ok(())
    }

    /// Highest fee first; equal fees go to the lower tx id.
    pub fn best_transaction(&self) -> Option<&Transaction> {
        self.inner.values().max_by(|a, b| {
            a.get_fee()
                .cmp(&b.get_fee())
                .then_with(|| b.tx_id().cmp(&a.tx_id()))
        })
    }

    pub fn get(&self, sender: &PublicKey) -> Option<&Transaction> {
        self.inner.get(sender)
    }

    pub fn contains(&self, tx_id: &Hash) -> bool {
        self.inner.values().any(|tx| tx.tx_id() == *tx_id)
    }

    pub fn remove(&mut self, tx_id: &Hash) -> Option<Transaction> {
        let sender = self
            .inner
            .iter()
            .find(|(_, tx)| tx.tx_id() == *tx_id)
            .map(|(sender, _)| sender.clone())?;
        self.inner.remove(&sender)
    }

    /// Re-validate the pending transactions of `accounts`, evicting the ones
    /// that no longer apply.
    pub fn recheck_accounts(&mut self, accounts: &[PublicKey], repo: &dyn Repository) -> Result<usize> {
        let mut evicted = 0;
        for account in accounts {
            let tx = match self.inner.get(account) {
                Some(tx) => tx,
                None => continue,
            };
            match self.check_transaction(tx, repo) {
                Ok(()) => {}
                Err(ChainError::Transaction(reason)) => {
                    debug!("Evicting tx {} from pool: {reason}", tx.tx_id());
                    self.inner.remove(account);
                    evicted += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(evicted)
    }

    /// Return transactions of rolled back blocks to the pool when still valid.
    pub fn restore(&mut self, txs: Vec<Transaction>, repo: &dyn Repository) -> Result<usize> {
        let mut restored = 0;
        for tx in txs {
            if tx.is_genesis() {
                continue;
            }
            match self.add_transaction(tx, repo) {
                Ok(()) => restored += 1,
                Err(ChainError::Transaction(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(restored)
    }

    pub fn pending(&self) -> Vec<Transaction> {
        let mut pending: Vec<Transaction> = self.inner.values().cloned().collect();
        pending.sort_by(|a, b| b.get_fee().cmp(&a.get_fee()));
        pending
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::KeyPair;
    use crate::core::{AccountState, TxKind};
    use crate::storage::StateDb;

    fn chain() -> ChainId {
        ChainId::new(b"pool".to_vec())
    }

    fn state_db() -> StateDb {
        let db = sled::Config::new().temporary(true).open().unwrap();
        StateDb::new(db.open_tree("state").unwrap())
    }

    fn fund(db: &StateDb, owner: &KeyPair, state: AccountState) {
        let track = db.start_tracking();
        track
            .set_account(&chain(), &owner.public_key(), &state)
            .unwrap();
        track.commit().unwrap();
    }

    fn wiring(sender: &KeyPair, nonce: u64, fee: u64, amount: u64) -> Transaction {
        let receiver = KeyPair::generate().unwrap();
        Transaction::new_signed(
            sender,
            chain(),
            1_700_000_000,
            fee,
            nonce,
            TxKind::Wiring {
                receiver: receiver.public_key(),
                amount,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_admission_checks_nonce_and_balance() {
        let db = state_db();
        let alice = KeyPair::generate().unwrap();
        fund(&db, &alice, AccountState::new(50, 2));
        let mut pool = TransactionPool::new(chain(), 10);

        assert!(pool.add_transaction(wiring(&alice, 2, 1, 10), &db).is_err());
        assert!(pool.add_transaction(wiring(&alice, 3, 1, 50), &db).is_err());
        assert!(pool.add_transaction(wiring(&alice, 3, 1, 49), &db).is_ok());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_exhausted_nonce_is_rejected() {
        let db = state_db();
        let alice = KeyPair::generate().unwrap();
        fund(&db, &alice, AccountState::new(50, u64::MAX));
        let mut pool = TransactionPool::new(chain(), 10);

        assert!(pool.add_transaction(wiring(&alice, u64::MAX, 1, 10), &db).is_err());
        assert!(pool.add_transaction(wiring(&alice, 0, 1, 10), &db).is_err());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_unknown_sender_is_rejected() {
        let db = state_db();
        let stranger = KeyPair::generate().unwrap();
        let mut pool = TransactionPool::new(chain(), 10);
        assert!(pool.add_transaction(wiring(&stranger, 1, 1, 1), &db).is_err());
    }

    #[test]
    fn test_higher_fee_replaces_pending_transaction() {
        let db = state_db();
        let alice = KeyPair::generate().unwrap();
        fund(&db, &alice, AccountState::new(100, 0));
        let mut pool = TransactionPool::new(chain(), 10);

        pool.add_transaction(wiring(&alice, 1, 2, 10), &db).unwrap();
        assert!(pool.add_transaction(wiring(&alice, 1, 1, 10), &db).is_err());
        pool.add_transaction(wiring(&alice, 1, 5, 10), &db).unwrap();

        assert_eq!(pool.len(), 1);
        assert_eq!(pool.get(&alice.public_key()).unwrap().get_fee(), 5);
    }

    #[test]
    fn test_best_transaction_prefers_fee() {
        let db = state_db();
        let alice = KeyPair::generate().unwrap();
        let bob = KeyPair::generate().unwrap();
        fund(&db, &alice, AccountState::new(100, 0));
        fund(&db, &bob, AccountState::new(100, 0));
        let mut pool = TransactionPool::new(chain(), 10);

        pool.add_transaction(wiring(&alice, 1, 3, 10), &db).unwrap();
        pool.add_transaction(wiring(&bob, 1, 9, 10), &db).unwrap();
        assert_eq!(pool.best_transaction().unwrap().get_sender(), &bob.public_key());
    }

    #[test]
    fn test_recheck_evicts_spent_transactions() {
        let db = state_db();
        let alice = KeyPair::generate().unwrap();
        fund(&db, &alice, AccountState::new(100, 0));
        let mut pool = TransactionPool::new(chain(), 10);
        pool.add_transaction(wiring(&alice, 1, 1, 10), &db).unwrap();

        // a block elsewhere consumed alice's nonce 1
        fund(&db, &alice, AccountState::new(80, 1));
        let evicted = pool.recheck_accounts(&[alice.public_key()], &db).unwrap();
        assert_eq!(evicted, 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_full_pool_evicts_cheapest_only_for_better_fee() {
        let db = state_db();
        let mut pool = TransactionPool::new(chain(), 1);
        let alice = KeyPair::generate().unwrap();
        let bob = KeyPair::generate().unwrap();
        let carol = KeyPair::generate().unwrap();
        for owner in [&alice, &bob, &carol] {
            fund(&db, owner, AccountState::new(100, 0));
        }

        pool.add_transaction(wiring(&alice, 1, 5, 1), &db).unwrap();
        assert!(pool.add_transaction(wiring(&bob, 1, 5, 1), &db).is_err());
        pool.add_transaction(wiring(&carol, 1, 6, 1), &db).unwrap();
        assert!(pool.get(&carol.public_key()).is_some());
        assert_eq!(pool.len(), 1);
    }
}

// Account ledger and per-chain metadata, with nested read-through Tracks.
// Nothing consensus-driven reaches the sled tree except through a Track
// commit (or a Track's changes handed to Storage::commit_main_chain_update).

use crate::core::{AccountState, ChainId, Hash, PublicKey};
use crate::error::{ChainError, Result};
use crate::utils::{deserialize, serialize};
use sled::Tree;
use std::cell::RefCell;
use std::collections::BTreeMap;

/// Buffered writes: `None` marks a deletion.
pub type ChangeSet = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

const PRESENT: &[u8] = &[1];

pub(crate) mod keys {
    use crate::core::{ChainId, PublicKey};

    pub fn account_prefix(chain_id: &ChainId) -> Vec<u8> {
        format!("account:{}:", chain_id.to_hex()).into_bytes()
    }

    pub fn account(chain_id: &ChainId, public_key: &PublicKey) -> Vec<u8> {
        let mut key = account_prefix(chain_id);
        key.extend(public_key.to_hex().into_bytes());
        key
    }

    pub fn best_block(chain_id: &ChainId) -> Vec<u8> {
        format!("best:{}", chain_id.to_hex()).into_bytes()
    }

    pub fn sync_block(chain_id: &ChainId) -> Vec<u8> {
        format!("sync:{}", chain_id.to_hex()).into_bytes()
    }

    pub fn peer_prefix(chain_id: &ChainId) -> Vec<u8> {
        format!("peer:{}:", chain_id.to_hex()).into_bytes()
    }

    pub fn peer(chain_id: &ChainId, public_key: &PublicKey) -> Vec<u8> {
        let mut key = peer_prefix(chain_id);
        key.extend(public_key.to_hex().into_bytes());
        key
    }

    pub const FOLLOW_PREFIX: &str = "follow:";

    pub fn follow(chain_id: &ChainId) -> Vec<u8> {
        format!("{FOLLOW_PREFIX}{}", chain_id.to_hex()).into_bytes()
    }
}

fn decode_hash(bytes: Option<Vec<u8>>) -> Result<Option<Hash>> {
    match bytes {
        None => Ok(None),
        Some(bytes) => Hash::from_slice(&bytes)
            .map(Some)
            .ok_or_else(|| ChainError::Database("Stored block pointer is corrupted".to_string())),
    }
}

/// Anything accounts and chain pointers can be read from and written to.
pub trait Repository {
    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Apply every change or none of them.
    fn write_changes(&self, changes: ChangeSet) -> Result<()>;

    fn start_tracking(&self) -> Track<'_>
    where
        Self: Sized,
    {
        Track::new(self)
    }

    fn account(&self, chain_id: &ChainId, public_key: &PublicKey) -> Result<Option<AccountState>> {
        match self.get_raw(&keys::account(chain_id, public_key))? {
            Some(bytes) => Ok(Some(deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn best_block_hash(&self, chain_id: &ChainId) -> Result<Option<Hash>> {
        decode_hash(self.get_raw(&keys::best_block(chain_id))?)
    }

    fn sync_block_hash(&self, chain_id: &ChainId) -> Result<Option<Hash>> {
        decode_hash(self.get_raw(&keys::sync_block(chain_id))?)
    }

    fn is_following(&self, chain_id: &ChainId) -> Result<bool> {
        Ok(self.get_raw(&keys::follow(chain_id))?.is_some())
    }
}

/// Root of the tracking hierarchy, backed by the `state` sled tree.
#[derive(Clone)]
pub struct StateDb {
    tree: Tree,
}

impl StateDb {
    pub fn new(tree: Tree) -> StateDb {
        StateDb { tree }
    }

    pub(crate) fn tree(&self) -> &Tree {
        &self.tree
    }

    fn scan_suffixes(&self, prefix: &[u8]) -> Result<Vec<String>> {
        let mut suffixes = vec![];
        for item in self.tree.scan_prefix(prefix) {
            let (key, _) = item?;
            let suffix = String::from_utf8_lossy(&key[prefix.len()..]).to_string();
            suffixes.push(suffix);
        }
        Ok(suffixes)
    }

    pub fn followed_chains(&self) -> Result<Vec<ChainId>> {
        self.scan_suffixes(keys::FOLLOW_PREFIX.as_bytes())?
            .iter()
            .map(|hex| ChainId::from_hex(hex))
            .collect()
    }

    pub fn peers(&self, chain_id: &ChainId) -> Result<Vec<PublicKey>> {
        self.scan_suffixes(&keys::peer_prefix(chain_id))?
            .iter()
            .map(|hex| PublicKey::from_hex(hex))
            .collect()
    }

    pub fn account_keys(&self, chain_id: &ChainId) -> Result<Vec<PublicKey>> {
        self.scan_suffixes(&keys::account_prefix(chain_id))?
            .iter()
            .map(|hex| PublicKey::from_hex(hex))
            .collect()
    }

    /// Deletions for every record of `chain_id`.
    pub fn chain_wipe(&self, chain_id: &ChainId) -> Result<ChangeSet> {
        let mut changes = ChangeSet::new();
        for prefix in [keys::account_prefix(chain_id), keys::peer_prefix(chain_id)] {
            for item in self.tree.scan_prefix(&prefix) {
                let (key, _) = item?;
                changes.insert(key.to_vec(), None);
            }
        }
        changes.insert(keys::best_block(chain_id), None);
        changes.insert(keys::sync_block(chain_id), None);
        changes.insert(keys::follow(chain_id), None);
        Ok(changes)
    }
}

impl Repository for StateDb {
    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.tree.get(key)?.map(|value| value.to_vec()))
    }

    fn write_changes(&self, changes: ChangeSet) -> Result<()> {
        let mut batch = sled::Batch::default();
        for (key, value) in changes {
            match value {
                Some(value) => batch.insert(key, value),
                None => batch.remove(key),
            }
        }
        self.tree.apply_batch(batch)?;
        Ok(())
    }
}

/// Copy-on-write view over a parent repository.
///
/// Reads fall through to the parent for keys not written here. A Track is
/// owned by exactly one consensus operation at a time and is not `Sync`.
pub struct Track<'a> {
    parent: &'a dyn Repository,
    buffer: RefCell<ChangeSet>,
}

impl<'a> Track<'a> {
    pub fn new(parent: &'a dyn Repository) -> Track<'a> {
        Track {
            parent,
            buffer: RefCell::new(ChangeSet::new()),
        }
    }

    /// Flush buffered writes to the parent as one batch and clear the buffer.
    pub fn commit(&self) -> Result<()> {
        let changes = std::mem::take(&mut *self.buffer.borrow_mut());
        if changes.is_empty() {
            return Ok(());
        }
        self.parent.write_changes(changes)
    }

    pub fn rollback(&self) {
        self.buffer.borrow_mut().clear();
    }

    /// Hand the buffer over instead of committing it to the parent.
    pub fn into_changes(self) -> ChangeSet {
        self.buffer.into_inner()
    }

    pub fn is_dirty(&self) -> bool {
        !self.buffer.borrow().is_empty()
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) {
        self.buffer.borrow_mut().insert(key, Some(value));
    }

    fn delete(&self, key: Vec<u8>) {
        self.buffer.borrow_mut().insert(key, None);
    }

    pub fn set_account(
        &self,
        chain_id: &ChainId,
        public_key: &PublicKey,
        state: &AccountState,
    ) -> Result<()> {
        self.put(keys::account(chain_id, public_key), serialize(state)?);
        Ok(())
    }

    pub fn delete_account(&self, chain_id: &ChainId, public_key: &PublicKey) {
        self.delete(keys::account(chain_id, public_key));
    }

    pub fn set_best_block_hash(&self, chain_id: &ChainId, hash: &Hash) {
        self.put(keys::best_block(chain_id), hash.as_bytes().to_vec());
    }

    pub fn set_sync_block_hash(&self, chain_id: &ChainId, hash: &Hash) {
        self.put(keys::sync_block(chain_id), hash.as_bytes().to_vec());
    }

    pub fn clear_chain_pointers(&self, chain_id: &ChainId) {
        self.delete(keys::best_block(chain_id));
        self.delete(keys::sync_block(chain_id));
    }

    pub fn add_peer(&self, chain_id: &ChainId, public_key: &PublicKey) {
        self.put(keys::peer(chain_id, public_key), PRESENT.to_vec());
    }

    pub fn follow_chain(&self, chain_id: &ChainId) {
        self.put(keys::follow(chain_id), PRESENT.to_vec());
    }

    pub fn unfollow_chain(&self, chain_id: &ChainId) {
        self.delete(keys::follow(chain_id));
    }
}

impl Repository for Track<'_> {
    fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.buffer.borrow().get(key) {
            return Ok(value.clone());
        }
        self.parent.get_raw(key)
    }

    fn write_changes(&self, changes: ChangeSet) -> Result<()> {
        self.buffer.borrow_mut().extend(changes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_db() -> StateDb {
        let db = sled::Config::new().temporary(true).open().unwrap();
        StateDb::new(db.open_tree("state").unwrap())
    }

    fn chain() -> ChainId {
        ChainId::new(b"ledger".to_vec())
    }

    fn alice() -> PublicKey {
        PublicKey::new(vec![0xa1; 65])
    }

    fn bob() -> PublicKey {
        PublicKey::new(vec![0xb0; 65])
    }

    #[test]
    fn test_track_reads_through_and_commits() {
        let db = state_db();
        let track = db.start_tracking();
        track
            .set_account(&chain(), &alice(), &AccountState::new(100, 0))
            .unwrap();

        assert_eq!(
            track.account(&chain(), &alice()).unwrap(),
            Some(AccountState::new(100, 0))
        );
        assert_eq!(db.account(&chain(), &alice()).unwrap(), None);

        track.commit().unwrap();
        assert!(!track.is_dirty());
        assert_eq!(
            db.account(&chain(), &alice()).unwrap(),
            Some(AccountState::new(100, 0))
        );
    }

    #[test]
    fn test_sibling_rollback_keeps_only_committed_writes() {
        let db = state_db();
        let committed = db.start_tracking();
        let abandoned = db.start_tracking();

        committed
            .set_account(&chain(), &alice(), &AccountState::new(100, 0))
            .unwrap();
        abandoned
            .set_account(&chain(), &bob(), &AccountState::new(100, 0))
            .unwrap();
        abandoned
            .set_account(&chain(), &alice(), &AccountState::new(7, 0))
            .unwrap();

        committed.commit().unwrap();
        abandoned.rollback();

        assert_eq!(
            db.account(&chain(), &alice()).unwrap(),
            Some(AccountState::new(100, 0))
        );
        assert_eq!(db.account(&chain(), &bob()).unwrap(), None);
        // the rolled back track now just reads through
        assert_eq!(abandoned.account(&chain(), &bob()).unwrap(), None);
    }

    #[test]
    fn test_nested_track_commits_into_parent_only() {
        let db = state_db();
        let outer = db.start_tracking();
        {
            let inner = outer.start_tracking();
            inner.set_best_block_hash(&chain(), &Hash::digest(b"tip"));
            inner.commit().unwrap();
        }
        assert_eq!(
            outer.best_block_hash(&chain()).unwrap(),
            Some(Hash::digest(b"tip"))
        );
        assert_eq!(db.best_block_hash(&chain()).unwrap(), None);

        outer.commit().unwrap();
        assert_eq!(
            db.best_block_hash(&chain()).unwrap(),
            Some(Hash::digest(b"tip"))
        );
    }

    #[test]
    fn test_deletions_shadow_parent_values() {
        let db = state_db();
        let setup = db.start_tracking();
        setup
            .set_account(&chain(), &alice(), &AccountState::new(1, 1))
            .unwrap();
        setup.commit().unwrap();

        let track = db.start_tracking();
        track.delete_account(&chain(), &alice());
        assert_eq!(track.account(&chain(), &alice()).unwrap(), None);
        track.commit().unwrap();
        assert_eq!(db.account(&chain(), &alice()).unwrap(), None);
    }

    #[test]
    fn test_prefix_scans_and_chain_wipe() {
        let db = state_db();
        let track = db.start_tracking();
        track.follow_chain(&chain());
        track.add_peer(&chain(), &bob());
        track
            .set_account(&chain(), &alice(), &AccountState::new(3, 0))
            .unwrap();
        track.commit().unwrap();

        assert_eq!(db.followed_chains().unwrap(), vec![chain()]);
        assert_eq!(db.peers(&chain()).unwrap(), vec![bob()]);
        assert_eq!(db.account_keys(&chain()).unwrap(), vec![alice()]);

        let wipe = db.chain_wipe(&chain()).unwrap();
        db.write_changes(wipe).unwrap();
        assert!(db.followed_chains().unwrap().is_empty());
        assert!(db.account_keys(&chain()).unwrap().is_empty());
        assert!(!db.is_following(&chain()).unwrap());
    }
}

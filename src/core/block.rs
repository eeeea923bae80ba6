use crate::account::KeyPair;
use crate::core::transaction::put_bytes;
use crate::core::{AccountSnapshot, AccountState, ChainId, Hash, PublicKey, Transaction};
use crate::error::Result;
use crate::utils::{deserialize, ecdsa_p256_sha256_sign_verify, serialize};
use serde::{Deserialize, Serialize};

/// Header fields chosen by the miner before the block is signed.
#[derive(Debug, Clone)]
pub struct NewBlock {
    pub chain_id: ChainId,
    pub block_num: u64,
    pub previous_block_hash: Hash,
    pub immutable_block_hash: Hash,
    pub base_target: u64,
    pub cumulative_difficulty: u64,
    pub generation_signature: Hash,
    pub timestamp: i64,
    pub tx_hash: Option<Hash>,
    pub miner: PublicKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Block {
    chain_id: ChainId,
    block_num: u64,
    previous_block_hash: Hash,
    immutable_block_hash: Hash,
    base_target: u64,
    cumulative_difficulty: u64,
    generation_signature: Hash,
    timestamp: i64,
    tx_hash: Option<Hash>,
    miner: PublicKey,
    account_snapshots: Vec<AccountSnapshot>,
    signature: Vec<u8>,
}

impl Block {
    pub fn new_unsigned(fields: NewBlock) -> Block {
        Block {
            chain_id: fields.chain_id,
            block_num: fields.block_num,
            previous_block_hash: fields.previous_block_hash,
            immutable_block_hash: fields.immutable_block_hash,
            base_target: fields.base_target,
            cumulative_difficulty: fields.cumulative_difficulty,
            generation_signature: fields.generation_signature,
            timestamp: fields.timestamp,
            tx_hash: fields.tx_hash,
            miner: fields.miner,
            account_snapshots: vec![],
            signature: vec![],
        }
    }

    /// Replace the post-state snapshots; any existing signature is invalidated.
    pub fn set_account_snapshots(&mut self, snapshots: Vec<AccountSnapshot>) {
        self.account_snapshots = snapshots;
        self.signature.clear();
    }

    pub fn sign(&mut self, key_pair: &KeyPair) -> Result<()> {
        self.signature = key_pair.sign(&self.preimage(false))?;
        Ok(())
    }

    pub fn verify_signature(&self) -> bool {
        !self.signature.is_empty()
            && ecdsa_p256_sha256_sign_verify(
                self.miner.as_bytes(),
                &self.signature,
                &self.preimage(false),
            )
    }

    /// Content address of the block, covering the signature.
    pub fn hash(&self) -> Hash {
        Hash::digest(&self.preimage(true))
    }

    fn preimage(&self, with_signature: bool) -> Vec<u8> {
        let mut data = vec![];
        put_bytes(&mut data, self.chain_id.as_bytes());
        data.extend(self.block_num.to_be_bytes());
        data.extend(self.previous_block_hash.as_bytes());
        data.extend(self.immutable_block_hash.as_bytes());
        data.extend(self.base_target.to_be_bytes());
        data.extend(self.cumulative_difficulty.to_be_bytes());
        data.extend(self.generation_signature.as_bytes());
        data.extend(self.timestamp.to_be_bytes());
        match &self.tx_hash {
            Some(hash) => {
                data.push(1);
                data.extend(hash.as_bytes());
            }
            None => data.push(0),
        }
        put_bytes(&mut data, self.miner.as_bytes());
        data.extend((self.account_snapshots.len() as u64).to_be_bytes());
        for snapshot in &self.account_snapshots {
            put_bytes(&mut data, snapshot.public_key.as_bytes());
            data.extend(snapshot.state.balance.to_be_bytes());
            data.extend(snapshot.state.nonce.to_be_bytes());
        }
        if with_signature {
            put_bytes(&mut data, &self.signature);
        }
        data
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Block> {
        deserialize::<Block>(bytes)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn is_genesis(&self) -> bool {
        self.block_num == 0
    }

    pub fn get_chain_id(&self) -> &ChainId {
        &self.chain_id
    }

    pub fn get_block_num(&self) -> u64 {
        self.block_num
    }

    pub fn get_previous_block_hash(&self) -> Hash {
        self.previous_block_hash
    }

    pub fn get_immutable_block_hash(&self) -> Hash {
        self.immutable_block_hash
    }

    pub fn get_base_target(&self) -> u64 {
        self.base_target
    }

    pub fn get_cumulative_difficulty(&self) -> u64 {
        self.cumulative_difficulty
    }

    pub fn get_generation_signature(&self) -> Hash {
        self.generation_signature
    }

    pub fn get_timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn get_tx_hash(&self) -> Option<Hash> {
        self.tx_hash
    }

    pub fn get_miner(&self) -> &PublicKey {
        &self.miner
    }

    pub fn get_account_snapshots(&self) -> &[AccountSnapshot] {
        &self.account_snapshots
    }

    pub fn snapshot_of(&self, public_key: &PublicKey) -> Option<AccountState> {
        self.account_snapshots
            .iter()
            .find(|s| &s.public_key == public_key)
            .map(|s| s.state)
    }
}

/// A block together with the transaction it carries: the unit of replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct BlockContainer {
    block: Block,
    tx: Option<Transaction>,
}

impl BlockContainer {
    pub fn new(block: Block, tx: Option<Transaction>) -> BlockContainer {
        BlockContainer { block, tx }
    }

    pub fn deserialize(bytes: &[u8]) -> Result<BlockContainer> {
        deserialize::<BlockContainer>(bytes)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn hash(&self) -> Hash {
        self.block.hash()
    }

    pub fn get_block(&self) -> &Block {
        &self.block
    }

    pub fn get_tx(&self) -> Option<&Transaction> {
        self.tx.as_ref()
    }

    pub fn block_num(&self) -> u64 {
        self.block.block_num
    }

    pub fn previous_hash(&self) -> Hash {
        self.block.previous_block_hash
    }

    pub fn cumulative_difficulty(&self) -> u64 {
        self.block.cumulative_difficulty
    }

    pub fn timestamp(&self) -> i64 {
        self.block.timestamp
    }

    /// Miner plus every account the carried transaction touches.
    pub fn touched_accounts(&self) -> Vec<PublicKey> {
        let mut accounts = vec![self.block.miner.clone()];
        if let Some(tx) = &self.tx {
            for account in tx.touched_accounts() {
                if !accounts.contains(&account) {
                    accounts.push(account);
                }
            }
        }
        accounts
    }

    pub fn into_parts(self) -> (Block, Option<Transaction>) {
        (self.block, self.tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unsigned(miner: &KeyPair) -> Block {
        Block::new_unsigned(NewBlock {
            chain_id: ChainId::new(b"blocks".to_vec()),
            block_num: 1,
            previous_block_hash: Hash::digest(b"parent"),
            immutable_block_hash: Hash::digest(b"parent"),
            base_target: 1_000,
            cumulative_difficulty: 10,
            generation_signature: Hash::digest(b"gen"),
            timestamp: 1_700_000_000,
            tx_hash: None,
            miner: miner.public_key(),
        })
    }

    #[test]
    fn test_signed_block_verifies_and_hash_covers_signature() {
        let miner = KeyPair::generate().unwrap();
        let mut block = unsigned(&miner);
        assert!(!block.verify_signature());

        let unsigned_hash = block.hash();
        block.sign(&miner).unwrap();
        assert!(block.verify_signature());
        assert_ne!(block.hash(), unsigned_hash);
    }

    #[test]
    fn test_changing_snapshots_drops_signature() {
        let miner = KeyPair::generate().unwrap();
        let mut block = unsigned(&miner);
        block.sign(&miner).unwrap();
        block.set_account_snapshots(vec![AccountSnapshot::new(
            miner.public_key(),
            AccountState::new(5, 1),
        )]);
        assert!(!block.verify_signature());
        assert_eq!(
            block.snapshot_of(&miner.public_key()),
            Some(AccountState::new(5, 1))
        );
    }

    #[test]
    fn test_container_survives_encoding() {
        let miner = KeyPair::generate().unwrap();
        let mut block = unsigned(&miner);
        block.sign(&miner).unwrap();
        let container = BlockContainer::new(block, None);

        let decoded = BlockContainer::deserialize(&container.serialize().unwrap()).unwrap();
        assert_eq!(decoded.hash(), container.hash());
        assert_eq!(decoded.touched_accounts(), vec![miner.public_key()]);
    }
}

// Transactions move balance between accounts of one chain. The sender's nonce
// must advance by exactly one per transaction, which is also how an account
// accumulates mining power.

use crate::account::KeyPair;
use crate::core::{AccountState, ChainId, Hash, PublicKey};
use crate::error::Result;
use crate::utils::{deserialize, ecdsa_p256_sha256_sign_verify, serialize};
use serde::{Deserialize, Serialize};

/// Initial allocation installed by a genesis transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct GenesisAccount {
    pub public_key: PublicKey,
    pub state: AccountState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum TxKind {
    /// Only valid inside the genesis block
    Genesis { accounts: Vec<GenesisAccount> },
    /// Message posted to the chain, pays only the fee
    Note { memo: Vec<u8> },
    /// Value transfer
    Wiring { receiver: PublicKey, amount: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Transaction {
    chain_id: ChainId,
    timestamp: i64,
    sender: PublicKey,
    fee: u64,
    nonce: u64,
    kind: TxKind,
    signature: Vec<u8>,
}

impl Transaction {
    /// Build and sign a transaction with `key_pair` as sender.
    pub fn new_signed(
        key_pair: &KeyPair,
        chain_id: ChainId,
        timestamp: i64,
        fee: u64,
        nonce: u64,
        kind: TxKind,
    ) -> Result<Transaction> {
        let mut tx = Transaction {
            chain_id,
            timestamp,
            sender: key_pair.public_key(),
            fee,
            nonce,
            kind,
            signature: vec![],
        };
        tx.signature = key_pair.sign(&tx.preimage(false))?;
        Ok(tx)
    }

    pub fn new_genesis(
        key_pair: &KeyPair,
        chain_id: ChainId,
        timestamp: i64,
        accounts: Vec<GenesisAccount>,
    ) -> Result<Transaction> {
        Self::new_signed(key_pair, chain_id, timestamp, 0, 0, TxKind::Genesis { accounts })
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Transaction> {
        deserialize::<Transaction>(bytes)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    /// Content address of the transaction, covering the signature.
    pub fn tx_id(&self) -> Hash {
        Hash::digest(&self.preimage(true))
    }

    // Length-prefixed field encoding used for both the id and the signature.
    fn preimage(&self, with_signature: bool) -> Vec<u8> {
        let mut data = vec![];
        put_bytes(&mut data, self.chain_id.as_bytes());
        data.extend(self.timestamp.to_be_bytes());
        put_bytes(&mut data, self.sender.as_bytes());
        data.extend(self.fee.to_be_bytes());
        data.extend(self.nonce.to_be_bytes());
        match &self.kind {
            TxKind::Genesis { accounts } => {
                data.push(0);
                data.extend((accounts.len() as u64).to_be_bytes());
                for account in accounts {
                    put_bytes(&mut data, account.public_key.as_bytes());
                    data.extend(account.state.balance.to_be_bytes());
                    data.extend(account.state.nonce.to_be_bytes());
                }
            }
            TxKind::Note { memo } => {
                data.push(1);
                put_bytes(&mut data, memo);
            }
            TxKind::Wiring { receiver, amount } => {
                data.push(2);
                put_bytes(&mut data, receiver.as_bytes());
                data.extend(amount.to_be_bytes());
            }
        }
        if with_signature {
            put_bytes(&mut data, &self.signature);
        }
        data
    }

    pub fn verify_signature(&self) -> bool {
        ecdsa_p256_sha256_sign_verify(
            self.sender.as_bytes(),
            &self.signature,
            &self.preimage(false),
        )
    }

    pub fn get_chain_id(&self) -> &ChainId {
        &self.chain_id
    }

    pub fn get_timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn get_sender(&self) -> &PublicKey {
        &self.sender
    }

    pub fn get_fee(&self) -> u64 {
        self.fee
    }

    pub fn get_nonce(&self) -> u64 {
        self.nonce
    }

    pub fn get_kind(&self) -> &TxKind {
        &self.kind
    }

    pub fn get_receiver(&self) -> Option<&PublicKey> {
        match &self.kind {
            TxKind::Wiring { receiver, .. } => Some(receiver),
            _ => None,
        }
    }

    pub fn get_amount(&self) -> u64 {
        match &self.kind {
            TxKind::Wiring { amount, .. } => *amount,
            _ => 0,
        }
    }

    pub fn is_genesis(&self) -> bool {
        matches!(self.kind, TxKind::Genesis { .. })
    }

    /// Every account whose state this transaction changes.
    pub fn touched_accounts(&self) -> Vec<PublicKey> {
        match &self.kind {
            TxKind::Genesis { accounts } => {
                accounts.iter().map(|a| a.public_key.clone()).collect()
            }
            TxKind::Note { .. } => vec![self.sender.clone()],
            TxKind::Wiring { receiver, .. } => vec![self.sender.clone(), receiver.clone()],
        }
    }

    /// Total debit from the sender's balance.
    pub fn total_cost(&self) -> Option<u64> {
        self.get_amount().checked_add(self.fee)
    }
}

/// Append a length-prefixed byte string to a hash or signature preimage.
pub(crate) fn put_bytes(data: &mut Vec<u8>, bytes: &[u8]) {
    data.extend((bytes.len() as u64).to_be_bytes());
    data.extend_from_slice(bytes);
}

//! Identifier newtypes shared by every component
//!
//! Hashes are fixed-size arrays so they can key maps directly; chain ids and
//! public keys are opaque byte strings.

use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ChainError, Result};
use crate::utils::sha256_digest;

pub const HASH_LEN: usize = 32;

/// A SHA-256 content hash (block hash, transaction id, DHT immutable key).
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct Hash([u8; HASH_LEN]);

impl Hash {
    /// Previous-block hash of a genesis block.
    pub const ZERO: Hash = Hash([0u8; HASH_LEN]);

    pub fn new(bytes: [u8; HASH_LEN]) -> Hash {
        Hash(bytes)
    }

    pub fn digest(data: &[u8]) -> Hash {
        Hash(sha256_digest(data))
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Hash> {
        let array: [u8; HASH_LEN] = bytes.try_into().ok()?;
        Some(Hash(array))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_LEN]
    }

    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // short form keeps log lines readable
        write!(f, "Hash({})", &self.to_hex()[..12])
    }
}

/// Identifier of one followed chain; every per-chain record is keyed by it.
#[derive(
    Clone,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct ChainId(Vec<u8>);

impl ChainId {
    pub fn new(bytes: Vec<u8>) -> ChainId {
        ChainId(bytes)
    }

    /// Chain id of a freshly created chain: the community name followed by a
    /// prefix of a creator-specific seed, so two chains with the same name differ.
    pub fn derive(name: &str, seed: &Hash) -> ChainId {
        let mut bytes = name.as_bytes().to_vec();
        bytes.extend_from_slice(&seed.as_bytes()[..16]);
        ChainId(bytes)
    }

    pub fn from_hex(hex: &str) -> Result<ChainId> {
        data_encoding::HEXLOWER_PERMISSIVE
            .decode(hex.as_bytes())
            .map(ChainId)
            .map_err(|e| ChainError::Config(format!("Invalid chain id {hex}: {e}")))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChainId({})", self.to_hex())
    }
}

/// Public key of an account (uncompressed P-256 point).
#[derive(
    Clone,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct PublicKey(Vec<u8>);

impl PublicKey {
    pub fn new(bytes: Vec<u8>) -> PublicKey {
        PublicKey(bytes)
    }

    pub fn from_hex(hex: &str) -> Result<PublicKey> {
        data_encoding::HEXLOWER_PERMISSIVE
            .decode(hex.as_bytes())
            .map(PublicKey)
            .map_err(|e| ChainError::Config(format!("Invalid public key {hex}: {e}")))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        let tail = hex.len().saturating_sub(8);
        write!(f, "PublicKey(..{})", &hex[tail..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_from_slice_requires_exact_length() {
        assert!(Hash::from_slice(&[1u8; 32]).is_some());
        assert!(Hash::from_slice(&[1u8; 31]).is_none());
    }

    #[test]
    fn test_chain_id_hex_round_trip() {
        let chain = ChainId::derive("coffee", &Hash::digest(b"genesis"));
        assert_eq!(ChainId::from_hex(&chain.to_hex()).unwrap(), chain);
        assert!(chain.as_bytes().starts_with(b"coffee"));
    }

    #[test]
    fn test_hash_ordering_is_bytewise() {
        let low = Hash::new([0u8; 32]);
        let mut high_bytes = [0u8; 32];
        high_bytes[0] = 1;
        assert!(low < Hash::new(high_bytes));
        assert!(low.is_zero());
    }
}

use crate::core::PublicKey;
use crate::error::{ChainError, Result};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair as _, ECDSA_P256_SHA256_FIXED_SIGNING};
use serde::{Deserialize, Serialize};

/// The local account's signing capability, handed to the engine at construction.
#[derive(Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct KeyPair {
    pkcs8: Vec<u8>,
    public_key: Vec<u8>,
}

impl KeyPair {
    pub fn generate() -> Result<KeyPair> {
        let pkcs8 = crate::utils::new_key_pair()?;
        Self::from_pkcs8(pkcs8)
    }

    pub fn from_pkcs8(pkcs8: Vec<u8>) -> Result<KeyPair> {
        let rng = SystemRandom::new();
        let key_pair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
                .map_err(|e| {
                    ChainError::Crypto(format!("Failed to create key pair from PKCS8: {e}"))
                })?;
        let public_key = key_pair.public_key().as_ref().to_vec();
        Ok(KeyPair { pkcs8, public_key })
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::new(self.public_key.clone())
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        crate::utils::ecdsa_p256_sha256_sign_digest(&self.pkcs8, message)
    }

    pub fn get_pkcs8(&self) -> &[u8] {
        self.pkcs8.as_slice()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_survives_pkcs8_reload() {
        let key_pair = KeyPair::generate().unwrap();
        let reloaded = KeyPair::from_pkcs8(key_pair.get_pkcs8().to_vec()).unwrap();
        assert_eq!(key_pair.public_key(), reloaded.public_key());
    }

    #[test]
    fn test_invalid_pkcs8_is_rejected() {
        assert!(KeyPair::from_pkcs8(vec![1, 2, 3]).is_err());
    }
}

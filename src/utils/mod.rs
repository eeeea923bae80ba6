//! Utility functions and helpers
//!
//! Hashing, signing, time and the bincode layer shared by every module.

pub mod crypto;
pub mod serialization;

pub use crypto::{
    current_timestamp, ecdsa_p256_sha256_sign_digest, ecdsa_p256_sha256_sign_verify,
    new_key_pair, sha256_digest,
};

pub use serialization::{deserialize, serialize};

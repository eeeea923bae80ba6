//! Local account key material
//!
//! The engine only needs a signing capability and the matching public key;
//! key files are a convenience for the command-line node.

pub mod key_file;
pub mod key_pair;

pub use key_file::{load_key_pair, load_or_create_key_pair, save_key_pair, KEY_FILE};
pub use key_pair::KeyPair;

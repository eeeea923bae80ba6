use crate::account::KeyPair;
use crate::error::{ChainError, Result};
use crate::utils::{deserialize, serialize};
use log::info;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

pub const KEY_FILE: &str = "account.key";

/// Load the key pair stored at `path`.
pub fn load_key_pair(path: &Path) -> Result<KeyPair> {
    let mut file = File::open(path)
        .map_err(|e| ChainError::Io(format!("Cannot open key file {}: {e}", path.display())))?;
    let mut buf = vec![];
    file.read_to_end(&mut buf)?;
    let key_pair: KeyPair = deserialize(&buf)?;
    // reparse so a corrupted file fails here rather than at first signature
    KeyPair::from_pkcs8(key_pair.get_pkcs8().to_vec())
}

pub fn save_key_pair(path: &Path, key_pair: &KeyPair) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&serialize(key_pair)?)?;
    writer.flush()?;
    Ok(())
}

/// Load the key at `path`, generating and saving a fresh one when absent.
pub fn load_or_create_key_pair(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        return load_key_pair(path);
    }
    let key_pair = KeyPair::generate()?;
    save_key_pair(path, &key_pair)?;
    info!(
        "Created new account {} at {}",
        key_pair.public_key(),
        path.display()
    );
    Ok(key_pair)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_key_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys").join(KEY_FILE);

        let created = load_or_create_key_pair(&path).unwrap();
        let loaded = load_or_create_key_pair(&path).unwrap();
        assert_eq!(created.public_key(), loaded.public_key());
    }

    #[test]
    fn test_missing_key_file_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(load_key_pair(&dir.path().join("absent.key")).is_err());
    }
}

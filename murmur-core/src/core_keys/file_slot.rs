//! File-backed key slot with optional encryption at rest
//!
//! Encrypted file format:
//! ```text
//! [Magic: 8 bytes "MRKS0001"]
//! [Version: 1 byte]
//! [Salt: 16 bytes]
//! [Nonce: 12 bytes]
//! [Ciphertext + AEAD tag: variable]
//! ```
//! Without a passphrase the record is stored as `[b"MRKS_RAW"][version][json]`.

use super::{KeyResult, KeySlot, KeyStoreError, PrivateKeyRecord};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::{Argon2, Params};
use rand::RngCore;
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

const MAGIC_HEADER: &[u8; 8] = b"MRKS0001";
const RAW_HEADER: &[u8; 8] = b"MRKS_RAW";
const FORMAT_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
/// magic(8) + version(1) + salt(16) + nonce(12)
const HEADER_SIZE: usize = 8 + 1 + SALT_LEN + NONCE_LEN;
const TAG_LEN: usize = 16;

/// Fixed slot file name; there is exactly one key record per device
const SLOT_FILE: &str = "e2e_private_key";

pub struct FileKeySlot {
    path: PathBuf,
    passphrase: Option<Zeroizing<String>>,
}

impl FileKeySlot {
    /// Open (creating the directory if needed) the slot under `dir`
    pub fn new(dir: impl AsRef<Path>, passphrase: Option<&str>) -> KeyResult<Self> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(FileKeySlot {
            path: dir.as_ref().join(SLOT_FILE),
            passphrase: passphrase.map(|p| Zeroizing::new(p.to_string())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn seal(&self, data: &[u8]) -> KeyResult<Vec<u8>> {
        let Some(passphrase) = &self.passphrase else {
            let mut out = Vec::with_capacity(9 + data.len());
            out.extend_from_slice(RAW_HEADER);
            out.push(FORMAT_VERSION);
            out.extend_from_slice(data);
            return Ok(out);
        };

        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let key = derive_key(passphrase, &salt)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|e| KeyStoreError::Encryption(format!("Invalid key: {}", e)))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), data)
            .map_err(|e| KeyStoreError::Encryption(format!("Encryption failed: {}", e)))?;

        let mut out = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
        out.extend_from_slice(MAGIC_HEADER);
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&salt);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, data: &[u8]) -> KeyResult<Zeroizing<Vec<u8>>> {
        if data.len() < 9 {
            return Err(KeyStoreError::Decryption("File too short".to_string()));
        }
        if data[8] != FORMAT_VERSION {
            return Err(KeyStoreError::Decryption(format!(
                "Unsupported version: {}",
                data[8]
            )));
        }

        if &data[0..8] == RAW_HEADER {
            if self.passphrase.is_some() {
                return Err(KeyStoreError::Decryption(
                    "Encrypted key slot expected, found unencrypted".to_string(),
                ));
            }
            return Ok(Zeroizing::new(data[9..].to_vec()));
        }
        if &data[0..8] != MAGIC_HEADER {
            return Err(KeyStoreError::Decryption("Invalid magic header".to_string()));
        }
        if data.len() < HEADER_SIZE + TAG_LEN {
            return Err(KeyStoreError::Decryption("Truncated file".to_string()));
        }
        let Some(passphrase) = &self.passphrase else {
            return Err(KeyStoreError::Decryption(
                "Passphrase required to decrypt".to_string(),
            ));
        };

        let salt = &data[9..9 + SALT_LEN];
        let nonce = Nonce::from_slice(&data[9 + SALT_LEN..HEADER_SIZE]);
        let key = derive_key(passphrase, salt)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|e| KeyStoreError::Decryption(format!("Invalid key: {}", e)))?;

        // Tag mismatch: wrong passphrase or corrupted file
        cipher
            .decrypt(nonce, &data[HEADER_SIZE..])
            .map(Zeroizing::new)
            .map_err(|_| KeyStoreError::InvalidPassphrase)
    }

    fn write_atomic(&self, data: &[u8]) -> KeyResult<()> {
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, data)?;
        fs::rename(temp_path, &self.path)?;
        Ok(())
    }
}

impl KeySlot for FileKeySlot {
    fn load(&self) -> KeyResult<Option<PrivateKeyRecord>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let sealed = fs::read(&self.path)?;
        let json = self.open(&sealed)?;
        serde_json::from_slice(&json)
            .map(Some)
            .map_err(|e| KeyStoreError::Serialization(e.to_string()))
    }

    fn save(&self, record: &PrivateKeyRecord) -> KeyResult<()> {
        let json = Zeroizing::new(
            serde_json::to_vec(record).map_err(|e| KeyStoreError::Serialization(e.to_string()))?,
        );
        let sealed = self.seal(&json)?;
        self.write_atomic(&sealed)
    }

    fn clear(&self) -> KeyResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Derive a 256-bit key from the passphrase with Argon2id
fn derive_key(passphrase: &str, salt: &[u8]) -> KeyResult<Zeroizing<[u8; 32]>> {
    let params = Params::new(19 * 1024, 2, 1, Some(32))
        .map_err(|e| KeyStoreError::Encryption(format!("Invalid Argon2 params: {}", e)))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, key.as_mut())
        .map_err(|e| KeyStoreError::Encryption(format!("Key derivation failed: {}", e)))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_keys::{KeyStore, PrivateKey};
    use crate::core_model::UserId;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_plain_slot_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let owner = UserId::new("7");

        let store = KeyStore::new(Arc::new(FileKeySlot::new(dir.path(), None).unwrap()));
        store.store_private_key(PrivateKey::new("pem"), &owner).unwrap();
        drop(store);

        let reopened = KeyStore::new(Arc::new(FileKeySlot::new(dir.path(), None).unwrap()));
        assert_eq!(reopened.get_private_key(&owner).unwrap().expose(), "pem");
    }

    #[test]
    fn test_encrypted_slot_roundtrip_and_wrong_passphrase() {
        let dir = TempDir::new().unwrap();
        let owner = UserId::new("7");

        let slot = FileKeySlot::new(dir.path(), Some("hunter2")).unwrap();
        KeyStore::new(Arc::new(slot))
            .store_private_key(PrivateKey::new("pem"), &owner)
            .unwrap();

        let raw = fs::read(dir.path().join(SLOT_FILE)).unwrap();
        assert_eq!(&raw[0..8], MAGIC_HEADER);
        assert!(!raw.windows(3).any(|w| w == b"pem"));

        let good = FileKeySlot::new(dir.path(), Some("hunter2")).unwrap();
        assert_eq!(good.load().unwrap().unwrap().key.expose(), "pem");

        let bad = FileKeySlot::new(dir.path(), Some("wrong")).unwrap();
        assert!(matches!(bad.load(), Err(KeyStoreError::InvalidPassphrase)));
        // The store treats an unreadable slot as "no key"
        assert!(!KeyStore::new(Arc::new(bad)).has_private_key(&owner));
    }

    #[test]
    fn test_clear_on_empty_slot_is_ok() {
        let dir = TempDir::new().unwrap();
        let slot = FileKeySlot::new(dir.path(), None).unwrap();
        slot.clear().unwrap();
        assert!(slot.load().unwrap().is_none());
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let slot = FileKeySlot::new(dir.path(), Some("pw")).unwrap();
        fs::write(slot.path(), b"MRKS0001\x01short").unwrap();
        assert!(matches!(slot.load(), Err(KeyStoreError::Decryption(_))));
    }
}

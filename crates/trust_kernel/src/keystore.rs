//! Secret-key store backing the signing side of the trust kernel. A JSON
//! file of hex-encoded ed25519 seeds; secret material is wiped from
//! memory on drop.

use std::fs;
use std::path::{Path, PathBuf};

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::keyring::{armor_public_key, fingerprint};
use crate::{Result, TrustError};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyRecord {
    key_id: String,
    secret_hex: String,
}

impl Drop for KeyRecord {
    fn drop(&mut self) {
        self.secret_hex.zeroize();
    }
}

#[derive(Debug)]
pub struct Keystore {
    path: PathBuf,
    keys: Vec<KeyRecord>,
}

impl Drop for Keystore {
    fn drop(&mut self) {
        for rec in &mut self.keys {
            rec.secret_hex.zeroize();
        }
    }
}

impl Keystore {
    /// Create an empty keystore file. Fails if the file already exists.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            return Err(TrustError::KeyMalformed(format!(
                "keystore {} already exists",
                path.display()
            )));
        }
        let store = Keystore { path, keys: Vec::new() };
        store.persist()?;
        Ok(store)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut data = fs::read_to_string(&path)?;
        let keys: Vec<KeyRecord> = serde_json::from_str(&data)?;
        data.zeroize();
        Ok(Keystore { path, keys })
    }

    /// Open the keystore, creating it when absent. The bootstrap path for
    /// the scheduler identity.
    pub fn open_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    pub fn contains(&self, key_id: &str) -> bool {
        self.keys.iter().any(|k| k.key_id == key_id)
    }

    /// Generate a fresh signing key under `key_id`, persist the store and
    /// return the new key's fingerprint.
    pub fn generate(&mut self, key_id: &str) -> Result<String> {
        if self.contains(key_id) {
            return Err(TrustError::KeyMalformed(format!(
                "key id '{key_id}' already present"
            )));
        }
        let signing = SigningKey::generate(&mut OsRng);
        let fp = fingerprint(&signing.verifying_key());
        self.keys.push(KeyRecord {
            key_id: key_id.to_string(),
            secret_hex: hex::encode(signing.to_bytes()),
        });
        self.persist()?;
        Ok(fp)
    }

    pub fn signing_key(&self, key_id: &str) -> Result<SigningKey> {
        let rec = self
            .keys
            .iter()
            .find(|k| k.key_id == key_id)
            .ok_or_else(|| TrustError::UnknownKey(key_id.to_string()))?;
        let mut raw = hex::decode(&rec.secret_hex)
            .map_err(|_| TrustError::KeyMalformed(format!("key '{key_id}' is not hex")))?;
        if raw.len() != 32 {
            raw.zeroize();
            return Err(TrustError::KeyMalformed(format!(
                "key '{key_id}' has wrong length"
            )));
        }
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&raw);
        raw.zeroize();
        let key = SigningKey::from_bytes(&seed);
        seed.zeroize();
        Ok(key)
    }

    pub fn fingerprint_of(&self, key_id: &str) -> Result<String> {
        Ok(fingerprint(&self.signing_key(key_id)?.verifying_key()))
    }

    pub fn public_key_armored(&self, key_id: &str) -> Result<String> {
        Ok(armor_public_key(&self.signing_key(key_id)?.verifying_key()))
    }

    fn persist(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.keys)?;
        // temp file + rename so a crash never truncates the store
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_persists_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keystore.json");
        let fp = {
            let mut store = Keystore::create(&path).unwrap();
            store.generate("scheduler").unwrap()
        };
        let store = Keystore::open(&path).unwrap();
        assert!(store.contains("scheduler"));
        assert_eq!(store.fingerprint_of("scheduler").unwrap(), fp);
    }

    #[test]
    fn duplicate_key_id_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Keystore::create(dir.path().join("ks.json")).unwrap();
        store.generate("x").unwrap();
        assert!(store.generate("x").is_err());
    }

    #[test]
    fn unknown_key_id_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = Keystore::create(dir.path().join("ks.json")).unwrap();
        assert!(matches!(
            store.signing_key("ghost"),
            Err(TrustError::UnknownKey(_))
        ));
    }
}

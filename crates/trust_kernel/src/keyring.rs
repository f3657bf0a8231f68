//! Public keyring: the set of investigator verifying keys an agent or
//! scheduler trusts, indexed by fingerprint.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use ed25519_dalek::VerifyingKey;
use sha2::{Digest, Sha256};

use crate::{Result, TrustError};

const PUBKEY_HEADER: &str = "-----BEGIN INQUEST PUBLIC KEY-----";
const PUBKEY_FOOTER: &str = "-----END INQUEST PUBLIC KEY-----";

/// Fingerprint of a verifying key: uppercase hex SHA-256 over the raw
/// 32-byte public key.
pub fn fingerprint(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode_upper(digest)
}

/// Wrap raw public key bytes in their armored text form.
pub fn armor_public_key(key: &VerifyingKey) -> String {
    format!("{}\n\n{}\n{}\n", PUBKEY_HEADER, B64.encode(key.as_bytes()), PUBKEY_FOOTER)
}

#[derive(Debug, Clone, Default)]
pub struct Keyring {
    keys: BTreeMap<String, VerifyingKey>,
}

impl Keyring {
    pub fn empty() -> Self {
        Keyring::default()
    }

    /// Load every armored public key file found in a directory.
    /// Unparseable files fail the whole load; a trust store with garbage
    /// in it is not something to limp along with.
    pub fn load_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let mut ring = Keyring::empty();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let content = fs::read_to_string(entry.path())?;
            ring.add_armored(&content).map_err(|e| {
                TrustError::KeyMalformed(format!("{}: {e}", entry.path().display()))
            })?;
        }
        Ok(ring)
    }

    /// Add one armored public key; returns its fingerprint.
    pub fn add_armored(&mut self, armored: &str) -> Result<String> {
        let mut payload = String::new();
        let mut inside = false;
        for line in armored.lines() {
            let line = line.trim();
            if line == PUBKEY_HEADER {
                inside = true;
                continue;
            }
            if line == PUBKEY_FOOTER {
                inside = false;
                continue;
            }
            if inside && !line.is_empty() {
                payload.push_str(line);
            }
        }
        if payload.is_empty() {
            return Err(TrustError::KeyMalformed("no public key armor found".into()));
        }
        let raw = B64
            .decode(payload.as_bytes())
            .map_err(|e| TrustError::KeyMalformed(e.to_string()))?;
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| TrustError::KeyMalformed(format!("public key is {} bytes", raw.len())))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| TrustError::KeyMalformed(e.to_string()))?;
        let fp = fingerprint(&key);
        self.keys.insert(fp.clone(), key);
        Ok(fp)
    }

    pub fn get(&self, fingerprint: &str) -> Option<&VerifyingKey> {
        self.keys.get(fingerprint)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &VerifyingKey)> {
        self.keys.iter().map(|(fp, k)| (fp.as_str(), k))
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }
}

//! Signed manifests for the loader subsystem: a named bundle of content
//! entries with sha256 digests, countersigned by a quorum of
//! investigators.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::keyring::Keyring;
use crate::keystore::Keystore;
use crate::sign::{sign, verify};
use crate::{Result, TrustError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub name: String,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestRecord {
    pub name: String,
    #[serde(default)]
    pub target: String,
    pub entries: Vec<ManifestEntry>,
    #[serde(default)]
    pub signatures: Vec<String>,
}

impl ManifestRecord {
    /// Canonical form signed by investigators: the manifest JSON with its
    /// signature list emptied, so added signatures never invalidate
    /// earlier ones.
    pub fn canonical(&self) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.signatures.clear();
        Ok(serde_json::to_string(&unsigned)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(TrustError::AclInvalid("manifest has no name".into()));
        }
        if self.entries.is_empty() {
            return Err(TrustError::AclInvalid("manifest has no entries".into()));
        }
        for entry in &self.entries {
            if entry.sha256.len() != 64 || hex::decode(&entry.sha256).is_err() {
                return Err(TrustError::AclInvalid(format!(
                    "entry '{}' has a malformed sha256",
                    entry.name
                )));
            }
        }
        Ok(())
    }

    /// Append a signature from the named keystore key.
    pub fn sign_with(&mut self, key_id: &str, keystore: &Keystore) -> Result<()> {
        let data = self.canonical()?;
        self.signatures.push(sign(&data, key_id, keystore)?);
        Ok(())
    }

    /// Verify the manifest against the keyring and require `quorum`
    /// distinct valid signers.
    pub fn verify_quorum(&self, keyring: &Keyring, quorum: usize) -> Result<Vec<String>> {
        self.validate()?;
        let data = self.canonical()?;
        let mut signers = BTreeSet::new();
        for sig in &self.signatures {
            signers.insert(verify(&data, sig, keyring)?);
        }
        if signers.len() < quorum {
            return Err(TrustError::WeightBelowThreshold {
                module: format!("manifest '{}'", self.name),
                got: signers.len() as u32,
                want: quorum as u32,
            });
        }
        Ok(signers.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> ManifestRecord {
        ManifestRecord {
            name: "agent-bundle".into(),
            target: "os == \"linux\"".into(),
            entries: vec![ManifestEntry {
                name: "inquest-agent".into(),
                sha256: "a".repeat(64),
            }],
            signatures: vec![],
        }
    }

    #[test]
    fn quorum_counts_distinct_signers() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Keystore::create(dir.path().join("ks.json")).unwrap();
        store.generate("bob").unwrap();
        store.generate("carol").unwrap();

        let mut keyring = Keyring::empty();
        keyring.add_armored(&store.public_key_armored("bob").unwrap()).unwrap();
        keyring.add_armored(&store.public_key_armored("carol").unwrap()).unwrap();

        let mut m = sample_manifest();
        m.sign_with("bob", &store).unwrap();
        // bob signing twice does not advance the quorum
        m.sign_with("bob", &store).unwrap();
        assert!(m.verify_quorum(&keyring, 2).is_err());

        m.sign_with("carol", &store).unwrap();
        let signers = m.verify_quorum(&keyring, 2).unwrap();
        assert_eq!(signers.len(), 2);
    }

    #[test]
    fn malformed_digest_fails_validation() {
        let mut m = sample_manifest();
        m.entries[0].sha256 = "zz".into();
        assert!(m.validate().is_err());
    }

    #[test]
    fn signature_covers_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Keystore::create(dir.path().join("ks.json")).unwrap();
        store.generate("bob").unwrap();
        let mut keyring = Keyring::empty();
        keyring.add_armored(&store.public_key_armored("bob").unwrap()).unwrap();

        let mut m = sample_manifest();
        m.sign_with("bob", &store).unwrap();
        m.entries[0].sha256 = "b".repeat(64);
        assert!(m.verify_quorum(&keyring, 1).is_err());
    }
}

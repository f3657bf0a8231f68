//! Trust kernel: canonical action strings, detached signatures, signer
//! resolution and per-module ACL evaluation. Everything the scheduler and
//! the agents agree on before any module runs.

use chrono::SecondsFormat;
use core_models::Action;
use thiserror::Error;

pub mod acl;
pub mod keyring;
pub mod keystore;
pub mod manifest;
pub mod sign;

pub use acl::{Acl, AclInvestigator, AclRule};
pub use keyring::Keyring;
pub use keystore::Keystore;
pub use manifest::ManifestRecord;
pub use sign::{armor_signature, sign, strip_armor, verify};

#[derive(Debug, Error)]
pub enum TrustError {
    #[error("malformed signature: {0}")]
    SignatureMalformed(String),
    #[error("invalid signature")]
    SignatureInvalid,
    #[error("signature from unknown signer")]
    UnknownSigner,
    #[error("module '{module}' signer weight {got} below threshold {want}")]
    WeightBelowThreshold { module: String, got: u32, want: u32 },
    #[error("no ACL rule applies to module '{0}'")]
    NoRuleForModule(String),
    #[error("action carries no signatures")]
    NoSignatures,
    #[error("malformed key material: {0}")]
    KeyMalformed(String),
    #[error("unknown key id: {0}")]
    UnknownKey(String),
    #[error("acl rejected: {0}")]
    AclInvalid(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TrustError>;

/// Canonical string of an action, the exact byte sequence investigators
/// sign. Field order, separators and the JSON encoding of operations are
/// all fixed; any deviation invalidates every signature.
///
/// JSON object keys are emitted in sorted order (serde_json maps are
/// BTree-backed) and instants carry RFC3339 nanosecond precision.
pub fn canonical_action_string(action: &Action) -> Result<String> {
    let ops = serde_json::to_string(&action.operations)?;
    Ok(format!(
        "name={}; target={}; validfrom={}; expireafter={}; operations={};",
        action.name,
        action.target,
        action.valid_from.to_rfc3339_opts(SecondsFormat::Nanos, true),
        action.expire_after.to_rfc3339_opts(SecondsFormat::Nanos, true),
        ops
    ))
}

/// Verify every signature on an action against the keyring and return the
/// set of signer fingerprints. Fails on the first bad signature.
pub fn verify_action(action: &Action, keyring: &Keyring) -> Result<Vec<String>> {
    if action.signatures.is_empty() {
        return Err(TrustError::NoSignatures);
    }
    let data = canonical_action_string(action)?;
    let mut fingerprints = Vec::with_capacity(action.signatures.len());
    for sig in &action.signatures {
        let fp = verify(&data, sig, keyring)?;
        fingerprints.push(fp);
    }
    Ok(fingerprints)
}

/// Full authorization of an action: all signatures verify and every
/// operation clears its ACL weight threshold.
pub fn authorize_action(action: &Action, acl: &Acl, keyring: &Keyring) -> Result<Vec<String>> {
    let fingerprints = verify_action(action, keyring)?;
    for op in &action.operations {
        acl.authorize(&op.module, &fingerprints)?;
    }
    Ok(fingerprints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use core_models::Operation;

    fn fixed_action() -> Action {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        Action {
            id: 0,
            name: "ls etc".into(),
            target: "status == \"online\"".into(),
            description: None,
            threat: None,
            valid_from: t0,
            expire_after: t0 + Duration::seconds(60),
            operations: vec![Operation {
                module: "file".into(),
                parameters: serde_json::json!({"path": "/etc", "name": "^passwd$"}),
            }],
            signatures: vec![],
            syntax_version: core_models::SYNTAX_VERSION,
            status: None,
            last_update_time: None,
            counters: None,
        }
    }

    #[test]
    fn canonical_string_is_stable() {
        let a = fixed_action();
        let s1 = canonical_action_string(&a).unwrap();
        let s2 = canonical_action_string(&a).unwrap();
        assert_eq!(s1, s2);
        assert_eq!(
            s1,
            "name=ls etc; target=status == \"online\"; \
             validfrom=2024-05-01T12:00:00.000000000Z; \
             expireafter=2024-05-01T12:01:00.000000000Z; \
             operations=[{\"module\":\"file\",\"parameters\":{\"name\":\"^passwd$\",\"path\":\"/etc\"}}];"
        );
    }

    #[test]
    fn canonical_string_sorts_parameter_keys() {
        let mut a = fixed_action();
        a.operations[0].parameters = serde_json::json!({"zeta": 1, "alpha": 2});
        let s = canonical_action_string(&a).unwrap();
        let alpha = s.find("alpha").unwrap();
        let zeta = s.find("zeta").unwrap();
        assert!(alpha < zeta);
    }

    #[test]
    fn unsigned_action_is_rejected() {
        let a = fixed_action();
        let keyring = Keyring::empty();
        assert!(matches!(
            verify_action(&a, &keyring),
            Err(TrustError::NoSignatures)
        ));
    }

    #[test]
    fn sign_then_authorize_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("keystore.json");
        let mut store = Keystore::create(&store_path).unwrap();
        let fp = store.generate("bob").unwrap();

        let mut keyring = Keyring::empty();
        keyring
            .add_armored(&store.public_key_armored("bob").unwrap())
            .unwrap();

        let mut action = fixed_action();
        let data = canonical_action_string(&action).unwrap();
        action.signatures = vec![sign(&data, "bob", &store).unwrap()];

        let acl = Acl::single_default(1, vec![AclInvestigator { fingerprint: fp.clone(), weight: 1 }]);
        let signers = authorize_action(&action, &acl, &keyring).unwrap();
        assert_eq!(signers, vec![fp]);
    }

    #[test]
    fn weight_below_threshold_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Keystore::create(dir.path().join("ks.json")).unwrap();
        let fp_bob = store.generate("bob").unwrap();
        let fp_carol = store.generate("carol").unwrap();

        let mut keyring = Keyring::empty();
        keyring.add_armored(&store.public_key_armored("bob").unwrap()).unwrap();

        let mut action = fixed_action();
        let data = canonical_action_string(&action).unwrap();
        action.signatures = vec![sign(&data, "bob", &store).unwrap()];

        // default rule wants two distinct signers' worth of weight
        let acl = Acl::single_default(
            2,
            vec![
                AclInvestigator { fingerprint: fp_bob, weight: 1 },
                AclInvestigator { fingerprint: fp_carol, weight: 1 },
            ],
        );
        assert!(matches!(
            authorize_action(&action, &acl, &keyring),
            Err(TrustError::WeightBelowThreshold { .. })
        ));
    }

    #[test]
    fn tampered_canonical_string_invalidates_signature() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Keystore::create(dir.path().join("ks.json")).unwrap();
        store.generate("bob").unwrap();

        let mut keyring = Keyring::empty();
        keyring.add_armored(&store.public_key_armored("bob").unwrap()).unwrap();

        let mut action = fixed_action();
        let data = canonical_action_string(&action).unwrap();
        action.signatures = vec![sign(&data, "bob", &store).unwrap()];
        action.name = "ls root".into();

        assert!(matches!(
            verify_action(&action, &keyring),
            Err(TrustError::SignatureInvalid)
        ));
    }
}

//! Detached signatures and their wire form.
//!
//! Signatures travel as a single ASCII line: the inner base64 payload of
//! the armored form with header, footer and line breaks removed.
//! Consumers re-armor before parsing, so `sign -> strip -> re-armor ->
//! verify` must round-trip bit-exactly.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, Verifier};

use crate::keyring::Keyring;
use crate::keystore::Keystore;
use crate::{Result, TrustError};

const ARMOR_HEADER: &str = "-----BEGIN INQUEST SIGNATURE-----";
const ARMOR_FOOTER: &str = "-----END INQUEST SIGNATURE-----";
const ARMOR_WIDTH: usize = 64;

/// Wrap a raw signature into its armored text form.
pub fn armor_signature(raw: &[u8]) -> String {
    let payload = B64.encode(raw);
    let mut out = String::with_capacity(payload.len() + 80);
    out.push_str(ARMOR_HEADER);
    out.push_str("\n\n");
    for chunk in payload.as_bytes().chunks(ARMOR_WIDTH) {
        // chunks of valid base64 are always valid UTF-8
        out.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        out.push('\n');
    }
    out.push_str(ARMOR_FOOTER);
    out.push('\n');
    out
}

/// Reduce an armored signature to the single-line wire form.
pub fn strip_armor(armored: &str) -> Result<String> {
    let mut payload = String::new();
    let mut inside = false;
    for line in armored.lines() {
        let line = line.trim();
        if line == ARMOR_HEADER {
            inside = true;
            continue;
        }
        if line == ARMOR_FOOTER {
            return if payload.is_empty() {
                Err(TrustError::SignatureMalformed("empty armor payload".into()))
            } else {
                Ok(payload)
            };
        }
        if inside && !line.is_empty() {
            payload.push_str(line);
        }
    }
    Err(TrustError::SignatureMalformed(
        "missing armor header or footer".into(),
    ))
}

/// Re-armor a one-line signature so it can be parsed like the original
/// armored document.
fn rearmor(one_line: &str) -> String {
    let mut out = String::with_capacity(one_line.len() + 80);
    out.push_str(ARMOR_HEADER);
    out.push_str("\n\n");
    for chunk in one_line.as_bytes().chunks(ARMOR_WIDTH) {
        out.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        out.push('\n');
    }
    out.push_str(ARMOR_FOOTER);
    out.push('\n');
    out
}

/// Sign `data` with the named keystore key and return the one-line wire
/// form of the detached signature.
pub fn sign(data: &str, key_id: &str, keystore: &Keystore) -> Result<String> {
    let signing_key = keystore.signing_key(key_id)?;
    let sig = signing_key.sign(data.as_bytes());
    strip_armor(&armor_signature(&sig.to_bytes()))
}

/// Verify a one-line signature over `data` against the keyring. Returns
/// the fingerprint of the signing key on success.
pub fn verify(data: &str, one_line: &str, keyring: &Keyring) -> Result<String> {
    let armored = rearmor(one_line.trim());
    let payload = strip_armor(&armored)?;
    let raw = B64
        .decode(payload.as_bytes())
        .map_err(|e| TrustError::SignatureMalformed(e.to_string()))?;
    let sig = Signature::from_slice(&raw)
        .map_err(|e| TrustError::SignatureMalformed(e.to_string()))?;

    for (fingerprint, key) in keyring.iter() {
        if key.verify(data.as_bytes(), &sig).is_ok() {
            return Ok(fingerprint.to_string());
        }
    }
    // distinguish "no key knows this signature" from a plain bad signature:
    // a signature that no keyring entry accepts over these exact bytes is
    // invalid if the keyring is non-empty, unknown otherwise
    if keyring.is_empty() {
        Err(TrustError::UnknownSigner)
    } else {
        Err(TrustError::SignatureInvalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn armor_strips_to_single_line_and_back() {
        let raw = [7u8; 64];
        let armored = armor_signature(&raw);
        assert!(armored.starts_with(ARMOR_HEADER));
        assert!(armored.trim_end().ends_with(ARMOR_FOOTER));

        let one_line = strip_armor(&armored).unwrap();
        assert!(!one_line.contains('\n'));

        let rearmored = rearmor(&one_line);
        assert_eq!(armored, rearmored);
        assert_eq!(B64.decode(one_line).unwrap(), raw.to_vec());
    }

    #[test]
    fn strip_rejects_truncated_armor() {
        assert!(strip_armor("-----BEGIN INQUEST SIGNATURE-----\n\nabcd\n").is_err());
        assert!(strip_armor("no armor at all").is_err());
    }

    #[test]
    fn sign_and_verify_yield_signer_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Keystore::create(dir.path().join("ks.json")).unwrap();
        let fp = store.generate("alice").unwrap();

        let mut keyring = Keyring::empty();
        keyring
            .add_armored(&store.public_key_armored("alice").unwrap())
            .unwrap();

        let sig = sign("some canonical bytes", "alice", &store).unwrap();
        let got = verify("some canonical bytes", &sig, &keyring).unwrap();
        assert_eq!(got, fp);
    }

    #[test]
    fn verify_against_empty_keyring_is_unknown_signer() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Keystore::create(dir.path().join("ks.json")).unwrap();
        store.generate("alice").unwrap();
        let sig = sign("payload", "alice", &store).unwrap();
        assert!(matches!(
            verify("payload", &sig, &Keyring::empty()),
            Err(TrustError::UnknownSigner)
        ));
    }
}

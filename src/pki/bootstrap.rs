//! Trust bootstrap: tie a locally generated CA root to the network trust
//! anchor.
//!
//! At CA creation the authority signs the root certificate file with its
//! Ed25519 network identity key and publishes an [`Attestation`]. A peer
//! accepts the root only after [`verify`] succeeds against a key it resolves
//! itself for the attested authority. The attestation never carries a key.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand_core::OsRng;
use regex::Regex;
use tracing::{debug, info, warn};
use trust_types::Attestation;

use crate::pki::store::{write_atomic, write_secret};
use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Key resolution
// ─────────────────────────────────────────────────────────────────────────────

/// Looks up the verification key the network associates with an authority.
pub trait VerificationKeyResolver: Send + Sync {
    /// Key for `authority`, or an error if none is known.
    fn resolve(&self, authority: &str) -> Result<VerifyingKey>;
}

impl VerificationKeyResolver for HashMap<String, VerifyingKey> {
    fn resolve(&self, authority: &str) -> Result<VerifyingKey> {
        self.get(authority)
            .copied()
            .ok_or_else(|| Error::UntrustedRoot(format!("no verification key for {authority}")))
    }
}

/// Resolves keys from a directory of `<identity>-V<n>.pub` files, picking
/// the highest version. Each file holds a base64 32-byte Ed25519 key.
#[derive(Debug, Clone)]
pub struct KeyDirectoryResolver {
    dir: PathBuf,
}

impl KeyDirectoryResolver {
    /// Resolve keys from `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn newest_key_file(&self, authority: &str) -> Result<PathBuf> {
        let pattern = format!(r"^{}-V(\d+)\.pub$", regex::escape(&identity_file_fmt(authority)));
        let re = Regex::new(&pattern).map_err(|e| Error::Internal(e.to_string()))?;

        let entries = fs::read_dir(&self.dir).map_err(|e| {
            Error::UntrustedRoot(format!("cannot read key directory '{}': {e}", self.dir.display()))
        })?;

        let mut newest: Option<(u64, PathBuf)> = None;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(version) = re
                .captures(name)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<u64>().ok())
            else {
                continue;
            };
            if newest.as_ref().is_none_or(|(v, _)| version > *v) {
                newest = Some((version, entry.path()));
            }
        }

        newest
            .map(|(version, path)| {
                debug!(authority = authority, version = version, "Resolved verification key");
                path
            })
            .ok_or_else(|| Error::UntrustedRoot(format!("no verification key for {authority}")))
    }
}

impl VerificationKeyResolver for KeyDirectoryResolver {
    fn resolve(&self, authority: &str) -> Result<VerifyingKey> {
        let path = self.newest_key_file(authority)?;
        read_verification_key(&path).map_err(|e| Error::UntrustedRoot(e.to_string()))
    }
}

/// File-name form of a network identity: anything outside `[A-Za-z0-9.-]`
/// becomes `_`.
#[must_use]
pub fn identity_file_fmt(identity: &str) -> String {
    identity
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Produce / verify
// ─────────────────────────────────────────────────────────────────────────────

/// Sign `root_bytes` with the local network key on behalf of `authority`.
#[must_use]
pub fn produce(root_bytes: &[u8], key: &SigningKey, authority: &str) -> Attestation {
    let signature = key.sign(root_bytes);
    Attestation {
        authority: authority.to_string(),
        raw_signature: signature.to_bytes().to_vec(),
    }
}

/// Check that `attestation` endorses `root_bytes`. Every failure is
/// [`Error::UntrustedRoot`].
pub fn verify(
    root_bytes: &[u8],
    attestation: &Attestation,
    resolver: &dyn VerificationKeyResolver,
) -> Result<()> {
    if attestation.authority.is_empty() {
        return Err(Error::UntrustedRoot("attestation names no authority".to_string()));
    }
    let key = resolver
        .resolve(&attestation.authority)
        .map_err(|e| match e {
            Error::UntrustedRoot(_) => e,
            other => Error::UntrustedRoot(other.to_string()),
        })?;
    let signature = Signature::from_slice(&attestation.raw_signature)
        .map_err(|e| Error::UntrustedRoot(format!("malformed attestation signature: {e}")))?;

    match key.verify_strict(root_bytes, &signature) {
        Ok(()) => {
            info!(authority = %attestation.authority, "CA root attestation verified");
            Ok(())
        }
        Err(e) => {
            warn!(authority = %attestation.authority, error = %e, "CA root attestation rejected");
            Err(Error::UntrustedRoot(format!(
                "signature by {} does not match root certificate",
                attestation.authority
            )))
        }
    }
}

/// [`verify`] with the root certificate and attestation read from disk.
pub fn verify_files(
    root_cert_file: &Path,
    attestation_file: &Path,
    resolver: &dyn VerificationKeyResolver,
) -> Result<()> {
    let root_bytes = fs::read(root_cert_file).map_err(|e| {
        Error::UntrustedRoot(format!("cannot read '{}': {e}", root_cert_file.display()))
    })?;
    let attestation = read_attestation(attestation_file)
        .map_err(|e| Error::UntrustedRoot(e.to_string()))?;
    verify(&root_bytes, &attestation, resolver)
}

// ─────────────────────────────────────────────────────────────────────────────
// Files
// ─────────────────────────────────────────────────────────────────────────────

/// Read an attestation JSON file.
pub fn read_attestation(path: &Path) -> Result<Attestation> {
    let data = fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

/// Write an attestation JSON file.
pub fn write_attestation(path: &Path, attestation: &Attestation) -> Result<()> {
    let json = serde_json::to_vec_pretty(attestation)?;
    write_atomic(path, &json)
}

/// Fresh Ed25519 network signing key.
#[must_use]
pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Persist a signing key as its base64 32-byte seed, owner-only.
pub fn write_signing_key(path: &Path, key: &SigningKey) -> Result<()> {
    write_secret(path, STANDARD.encode(key.to_bytes()).as_bytes())
}

/// Read a signing key written by [`write_signing_key`].
pub fn read_signing_key(path: &Path) -> Result<SigningKey> {
    let seed: [u8; 32] = read_key_bytes(path)?;
    Ok(SigningKey::from_bytes(&seed))
}

/// Persist a verification key as base64.
pub fn write_verification_key(path: &Path, key: &VerifyingKey) -> Result<()> {
    write_atomic(path, STANDARD.encode(key.to_bytes()).as_bytes())
}

/// Read a verification key written by [`write_verification_key`].
pub fn read_verification_key(path: &Path) -> Result<VerifyingKey> {
    let bytes: [u8; 32] = read_key_bytes(path)?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| Error::Pki(format!("invalid verification key '{}': {e}", path.display())))
}

fn read_key_bytes(path: &Path) -> Result<[u8; 32]> {
    let text = fs::read_to_string(path)?;
    let bytes = STANDARD
        .decode(text.trim())
        .map_err(|e| Error::Pki(format!("'{}' is not base64: {e}", path.display())))?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
        Error::Pki(format!(
            "'{}' holds {} bytes, expected 32",
            path.display(),
            bytes.len()
        ))
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const AUTHORITY: &str = "1-ff00:0:110";
    const ROOT: &[u8] = b"-----BEGIN CERTIFICATE-----\nMIIBfake\n-----END CERTIFICATE-----\n";

    fn resolver_for(key: &SigningKey) -> HashMap<String, VerifyingKey> {
        HashMap::from([(AUTHORITY.to_string(), key.verifying_key())])
    }

    #[test]
    fn produced_attestation_verifies() {
        // GIVEN: an authority key known to the resolver
        let key = generate_signing_key();
        // WHEN: attesting the root
        let attestation = produce(ROOT, &key, AUTHORITY);
        // THEN: verification succeeds
        assert!(verify(ROOT, &attestation, &resolver_for(&key)).is_ok());
        assert_eq!(attestation.raw_signature.len(), 64);
    }

    #[test]
    fn any_single_bit_flip_in_root_fails() {
        let key = generate_signing_key();
        let attestation = produce(ROOT, &key, AUTHORITY);
        let resolver = resolver_for(&key);

        for byte in 0..ROOT.len() {
            for bit in 0..8 {
                let mut tampered = ROOT.to_vec();
                tampered[byte] ^= 1 << bit;
                assert!(
                    matches!(
                        verify(&tampered, &attestation, &resolver),
                        Err(Error::UntrustedRoot(_))
                    ),
                    "flip at byte {byte} bit {bit} accepted"
                );
            }
        }
    }

    #[test]
    fn any_single_bit_flip_in_signature_fails() {
        let key = generate_signing_key();
        let attestation = produce(ROOT, &key, AUTHORITY);
        let resolver = resolver_for(&key);

        for byte in 0..attestation.raw_signature.len() {
            for bit in 0..8 {
                let mut tampered = attestation.clone();
                tampered.raw_signature[byte] ^= 1 << bit;
                assert!(
                    verify(ROOT, &tampered, &resolver).is_err(),
                    "flip at byte {byte} bit {bit} accepted"
                );
            }
        }
    }

    #[test]
    fn unknown_authority_is_untrusted() {
        let key = generate_signing_key();
        let mut attestation = produce(ROOT, &key, AUTHORITY);
        attestation.authority = "1-ff00:0:999".to_string();
        assert!(matches!(
            verify(ROOT, &attestation, &resolver_for(&key)),
            Err(Error::UntrustedRoot(_))
        ));
    }

    #[test]
    fn signature_by_other_key_is_untrusted() {
        let trusted = generate_signing_key();
        let impostor = generate_signing_key();
        let attestation = produce(ROOT, &impostor, AUTHORITY);
        assert!(verify(ROOT, &attestation, &resolver_for(&trusted)).is_err());
    }

    #[test]
    fn directory_resolver_picks_highest_version() {
        // GIVEN: two versions of the authority key on disk
        let dir = tempfile::tempdir().unwrap();
        let old = generate_signing_key();
        let new = generate_signing_key();
        let stem = identity_file_fmt(AUTHORITY);
        write_verification_key(&dir.path().join(format!("{stem}-V2.pub")), &old.verifying_key())
            .unwrap();
        write_verification_key(&dir.path().join(format!("{stem}-V10.pub")), &new.verifying_key())
            .unwrap();
        fs::write(dir.path().join("unrelated.txt"), "x").unwrap();

        // WHEN / THEN: only the newest key verifies
        let resolver = KeyDirectoryResolver::new(dir.path());
        assert!(verify(ROOT, &produce(ROOT, &new, AUTHORITY), &resolver).is_ok());
        assert!(verify(ROOT, &produce(ROOT, &old, AUTHORITY), &resolver).is_err());
    }

    #[test]
    fn directory_resolver_without_key_is_untrusted() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = KeyDirectoryResolver::new(dir.path());
        assert!(matches!(resolver.resolve(AUTHORITY), Err(Error::UntrustedRoot(_))));
    }

    #[test]
    fn identity_file_fmt_replaces_separators() {
        assert_eq!(identity_file_fmt("1-ff00:0:110"), "1-ff00_0_110");
    }

    #[test]
    fn files_round_trip_through_verify_files() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("node.key");
        let root_path = dir.path().join("ca.crt");
        let att_path = dir.path().join("bootstrap.json");

        write_signing_key(&key_path, &generate_signing_key()).unwrap();
        let key = read_signing_key(&key_path).unwrap();
        fs::write(&root_path, ROOT).unwrap();
        write_attestation(&att_path, &produce(ROOT, &key, AUTHORITY)).unwrap();

        let json: serde_json::Value =
            serde_json::from_slice(&fs::read(&att_path).unwrap()).unwrap();
        assert_eq!(json["ia"], AUTHORITY);
        assert!(json["raw_signature"].is_string());

        assert!(verify_files(&root_path, &att_path, &resolver_for(&key)).is_ok());
    }

    #[test]
    fn missing_attestation_file_is_untrusted() {
        let dir = tempfile::tempdir().unwrap();
        let root_path = dir.path().join("ca.crt");
        fs::write(&root_path, ROOT).unwrap();
        let key = generate_signing_key();
        assert!(matches!(
            verify_files(&root_path, &dir.path().join("missing.json"), &resolver_for(&key)),
            Err(Error::UntrustedRoot(_))
        ));
    }
}

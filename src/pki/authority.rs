//! The local certificate authority.
//!
//! Owns the P-256 root key pair and the serial counter. Every issuance
//! follows the same commit order:
//!
//! 1. sign with the current serial,
//! 2. persist `serial + 1`,
//! 3. only then release the certificate.
//!
//! If step 2 fails the certificate is dropped and the in-memory counter is
//! left untouched, so a serial can never be handed out twice.

use std::net::IpAddr;
use std::time::Duration;

use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, PublicKeyData,
    SanType, SerialNumber, string::Ia5String,
};
use rustls::pki_types::{CertificateDer, CertificateSigningRequestDer};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{error, info};

use crate::pki::csr::inspect_csr;
use crate::pki::store::{CERTIFICATE_LABEL, CertStore, EC_KEY_LABEL, encode_pem};
use crate::{Error, Result};

/// A loaded, ready-to-sign certificate authority.
pub struct CertificateAuthority {
    serial: u64,
    issuer: Issuer<'static, KeyPair>,
    root_der: Vec<u8>,
    store: CertStore,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("serial", &self.serial)
            .field("cert_file", &self.store.cert_file())
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Create a new root: fresh P-256 key, self-signed CA certificate valid
    /// for `validity`, serial counter at 1. All three are persisted.
    pub fn initialize(name: &str, validity: Duration, store: CertStore) -> Result<Self> {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| Error::Pki(format!("Failed to generate CA key: {e}")))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyCertSign];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];
        let (not_before, not_after) = validity_window(validity)?;
        params.not_before = not_before;
        params.not_after = not_after;

        let root = params
            .self_signed(&key)
            .map_err(|e| Error::Pki(format!("CA cert generation failed: {e}")))?;
        let root_der = root.der().to_vec();

        store.write_private_key(&key.serialize_der())?;
        store.write_serial(1)?;
        store.write_root_cert(&root_der)?;

        info!(
            name = name,
            fingerprint = %fingerprint(&root_der),
            cert_file = %store.cert_file().display(),
            "Certificate authority initialized"
        );

        Ok(Self {
            serial: 1,
            issuer: Issuer::new(params, key),
            root_der,
            store,
        })
    }

    /// Reconstruct the CA from disk. Any unreadable or inconsistent file is
    /// [`Error::CorruptState`].
    pub fn load(store: CertStore) -> Result<Self> {
        let serial = store.read_serial()?;
        let key_der = store.read_private_key()?;
        let root_der = store.read_root_cert()?;

        // rcgen parses keys from standard PKCS#8 PEM; our file only differs in label.
        let key = KeyPair::from_pem(&encode_pem("PRIVATE KEY", &key_der))
            .map_err(|e| Error::CorruptState(format!("cannot parse CA key: {e}")))?;

        let (_, parsed) = x509_parser::parse_x509_certificate(&root_der)
            .map_err(|e| Error::CorruptState(format!("cannot parse CA certificate: {e}")))?;
        if parsed.public_key().raw != key.subject_public_key_info().as_slice() {
            return Err(Error::CorruptState(
                "CA key does not match CA certificate".to_string(),
            ));
        }

        let issuer = Issuer::from_ca_cert_der(&CertificateDer::from(root_der.clone()), key)
            .map_err(|e| Error::CorruptState(format!("cannot rebuild CA issuer: {e}")))?;

        info!(serial = serial, fingerprint = %fingerprint(&root_der), "Certificate authority loaded");

        Ok(Self {
            serial,
            issuer,
            root_der,
            store,
        })
    }

    /// Serial number the next issued certificate will carry.
    #[must_use]
    pub fn next_serial(&self) -> u64 {
        self.serial
    }

    /// Root certificate, DER.
    #[must_use]
    pub fn root_der(&self) -> &[u8] {
        &self.root_der
    }

    /// Root certificate, PEM.
    #[must_use]
    pub fn root_pem(&self) -> String {
        encode_pem(CERTIFICATE_LABEL, &self.root_der)
    }

    /// Backing store.
    #[must_use]
    pub fn store(&self) -> &CertStore {
        &self.store
    }

    /// Issue a leaf certificate for a CSR after verifying its signature.
    ///
    /// Subject, SANs and public key are taken from the CSR; every other
    /// extension the CSR may request is replaced by the leaf profile.
    pub fn issue_from_csr(&mut self, csr_der: &[u8], validity: Duration) -> Result<Vec<u8>> {
        inspect_csr(csr_der)?;

        let mut csr = CertificateSigningRequestParams::from_der(
            &CertificateSigningRequestDer::from(csr_der.to_vec()),
        )
        .map_err(|e| Error::MalformedRequest(format!("cannot read CSR: {e}")))?;
        self.apply_leaf_profile(&mut csr.params, validity)?;

        let cert = csr
            .signed_by(&self.issuer)
            .map_err(|e| Error::Pki(format!("Leaf cert signing failed: {e}")))?;
        self.commit(cert.der().to_vec())
    }

    /// Issue a leaf certificate for an explicit subject and public key.
    pub fn issue_for_subject(
        &mut self,
        name: &str,
        public_key: &impl PublicKeyData,
        validity: Duration,
        dns_names: &[String],
        ips: &[IpAddr],
    ) -> Result<Vec<u8>> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, name);
        params.distinguished_name = dn;

        let mut sans: Vec<SanType> = Vec::new();
        for dns in dns_names {
            let ia5 = Ia5String::try_from(dns.as_str())
                .map_err(|e| Error::Pki(format!("Invalid DNS SAN '{dns}': {e}")))?;
            sans.push(SanType::DnsName(ia5));
        }
        sans.extend(ips.iter().copied().map(SanType::IpAddress));
        params.subject_alt_names = sans;

        self.apply_leaf_profile(&mut params, validity)?;
        let cert = params
            .signed_by(public_key, &self.issuer)
            .map_err(|e| Error::Pki(format!("Leaf cert signing failed: {e}")))?;
        self.commit(cert.der().to_vec())
    }

    fn apply_leaf_profile(&self, params: &mut CertificateParams, validity: Duration) -> Result<()> {
        let (not_before, not_after) = validity_window(validity)?;
        params.serial_number = Some(SerialNumber::from(self.serial));
        params.not_before = not_before;
        params.not_after = not_after;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];
        params.use_authority_key_identifier_extension = true;
        Ok(())
    }

    fn commit(&mut self, der: Vec<u8>) -> Result<Vec<u8>> {
        let issued = self.serial;
        let next = issued
            .checked_add(1)
            .ok_or_else(|| Error::Pki("serial counter exhausted".to_string()))?;

        if let Err(e) = self.store.write_serial(next) {
            error!(serial = issued, error = %e, "Serial persist failed, certificate withheld");
            return Err(e);
        }
        self.serial = next;

        info!(serial = issued, fingerprint = %fingerprint(&der), "Issued certificate");
        Ok(der)
    }
}

/// SHA-256 fingerprint of a DER blob, lowercase hex.
#[must_use]
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Parse an `ECDSA PRIVATE KEY` PEM (as written by this crate) into a key pair.
pub fn key_pair_from_ec_pem(pem_text: &[u8]) -> Result<KeyPair> {
    let der = crate::pki::store::decode_pem(pem_text, EC_KEY_LABEL)?;
    KeyPair::from_pem(&encode_pem("PRIVATE KEY", &der))
        .map_err(|e| Error::Pki(format!("cannot parse private key: {e}")))
}

fn validity_window(validity: Duration) -> Result<(OffsetDateTime, OffsetDateTime)> {
    let span = time::Duration::try_from(validity)
        .map_err(|e| Error::Pki(format!("validity out of range: {e}")))?;
    let now = OffsetDateTime::now_utc();
    let not_after = now
        .checked_add(span)
        .ok_or_else(|| Error::Pki("validity out of range".to_string()))?;
    Ok((now, not_after))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

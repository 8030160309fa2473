//! Certificate signing requests: building them on the requester side and
//! validating them on the authority side.
//!
//! The authority never trusts CSR contents before the CSR's self-signature has
//! been checked with [`inspect_csr`]; a request that fails the check is
//! reported as [`Error::MalformedRequest`].

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType, string::Ia5String};
use trust_types::IssuanceKey;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;

use crate::pki::store::{CSR_LABEL, EC_KEY_LABEL, decode_pem, encode_pem};
use crate::{Error, Result};

/// What a requester asks to be certified as.
#[derive(Debug, Clone)]
pub struct CsrRequest {
    /// Peer identity, used as the subject common name.
    pub identity: String,
    /// Requester type, used as the subject organizational unit.
    pub node_type: String,
    /// Requester IP, placed in an IP SAN.
    pub ip: IpAddr,
    /// Additional DNS SANs.
    pub dns_names: Vec<String>,
}

/// Freshly generated requester key and CSR, both PEM.
#[derive(Debug)]
pub struct GeneratedCsr {
    /// `ECDSA PRIVATE KEY` PEM of the requester key.
    pub key_pem: String,
    /// `CERTIFICATE REQUEST` PEM.
    pub csr_pem: String,
}

/// Generate a P-256 key and a CSR for `request`.
pub fn build_csr(request: &CsrRequest) -> Result<GeneratedCsr> {
    let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| Error::Pki(format!("Failed to generate requester key: {e}")))?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, request.identity.as_str());
    dn.push(DnType::OrganizationalUnitName, request.node_type.as_str());
    params.distinguished_name = dn;

    let mut sans = vec![SanType::IpAddress(request.ip)];
    for dns in &request.dns_names {
        let ia5 = Ia5String::try_from(dns.as_str())
            .map_err(|e| Error::Pki(format!("Invalid DNS SAN '{dns}': {e}")))?;
        sans.push(SanType::DnsName(ia5));
    }
    params.subject_alt_names = sans;

    let csr = params
        .serialize_request(&key)
        .map_err(|e| Error::Pki(format!("CSR generation failed: {e}")))?;

    Ok(GeneratedCsr {
        key_pem: encode_pem(EC_KEY_LABEL, &key.serialize_der()),
        csr_pem: encode_pem(CSR_LABEL, csr.der()),
    })
}

/// Fields the authority needs from a verified CSR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrInfo {
    /// Subject common name, if any.
    pub common_name: Option<String>,
    /// First organizational unit of the subject.
    pub node_type: Option<String>,
    /// First IP SAN.
    pub ip: Option<IpAddr>,
}

impl CsrInfo {
    /// Issuance key `(type, ip)`; both parts are required.
    pub fn issuance_key(&self) -> Result<IssuanceKey> {
        let node_type = self.node_type.as_deref().ok_or_else(|| {
            Error::MalformedRequest("CSR subject has no organizational unit".to_string())
        })?;
        let ip = self
            .ip
            .ok_or_else(|| Error::MalformedRequest("CSR has no IP address SAN".to_string()))?;
        Ok(IssuanceKey::new(node_type, ip.to_string()))
    }
}

/// Parse `der`, verify its self-signature, and extract the fields we key on.
pub fn inspect_csr(der: &[u8]) -> Result<CsrInfo> {
    let (_, csr) = X509CertificationRequest::from_der(der)
        .map_err(|e| Error::MalformedRequest(format!("cannot parse CSR: {e}")))?;
    csr.verify_signature()
        .map_err(|e| Error::MalformedRequest(format!("CSR signature does not verify: {e}")))?;

    let subject = &csr.certification_request_info.subject;
    let common_name = subject
        .iter_common_name()
        .next()
        .and_then(|a| a.as_str().ok())
        .map(str::to_owned);
    let node_type = subject
        .iter_organizational_unit()
        .next()
        .and_then(|a| a.as_str().ok())
        .map(str::to_owned);

    let mut ip = None;
    if let Some(extensions) = csr.requested_extensions() {
        for ext in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = ext {
                ip = san.general_names.iter().find_map(|name| match name {
                    GeneralName::IPAddress(bytes) => ip_from_bytes(bytes),
                    _ => None,
                });
                if ip.is_some() {
                    break;
                }
            }
        }
    }

    Ok(CsrInfo {
        common_name,
        node_type,
        ip,
    })
}

/// Decode a request body: base64 of either a PEM CSR or raw CSR DER.
pub fn decode_request_body(body: &[u8]) -> Result<Vec<u8>> {
    let trimmed: Vec<u8> = body
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if trimmed.is_empty() {
        return Err(Error::MalformedRequest("empty request body".to_string()));
    }
    let decoded = STANDARD
        .decode(&trimmed)
        .map_err(|e| Error::MalformedRequest(format!("body is not base64: {e}")))?;

    if decoded.starts_with(b"-----BEGIN") {
        decode_pem(&decoded, CSR_LABEL).map_err(|e| Error::MalformedRequest(e.to_string()))
    } else {
        Ok(decoded)
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(|b| IpAddr::V4(Ipv4Addr::from(b))),
        16 => <[u8; 16]>::try_from(bytes)
            .ok()
            .map(|b| IpAddr::V6(Ipv6Addr::from(b))),
        _ => None,
    }
}

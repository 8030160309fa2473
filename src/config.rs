//! Configuration management

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Certificate authority state and issuance defaults
    pub ca: CaConfig,
    /// Trust-anchor lookup used by the bootstrap check
    pub trust: TrustConfig,
    /// Certificate distribution server (authority side)
    pub authority: AuthorityConfig,
    /// Certificate distribution client (requester side)
    pub distribution: DistributionConfig,
    /// Scrape access control
    pub access: AccessConfig,
}

impl Config {
    /// Load configuration from an optional YAML file, then `SCRAPE_TRUST_*`
    /// environment variables (`__` separates nested keys).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("SCRAPE_TRUST_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the system unusable at runtime.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("ca.validity", self.ca.validity),
            ("ca.leaf_validity", self.ca.leaf_validity),
            ("authority.signing_window", self.authority.signing_window),
            ("distribution.poll_interval", self.distribution.poll_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.ca.name.trim().is_empty() {
            return Err(Error::Config("ca.name must not be empty".to_string()));
        }
        if self.access.policy_file.as_os_str().is_empty() {
            return Err(Error::Config("access.policy_file must be set".to_string()));
        }
        Ok(())
    }
}

/// Certificate authority configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaConfig {
    /// Common name of the self-signed root
    pub name: String,
    /// Root certificate validity
    #[serde(with = "humantime_serde")]
    pub validity: Duration,
    /// Validity of certificates issued to fleet members
    #[serde(with = "humantime_serde")]
    pub leaf_validity: Duration,
    /// PEM file holding the root private key (`ECDSA PRIVATE KEY`)
    pub key_file: PathBuf,
    /// Decimal serial counter file
    pub serial_file: PathBuf,
    /// PEM file holding the root certificate
    pub cert_file: PathBuf,
    /// Directory of issued certificates, one `<type>_<ip>.crt` per requester
    pub approved_dir: PathBuf,
    /// Bootstrap attestation written at CA creation (`{"ia", "raw_signature"}`)
    pub attestation_file: PathBuf,
    /// Network identity of this authority, recorded in the attestation
    pub authority_identity: String,
    /// Ed25519 network signing key of this node (base64 seed)
    pub signing_key_file: PathBuf,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            name: "scrape-trust root CA".to_string(),
            validity: Duration::from_secs(10 * 365 * 86_400),
            leaf_validity: Duration::from_secs(365 * 86_400),
            key_file: PathBuf::from("ca/ca.key"),
            serial_file: PathBuf::from("ca/serial"),
            cert_file: PathBuf::from("ca/ca.crt"),
            approved_dir: PathBuf::from("ca/approved"),
            attestation_file: PathBuf::from("ca/bootstrap.json"),
            authority_identity: String::new(),
            signing_key_file: PathBuf::from("keys/node.key"),
        }
    }
}

/// Trust bootstrap configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Directory of authority verification keys (`<identity>-V<n>.pub`)
    pub keys_dir: PathBuf,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            keys_dir: PathBuf::from("keys/trust"),
        }
    }
}

/// Authority (certificate distribution server) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// How long signing stays enabled after an operator opens it
    #[serde(with = "humantime_serde")]
    pub signing_window: Duration,
    /// Bearer token for `/signing/*` (supports `env:VAR_NAME`).
    /// When unset the admin endpoints answer `503`.
    pub admin_token: Option<String>,
    /// Serve over TLS using this certificate (PEM)
    pub tls_cert: Option<PathBuf>,
    /// Private key for `tls_cert` (PEM)
    pub tls_key: Option<PathBuf>,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 10_443,
            signing_window: Duration::from_secs(3600),
            admin_token: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl AuthorityConfig {
    /// Resolve the admin token, expanding `env:VAR_NAME`.
    #[must_use]
    pub fn resolve_admin_token(&self) -> Option<String> {
        self.admin_token.as_ref().and_then(|token| {
            if let Some(var_name) = token.strip_prefix("env:") {
                std::env::var(var_name).ok()
            } else {
                Some(token.clone())
            }
        })
    }
}

/// Requester-side distribution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    /// Base URL of the authority (e.g. `https://10.0.0.1:10443`)
    pub authority_url: String,
    /// Root certificate used to authenticate the authority over TLS
    pub authority_ca_cert: Option<PathBuf>,
    /// Fixed wait between poll attempts
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Peer identity placed in the CSR's common name (defaults to `ip`)
    pub identity: String,
    /// Requester type, placed in the CSR's organizational unit
    pub node_type: String,
    /// Requester IP, placed in the CSR's IP SAN
    pub ip: String,
    /// Extra DNS SANs for the requested certificate
    pub dns_names: Vec<String>,
    /// Private key file for the requested certificate
    pub key_file: PathBuf,
    /// CSR file (created on first run)
    pub csr_file: PathBuf,
    /// Where the obtained certificate is written
    pub cert_file: PathBuf,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            authority_url: "https://127.0.0.1:10443".to_string(),
            authority_ca_cert: None,
            poll_interval: Duration::from_secs(30),
            identity: String::new(),
            node_type: "endpoint".to_string(),
            ip: "127.0.0.1".to_string(),
            dns_names: Vec::new(),
            key_file: PathBuf::from("certs/node.key"),
            csr_file: PathBuf::from("certs/node.csr"),
            cert_file: PathBuf::from("certs/node.crt"),
        }
    }
}

/// Scrape access-control configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// When `false`, every scrape is authorized (maintenance bypass)
    pub active: bool,
    /// Rule store (`p, sub, obj, act` / `g, member, role` lines)
    pub policy_file: PathBuf,
    /// Optional JSON list of role definitions loaded at startup
    pub roles_file: Option<PathBuf>,
    /// Identities (or identity prefixes) allowed to hold the `core` role
    pub core_identities: Vec<String>,
    /// Identities (or identity prefixes) allowed to hold the `neighbor` role
    pub neighbor_identities: Vec<String>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            active: true,
            policy_file: PathBuf::from("policy.csv"),
            roles_file: None,
            core_identities: Vec::new(),
            neighbor_identities: Vec::new(),
        }
    }
}

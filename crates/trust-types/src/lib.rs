//! Wire and file formats shared between the certificate authority, the
//! requesting nodes, and operator tooling.
//!
//! Nothing in here performs cryptography or I/O; the types only pin down how
//! things look on disk and on the wire so that every fleet member agrees.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A named bundle of permissions, as found in the roles definition file.
///
/// ```json
/// { "name": "ops", "permissions": { "/node": ["scrape", "up", "node_cpu"] } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Role {
    /// Role name as operators write it (without the internal `_role` suffix).
    pub name: String,
    /// Object (mapping path) to the set of actions granted on it.
    #[serde(default)]
    pub permissions: BTreeMap<String, Vec<String>>,
}

/// Signature binding a locally generated CA root to a network authority.
///
/// Serialised as `{ "ia": "<authority>", "raw_signature": "<base64>" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    /// Identity of the authority whose network key produced the signature.
    #[serde(rename = "ia")]
    pub authority: String,
    /// Raw signature bytes over the root certificate file contents.
    #[serde(with = "base64_bytes")]
    pub raw_signature: Vec<u8>,
}

/// Key under which an issued certificate is filed: `(requester type, requester IP)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IssuanceKey {
    /// Requester type, taken from the CSR's organizational unit (e.g. `endpoint`).
    pub node_type: String,
    /// Requester IP address in its canonical textual form.
    pub ip: String,
}

impl IssuanceKey {
    /// Build a key from its two parts.
    pub fn new(node_type: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
            ip: ip.into(),
        }
    }

    /// File stem used by the approved-certificate directory: `<type>_<ip>`.
    #[must_use]
    pub fn file_stem(&self) -> String {
        format!("{}_{}", self.node_type, self.ip)
    }

    /// Rejects parts that could escape the approved-certificate directory.
    #[must_use]
    pub fn is_path_safe(&self) -> bool {
        let ok = |s: &str| {
            !s.is_empty()
                && s
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '-' | '_'))
                && s != "."
                && s != ".."
        };
        ok(&self.node_type) && ok(&self.ip)
    }
}

impl fmt::Display for IssuanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node_type, self.ip)
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

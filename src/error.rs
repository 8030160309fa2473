//! Error types for scrape-trust

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for scrape-trust
pub type Result<T> = std::result::Result<T, Error>;

/// scrape-trust errors
#[derive(Error, Debug)]
pub enum Error {
    /// The subject holds no `scrape` capability on the object.
    #[error("{subject} not authorized to scrape {object}")]
    NotAuthorized {
        /// Calling peer identity
        subject: String,
        /// Requested object (mapping path)
        object: String,
    },

    /// The subject's access window lapsed; the grant has been revoked.
    #[error("time window for {subject} on {object} has expired")]
    TimeExpired {
        /// Calling peer identity
        subject: String,
        /// Requested object (mapping path)
        object: String,
    },

    /// The subject scraped too recently.
    #[error("next scrape for {subject} on {object} authorized in {}", human(.retry_after))]
    RateLimited {
        /// Calling peer identity
        subject: String,
        /// Requested object (mapping path)
        object: String,
        /// Time left until the next access is allowed
        retry_after: Duration,
    },

    /// Attempt to grant a reserved role to an identity outside its topology set.
    #[error("{subject} is not allowed to have reserved role {role}")]
    ReservedRole {
        /// Identity the role was requested for
        subject: String,
        /// Requested role name
        role: String,
    },

    /// The CA root could not be tied to the network trust anchor.
    #[error("untrusted CA root: {0}")]
    UntrustedRoot(String),

    /// CA state on disk is missing or unparsable.
    #[error("corrupt CA state: {0}")]
    CorruptState(String),

    /// The authority is not signing certificates right now.
    #[error("certificate signing is blocked")]
    SigningBlocked,

    /// A certificate request could not be decoded or is missing fields.
    #[error("malformed certificate request: {0}")]
    MalformedRequest(String),

    /// No certificate is available for the requester yet.
    #[error("certificate not available: {0}")]
    NotReady(String),

    /// Certificate generation or parsing error
    #[error("PKI error: {0}")]
    Pki(String),

    /// Policy store error
    #[error("Policy error: {0}")]
    Policy(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Shut down while waiting
    #[error("Shutdown")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

fn human(d: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*d)
}

impl Error {
    /// `true` for the outcomes of an authorization decision that deny access.
    #[must_use]
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            Self::NotAuthorized { .. } | Self::TimeExpired { .. } | Self::RateLimited { .. }
        )
    }

    /// HTTP status used when this error answers a certificate or scrape request.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::SigningBlocked => 401,
            Self::MalformedRequest(_) => 400,
            Self::NotReady(_) => 404,
            Self::NotAuthorized { .. } | Self::TimeExpired { .. } | Self::ReservedRole { .. } => 403,
            Self::RateLimited { .. } => 429,
            _ => 500,
        }
    }

    /// Retry-after hint for rate-limited requests.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

//! Security audit trail for issuance and authorization decisions.
//!
//! Every event is emitted on the `audit` tracing target with the serialized
//! event in the `audit` field, so it can be routed separately from
//! operational logs:
//!
//! ```text
//! INFO audit: audit={"event":"access.expired","subject":"1-ff00:0:111,[10.0.0.7]",...}
//! ```
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `cert.issued` | A new certificate was signed and filed |
//! | `cert.reissued` | A request matched an already issued certificate |
//! | `cert.blocked` | A request arrived while signing was blocked |
//! | `signing.enabled` / `signing.blocked` | The signing gate changed state |
//! | `access.denied` | Scrape refused: no `scrape` capability |
//! | `access.expired` | Window lapsed; the grant was revoked |
//! | `access.rate_limited` | Scrape refused by a frequency permission |
//! | `role.reserved_violation` | Reserved role requested for an identity outside its set |

use std::time::Duration;

use serde::Serialize;

/// Structured audit event.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g. `"cert.issued"`).
    pub event: &'static str,
    /// Peer identity or requester key the event concerns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Object (mapping path) or role name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    /// Certificate serial, for issuance events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<u64>,
    /// Seconds until retry, for rate-limit events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    /// Human-readable detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    fn new(event: &'static str) -> Self {
        Self {
            event,
            subject: None,
            object: None,
            serial: None,
            retry_after_secs: None,
            reason: None,
        }
    }

    /// `cert.issued`
    #[must_use]
    pub fn cert_issued(requester: &str, serial: u64) -> Self {
        Self {
            subject: Some(requester.to_string()),
            serial: Some(serial),
            ..Self::new("cert.issued")
        }
    }

    /// `cert.reissued`
    #[must_use]
    pub fn cert_reissued(requester: &str) -> Self {
        Self {
            subject: Some(requester.to_string()),
            ..Self::new("cert.reissued")
        }
    }

    /// `cert.blocked`
    #[must_use]
    pub fn cert_blocked() -> Self {
        Self::new("cert.blocked")
    }

    /// `signing.enabled` with the window length.
    #[must_use]
    pub fn signing_enabled(window: Duration) -> Self {
        Self {
            reason: Some(format!("for {}", humantime::format_duration(window))),
            ..Self::new("signing.enabled")
        }
    }

    /// `signing.blocked`
    #[must_use]
    pub fn signing_blocked(reason: &str) -> Self {
        Self {
            reason: Some(reason.to_string()),
            ..Self::new("signing.blocked")
        }
    }

    /// `access.denied`
    #[must_use]
    pub fn access_denied(subject: &str, object: &str) -> Self {
        Self {
            subject: Some(subject.to_string()),
            object: Some(object.to_string()),
            ..Self::new("access.denied")
        }
    }

    /// `access.expired`
    #[must_use]
    pub fn access_expired(subject: &str, object: &str) -> Self {
        Self {
            subject: Some(subject.to_string()),
            object: Some(object.to_string()),
            ..Self::new("access.expired")
        }
    }

    /// `access.rate_limited`
    #[must_use]
    pub fn access_rate_limited(subject: &str, object: &str, retry_after: Duration) -> Self {
        Self {
            subject: Some(subject.to_string()),
            object: Some(object.to_string()),
            retry_after_secs: Some(retry_after.as_secs()),
            ..Self::new("access.rate_limited")
        }
    }

    /// `role.reserved_violation`
    #[must_use]
    pub fn reserved_role_violation(subject: &str, role: &str) -> Self {
        Self {
            subject: Some(subject.to_string()),
            object: Some(role.to_string()),
            ..Self::new("role.reserved_violation")
        }
    }
}

/// Emit an audit event on the `audit` target.
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(target: "audit", audit = %json, "audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}

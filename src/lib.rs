//! scrape-trust library
//!
//! Trust issuance and temporal access control for a federated monitoring
//! fleet.
//!
//! # Features
//!
//! - **Certificate authority**: P-256 root, leaf issuance from verified CSRs,
//!   crash-safe serial accounting
//! - **Trust bootstrap**: Ed25519 attestation tying the CA root to a network
//!   authority identity
//! - **Distribution**: operator-gated request/poll protocol for handing out
//!   certificates
//! - **Access control**: `scrape` capabilities with expiring windows,
//!   frequency limits, reserved roles and per-metric filtering

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod access;
pub mod audit;
pub mod cli;
pub mod config;
pub mod distribution;
pub mod error;
pub mod pki;
pub mod policy;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(format!("tracing already initialized: {e}")))?,
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(format!("tracing already initialized: {e}")))?,
    }

    Ok(())
}

//! Certificate authority, certificate store and trust bootstrap.
//!
//! - [`store`]: file formats and atomic persistence
//! - [`csr`]: building CSRs (requester) and verifying them (authority)
//! - [`authority`]: the CA itself, with crash-safe serial accounting
//! - [`bootstrap`]: Ed25519 attestation of the CA root

pub mod authority;
pub mod bootstrap;
pub mod csr;
pub mod store;

pub use authority::{CertificateAuthority, fingerprint};
pub use bootstrap::{KeyDirectoryResolver, VerificationKeyResolver};
pub use csr::{CsrInfo, CsrRequest, GeneratedCsr, build_csr, inspect_csr};
pub use store::{ApprovedCerts, CertStore};

//! HTTP side of the certificate authority.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/certificate/request` | Submit a base64 CSR, receive a base64 certificate |
//! | `GET` | `/certificates/{type}/{ip}/get` | Fetch a previously issued certificate |
//! | `POST` | `/signing/enable` | Open the signing window (admin) |
//! | `POST` | `/signing/block` | Close the signing window (admin) |
//!
//! ## Certificate request
//!
//! The body is the base64 encoding of a PEM (or DER) CSR, content type
//! `application/base64`. Responses:
//!
//! - `200`: base64 of the issued certificate file (PEM)
//! - `401`: signing is blocked, retry later
//! - `400`: the CSR is malformed or its signature does not verify
//!
//! A request whose `(type, ip)` already has a certificate gets that same
//! certificate back; nothing new is signed.
//!
//! ## Admin Authentication
//!
//! `/signing/*` require `Authorization: Bearer <admin_token>`. If no admin
//! token is configured they return `503 Service Unavailable`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use trust_types::IssuanceKey;

use super::gate::SigningGate;
use crate::audit::{self, AuditEvent};
use crate::config::AuthorityConfig;
use crate::pki::csr::{decode_request_body, inspect_csr};
use crate::pki::{ApprovedCerts, CertificateAuthority};
use crate::{Error, Result};

/// Content type of request and response bodies.
pub const BASE64_CONTENT_TYPE: &str = "application/base64";

// ── Authority state ───────────────────────────────────────────────────────

/// Issuing authority: CA, issued-certificate directory and signing gate.
pub struct Authority {
    ca: Mutex<CertificateAuthority>,
    approved: ApprovedCerts,
    gate: SigningGate,
    leaf_validity: Duration,
    signing_window: Duration,
    admin_token: Option<String>,
}

impl std::fmt::Debug for Authority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authority")
            .field("ca", &*self.ca.lock())
            .field("signing_enabled", &self.gate.is_enabled())
            .finish_non_exhaustive()
    }
}

impl Authority {
    /// Assemble an authority. Signing starts blocked.
    pub fn new(
        ca: CertificateAuthority,
        approved: ApprovedCerts,
        leaf_validity: Duration,
        signing_window: Duration,
        admin_token: Option<String>,
    ) -> Self {
        Self {
            ca: Mutex::new(ca),
            approved,
            gate: SigningGate::new(),
            leaf_validity,
            signing_window,
            admin_token,
        }
    }

    /// The signing gate.
    #[must_use]
    pub fn gate(&self) -> &SigningGate {
        &self.gate
    }

    /// Handle a certificate request body; returns the base64 certificate file.
    ///
    /// The CA lock is held from the existence check through filing, so two
    /// requests for the same key cannot both be signed.
    pub fn handle_request(&self, body: &[u8]) -> Result<String> {
        if !self.gate.is_enabled() {
            audit::emit(&AuditEvent::cert_blocked());
            return Err(Error::SigningBlocked);
        }

        let csr_der = decode_request_body(body)?;
        let key = inspect_csr(&csr_der)?.issuance_key()?;
        let requester = key.to_string();

        let mut ca = self.ca.lock();
        if let Some(existing) = self.approved.get(&key)? {
            debug!(requester = %requester, "Certificate already issued, returning it");
            audit::emit(&AuditEvent::cert_reissued(&requester));
            return Ok(STANDARD.encode(existing));
        }

        let serial = ca.next_serial();
        let der = ca.issue_from_csr(&csr_der, self.leaf_validity)?;
        let file = self.approved.put(&key, &der)?;
        drop(ca);

        info!(requester = %requester, serial = serial, "Certificate issued");
        audit::emit(&AuditEvent::cert_issued(&requester, serial));
        Ok(STANDARD.encode(file))
    }

    /// Base64 certificate file for `key`, or [`Error::NotReady`].
    pub fn lookup(&self, key: &IssuanceKey) -> Result<String> {
        match self.approved.get(key)? {
            Some(file) => Ok(STANDARD.encode(file)),
            None => Err(Error::NotReady(key.to_string())),
        }
    }

    /// Open signing for the configured window; returns the operator message.
    pub fn enable_signing(&self) -> String {
        self.gate.enable(self.signing_window);
        format!(
            "Signing enabled for {}",
            humantime::format_duration(self.signing_window)
        )
    }

    /// Close signing.
    pub fn block_signing(&self) -> String {
        self.gate.block();
        "Signing blocked".to_string()
    }
}

// ── Route builder ─────────────────────────────────────────────────────────

/// Build the authority routes.
pub fn authority_routes(authority: Arc<Authority>) -> Router {
    Router::new()
        .route("/certificate/request", post(request_certificate))
        .route("/certificates/{type}/{ip}/get", get(get_certificate))
        .route("/signing/enable", post(enable_signing))
        .route("/signing/block", post(block_signing))
        .layer(TraceLayer::new_for_http())
        .with_state(authority)
}

// ── Handlers ──────────────────────────────────────────────────────────────

/// `POST /certificate/request`
async fn request_certificate(State(authority): State<Arc<Authority>>, body: Bytes) -> Response {
    // Issuance does file I/O under a lock; keep it off the async workers.
    let result = tokio::task::spawn_blocking(move || authority.handle_request(&body))
        .await
        .map_err(|e| Error::Internal(format!("issuance task failed: {e}")))
        .and_then(|r| r);

    match result {
        Ok(cert) => base64_response(cert),
        Err(e) => error_response(&e),
    }
}

/// `GET /certificates/{type}/{ip}/get`
async fn get_certificate(
    State(authority): State<Arc<Authority>>,
    Path((node_type, ip)): Path<(String, String)>,
) -> Response {
    let key = IssuanceKey::new(node_type, ip);
    match authority.lookup(&key) {
        Ok(cert) => base64_response(cert),
        Err(e) => error_response(&e),
    }
}

/// `POST /signing/enable`
async fn enable_signing(State(authority): State<Arc<Authority>>, headers: HeaderMap) -> Response {
    if let Err(response) = check_admin_auth(&authority, &headers) {
        return response;
    }
    (StatusCode::OK, authority.enable_signing()).into_response()
}

/// `POST /signing/block`
async fn block_signing(State(authority): State<Arc<Authority>>, headers: HeaderMap) -> Response {
    if let Err(response) = check_admin_auth(&authority, &headers) {
        return response;
    }
    (StatusCode::OK, authority.block_signing()).into_response()
}

// ── Helpers ───────────────────────────────────────────────────────────────

fn base64_response(body: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, BASE64_CONTENT_TYPE)],
        body,
    )
        .into_response()
}

fn error_response(e: &Error) -> Response {
    let status =
        StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    match e {
        Error::SigningBlocked => {
            (status, "Certificate request is blocked, retry later").into_response()
        }
        Error::MalformedRequest(msg) => {
            warn!(error = %msg, "Rejected certificate request");
            (status, e.to_string()).into_response()
        }
        Error::NotReady(_) => status.into_response(),
        _ => {
            error!(error = %e, "Certificate request failed");
            (status, "internal error").into_response()
        }
    }
}

/// Check `Authorization: Bearer <token>` against the admin token.
#[allow(clippy::result_large_err)]
fn check_admin_auth(authority: &Authority, headers: &HeaderMap) -> std::result::Result<(), Response> {
    use subtle::ConstantTimeEq;

    let Some(ref admin_token) = authority.admin_token else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "Admin token not configured, signing control disabled",
        )
            .into_response());
    };

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")));

    let matches = provided.is_some_and(|p| p.as_bytes().ct_eq(admin_token.as_bytes()).into());
    if matches {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Bearer")],
            "Invalid admin token",
        )
            .into_response())
    }
}

// ── Serving ───────────────────────────────────────────────────────────────

/// Serve the authority until `shutdown` fires, over TLS when both
/// `tls_cert` and `tls_key` are configured.
pub async fn serve(
    authority: Arc<Authority>,
    config: &AuthorityConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| Error::Config(format!("Invalid authority address: {e}")))?;
    let app = authority_routes(authority);

    match (&config.tls_cert, &config.tls_key) {
        (Some(cert), Some(key)) => {
            let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
                .await
                .map_err(|e| Error::Config(format!("Failed to load authority TLS material: {e}")))?;
            let handle = axum_server::Handle::new();
            let stopper = handle.clone();
            tokio::spawn(async move {
                let _ = shutdown.recv().await;
                stopper.graceful_shutdown(Some(Duration::from_secs(10)));
            });

            info!(address = %addr, "Authority listening (TLS)");
            axum_server::bind_rustls(addr, tls)
                .handle(handle)
                .serve(app.into_make_service())
                .await
                .map_err(|e| Error::Internal(e.to_string()))
        }
        (None, None) => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!(address = %addr, "Authority listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.recv().await;
                })
                .await
                .map_err(|e| Error::Internal(e.to_string()))
        }
        _ => Err(Error::Config(
            "authority.tls_cert and authority.tls_key must be set together".to_string(),
        )),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::path::Path as FsPath;

    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::pki::csr::{CsrRequest, build_csr};
    use crate::pki::CertStore;

    const YEAR: Duration = Duration::from_secs(365 * 86_400);

    fn authority_in(dir: &FsPath, token: Option<&str>) -> Arc<Authority> {
        let store = CertStore::new(dir.join("ca.key"), dir.join("serial"), dir.join("ca.crt"));
        let ca = CertificateAuthority::initialize("Fleet CA", YEAR, store).unwrap();
        Arc::new(Authority::new(
            ca,
            ApprovedCerts::new(dir.join("approved")),
            YEAR,
            Duration::from_secs(3600),
            token.map(str::to_string),
        ))
    }

    fn body_for(ip: &str) -> String {
        let generated = build_csr(&CsrRequest {
            identity: format!("1-ff00:0:111,[{ip}]"),
            node_type: "endpoint".to_string(),
            ip: ip.parse().unwrap(),
            dns_names: vec![],
        })
        .unwrap();
        STANDARD.encode(generated.csr_pem)
    }

    #[tokio::test]
    async fn blocked_authority_refuses_requests() {
        // GIVEN: a freshly started authority (blocked)
        let dir = tempfile::tempdir().unwrap();
        let authority = authority_in(dir.path(), None);
        // WHEN: a request arrives
        let err = authority.handle_request(body_for("10.0.0.1").as_bytes()).unwrap_err();
        // THEN: it is refused and nothing is signed
        assert!(matches!(err, Error::SigningBlocked));
        assert_eq!(authority.ca.lock().next_serial(), 1);
    }

    #[tokio::test]
    async fn repeated_request_returns_identical_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let authority = authority_in(dir.path(), None);
        authority.enable_signing();

        let body = body_for("10.0.0.1");
        let first = authority.handle_request(body.as_bytes()).unwrap();
        // A different key pair for the same (type, ip) still gets the filed cert.
        let second = authority.handle_request(body_for("10.0.0.1").as_bytes()).unwrap();

        assert_eq!(first, second);
        assert_eq!(authority.ca.lock().next_serial(), 2);
        assert_eq!(
            authority
                .lookup(&IssuanceKey::new("endpoint", "10.0.0.1"))
                .unwrap(),
            first
        );
    }

    #[tokio::test]
    async fn lookup_before_issuance_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let authority = authority_in(dir.path(), None);
        assert!(matches!(
            authority.lookup(&IssuanceKey::new("endpoint", "10.0.0.9")),
            Err(Error::NotReady(_))
        ));
    }

    #[tokio::test]
    async fn http_statuses_follow_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let authority = authority_in(dir.path(), Some("admin"));
        let app = authority_routes(Arc::clone(&authority));

        // Blocked: 401
        let resp = app
            .clone()
            .oneshot(
                Request::post("/certificate/request")
                    .header(header::CONTENT_TYPE, BASE64_CONTENT_TYPE)
                    .body(Body::from(body_for("10.0.0.1")))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        // Not yet issued: 404
        let resp = app
            .clone()
            .oneshot(
                Request::get("/certificates/endpoint/10.0.0.1/get")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        // Enable with the admin token
        let resp = app
            .clone()
            .oneshot(
                Request::post("/signing/enable")
                    .header(header::AUTHORIZATION, "Bearer admin")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&text[..], b"Signing enabled for 1h");

        // Garbage: 400
        let resp = app
            .clone()
            .oneshot(
                Request::post("/certificate/request")
                    .body(Body::from("bm90IGEgY3Ny"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        // Issued: 200, base64 PEM
        let resp = app
            .clone()
            .oneshot(
                Request::post("/certificate/request")
                    .body(Body::from(body_for("10.0.0.1")))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let pem = STANDARD.decode(&body).unwrap();
        assert!(pem.starts_with(b"-----BEGIN CERTIFICATE-----"));

        // Now retrievable by GET
        let resp = app
            .oneshot(
                Request::get("/certificates/endpoint/10.0.0.1/get")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn admin_endpoints_require_token() {
        let dir = tempfile::tempdir().unwrap();

        let unconfigured = authority_routes(authority_in(dir.path(), None));
        let resp = unconfigured
            .oneshot(Request::post("/signing/enable").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let dir = tempfile::tempdir().unwrap();
        let authority = authority_in(dir.path(), Some("admin"));
        let resp = authority_routes(Arc::clone(&authority))
            .oneshot(
                Request::post("/signing/enable")
                    .header(header::AUTHORIZATION, "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(!authority.gate().is_enabled());
    }

    #[tokio::test]
    async fn block_endpoint_closes_gate() {
        let dir = tempfile::tempdir().unwrap();
        let authority = authority_in(dir.path(), Some("admin"));
        authority.enable_signing();

        let resp = authority_routes(Arc::clone(&authority))
            .oneshot(
                Request::post("/signing/block")
                    .header(header::AUTHORIZATION, "Bearer admin")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!authority.gate().is_enabled());
    }
}

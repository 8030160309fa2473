//! Requester side of the distribution protocol.
//!
//! A node without a certificate submits its CSR, and while the authority
//! answers "blocked" or "not ready" it waits a fixed interval and asks again.
//! There is no retry limit: availability is gated by an operator. Transport
//! failures and local write failures are retried. Only a `400` (the authority
//! cannot use the CSR), an unusable certificate payload, or shutdown ends the
//! loop early.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use trust_types::IssuanceKey;
use url::Url;

use super::server::BASE64_CONTENT_TYPE;
use crate::pki::store::{CERTIFICATE_LABEL, decode_pem, write_atomic};
use crate::{Error, Result};

/// Status and body of one exchange with the authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportReply {
    /// HTTP status code
    pub status: u16,
    /// Raw response body
    pub body: Vec<u8>,
}

/// How the requester reaches the authority.
#[async_trait]
pub trait CertificateTransport: Send + Sync {
    /// `POST /certificate/request` with a base64 CSR body.
    async fn request(&self, csr_b64: &str) -> Result<TransportReply>;

    /// `GET /certificates/{type}/{ip}/get`.
    async fn fetch(&self, key: &IssuanceKey) -> Result<TransportReply>;
}

// ── HTTP transport ────────────────────────────────────────────────────────

/// [`CertificateTransport`] over HTTP(S) with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base: Url,
}

impl HttpTransport {
    /// Talk to the authority at `base_url`, optionally trusting `root_pem`
    /// as the authority's TLS root.
    pub fn new(base_url: &str, root_pem: Option<&[u8]>) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("Invalid authority URL '{base_url}': {e}")))?;

        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30));
        if let Some(pem) = root_pem {
            let root = reqwest::Certificate::from_pem(pem)?;
            builder = builder.add_root_certificate(root);
        }

        Ok(Self {
            client: builder.build()?,
            base,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| Error::Config(format!("Invalid authority path '{path}': {e}")))
    }
}

#[async_trait]
impl CertificateTransport for HttpTransport {
    async fn request(&self, csr_b64: &str) -> Result<TransportReply> {
        let response = self
            .client
            .post(self.endpoint("/certificate/request")?)
            .header(reqwest::header::CONTENT_TYPE, BASE64_CONTENT_TYPE)
            .body(csr_b64.to_string())
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        Ok(TransportReply { status, body })
    }

    async fn fetch(&self, key: &IssuanceKey) -> Result<TransportReply> {
        let path = format!("/certificates/{}/{}/get", key.node_type, key.ip);
        let response = self.client.get(self.endpoint(&path)?).send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        Ok(TransportReply { status, body })
    }
}

// ── Poll loop ─────────────────────────────────────────────────────────────

/// What a single reply means for the poll loop.
#[derive(Debug)]
enum Outcome {
    Issued(Vec<u8>),
    Wait,
}

/// Drives the request/poll exchange for one requester.
pub struct CertificateRequester {
    transport: Arc<dyn CertificateTransport>,
    key: IssuanceKey,
    poll_interval: Duration,
    cert_file: PathBuf,
}

impl CertificateRequester {
    /// Poll `transport` for the certificate filed under `key`, writing it to
    /// `cert_file` once obtained.
    pub fn new(
        transport: Arc<dyn CertificateTransport>,
        key: IssuanceKey,
        poll_interval: Duration,
        cert_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            transport,
            key,
            poll_interval,
            cert_file: cert_file.into(),
        }
    }

    /// Obtain a certificate for `csr_pem`. Returns the certificate file
    /// contents (PEM) after writing them to disk.
    ///
    /// Each round submits the CSR, and if the authority is blocked or not
    /// ready, waits `poll_interval` and tries the lookup endpoint.
    pub async fn obtain(
        &self,
        csr_pem: &str,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<Vec<u8>> {
        let body = STANDARD.encode(csr_pem);
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            info!(requester = %self.key, attempt = attempt, "Requesting certificate");
            let reply = self.transport.request(&body).await;
            if let Outcome::Issued(cert) = self.interpret(reply)? {
                if let Some(file) = self.store(cert) {
                    return Ok(file);
                }
            }

            self.wait(&mut shutdown).await?;

            let reply = self.transport.fetch(&self.key).await;
            if let Outcome::Issued(cert) = self.interpret(reply)? {
                if let Some(file) = self.store(cert) {
                    return Ok(file);
                }
            }

            self.wait(&mut shutdown).await?;
        }
    }

    fn interpret(&self, reply: Result<TransportReply>) -> Result<Outcome> {
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                warn!(requester = %self.key, error = %e, "Authority unreachable, will retry");
                return Ok(Outcome::Wait);
            }
        };

        match reply.status {
            200 if !reply.body.is_empty() => {
                let text: Vec<u8> = reply
                    .body
                    .iter()
                    .copied()
                    .filter(|b| !b.is_ascii_whitespace())
                    .collect();
                let file = STANDARD.decode(&text).map_err(|e| {
                    Error::MalformedRequest(format!("authority sent invalid base64: {e}"))
                })?;
                decode_pem(&file, CERTIFICATE_LABEL)?;
                Ok(Outcome::Issued(file))
            }
            200 | 204 | 404 => {
                debug!(requester = %self.key, status = reply.status, "Certificate not ready");
                Ok(Outcome::Wait)
            }
            401 => {
                info!(requester = %self.key, "Certificate signing is blocked, waiting");
                Ok(Outcome::Wait)
            }
            400 => Err(Error::MalformedRequest(
                String::from_utf8_lossy(&reply.body).into_owned(),
            )),
            other => {
                warn!(requester = %self.key, status = other, "Unexpected authority response, will retry");
                Ok(Outcome::Wait)
            }
        }
    }

    async fn wait(&self, shutdown: &mut broadcast::Receiver<()>) -> Result<()> {
        tokio::select! {
            () = tokio::time::sleep(self.poll_interval) => Ok(()),
            _ = shutdown.recv() => {
                debug!(requester = %self.key, "Certificate poll loop shutting down");
                Err(Error::Shutdown)
            }
        }
    }

    /// Write the certificate; `None` when the write failed and the loop
    /// should poll again.
    fn store(&self, file: Vec<u8>) -> Option<Vec<u8>> {
        if let Err(e) = write_atomic(&self.cert_file, &file) {
            warn!(
                requester = %self.key,
                path = %self.cert_file.display(),
                error = %e,
                "Cannot write certificate, will retry"
            );
            return None;
        }
        info!(
            requester = %self.key,
            path = %self.cert_file.display(),
            "Certificate received"
        );
        Some(file)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

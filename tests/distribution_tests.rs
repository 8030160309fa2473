//! End-to-end certificate distribution: CA bootstrap, authority, requester.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use trust_types::IssuanceKey;

use scrape_trust::distribution::{
    Authority, CertificateRequester, CertificateTransport, HttpTransport, TransportReply,
    authority_routes,
};
use scrape_trust::pki::store::{CERTIFICATE_LABEL, CSR_LABEL, decode_pem};
use scrape_trust::pki::{
    ApprovedCerts, CertStore, CertificateAuthority, CsrRequest, KeyDirectoryResolver, bootstrap,
    build_csr,
};
use scrape_trust::{Error, Result};

const YEAR: Duration = Duration::from_secs(365 * 86_400);
const AUTHORITY_IA: &str = "1-ff00:0:110";

struct Fixture {
    _dir: tempfile::TempDir,
    dir: std::path::PathBuf,
    authority: Arc<Authority>,
}

fn fixture() -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().to_path_buf();
    let store = CertStore::new(dir.join("ca/ca.key"), dir.join("ca/serial"), dir.join("ca/ca.crt"));
    let ca = CertificateAuthority::initialize("Fleet CA", YEAR, store).unwrap();
    let authority = Arc::new(Authority::new(
        ca,
        ApprovedCerts::new(dir.join("ca/approved")),
        YEAR,
        Duration::from_secs(3600),
        None,
    ));
    Fixture {
        _dir: tmp,
        dir,
        authority,
    }
}

fn csr_pem(ip: &str) -> String {
    build_csr(&CsrRequest {
        identity: format!("1-ff00:0:111,[{ip}]"),
        node_type: "endpoint".to_string(),
        ip: ip.parse().unwrap(),
        dns_names: vec![],
    })
    .unwrap()
    .csr_pem
}

/// Calls the authority directly, mapping errors to protocol statuses.
struct InProcess(Arc<Authority>);

fn to_reply(result: Result<String>) -> TransportReply {
    match result {
        Ok(body) => TransportReply {
            status: 200,
            body: body.into_bytes(),
        },
        Err(e) => TransportReply {
            status: e.status_code(),
            body: e.to_string().into_bytes(),
        },
    }
}

#[async_trait]
impl CertificateTransport for InProcess {
    async fn request(&self, csr_b64: &str) -> Result<TransportReply> {
        Ok(to_reply(self.0.handle_request(csr_b64.as_bytes())))
    }

    async fn fetch(&self, key: &IssuanceKey) -> Result<TransportReply> {
        Ok(to_reply(self.0.lookup(key)))
    }
}

#[tokio::test]
async fn requester_waits_for_operator_then_receives_chained_certificate() {
    // GIVEN: a blocked authority and a polling requester
    let fx = fixture();
    let requester = CertificateRequester::new(
        Arc::new(InProcess(Arc::clone(&fx.authority))),
        IssuanceKey::new("endpoint", "10.0.0.7"),
        Duration::from_millis(20),
        fx.dir.join("node/node.crt"),
    );
    let (_tx, rx) = broadcast::channel(1);
    let csr = csr_pem("10.0.0.7");
    let task = tokio::spawn(async move { requester.obtain(&csr, rx).await });

    // WHEN: the operator opens signing a little later
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!task.is_finished());
    fx.authority.enable_signing();

    // THEN: the certificate arrives and chains to the root
    let file = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let leaf_der = decode_pem(&file, CERTIFICATE_LABEL).unwrap();
    let root_der = decode_pem(&std::fs::read(fx.dir.join("ca/ca.crt")).unwrap(), CERTIFICATE_LABEL)
        .unwrap();
    let (_, root) = x509_parser::parse_x509_certificate(&root_der).unwrap();
    let (_, leaf) = x509_parser::parse_x509_certificate(&leaf_der).unwrap();
    assert!(leaf.verify_signature(Some(root.public_key())).is_ok());
    assert_eq!(std::fs::read(fx.dir.join("node/node.crt")).unwrap(), file);
    assert!(fx.dir.join("ca/approved/endpoint_10.0.0.7.crt").exists());
}

#[tokio::test]
async fn three_requesters_get_consecutive_serials_and_reissue_is_identical() {
    let fx = fixture();
    fx.authority.enable_signing();

    let mut serials = Vec::new();
    let mut first_files = Vec::new();
    for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
        let body = base64_of(&csr_pem(ip));
        let b64 = fx.authority.handle_request(body.as_bytes()).unwrap();
        let file = decode_b64(&b64);
        let der = decode_pem(&file, CERTIFICATE_LABEL).unwrap();
        let (_, cert) = x509_parser::parse_x509_certificate(&der).unwrap();
        serials.push(cert.serial.to_string());
        first_files.push(b64);
    }
    assert_eq!(
        serials,
        vec!["1", "2", "3"],
        "serials must be consecutive"
    );

    let again = fx
        .authority
        .handle_request(base64_of(&csr_pem("10.0.0.2")).as_bytes())
        .unwrap();
    assert_eq!(again, first_files[1]);
}

#[tokio::test]
async fn concurrent_requests_never_share_a_serial() {
    let fx = fixture();
    fx.authority.enable_signing();

    let handles: Vec<_> = (1..=8)
        .map(|n| {
            let authority = Arc::clone(&fx.authority);
            let body = base64_of(&csr_pem(&format!("10.0.1.{n}")));
            tokio::task::spawn_blocking(move || authority.handle_request(body.as_bytes()))
        })
        .collect();

    let mut serials = Vec::new();
    for handle in handles {
        let file = decode_b64(&handle.await.unwrap().unwrap());
        let der = decode_pem(&file, CERTIFICATE_LABEL).unwrap();
        let (_, cert) = x509_parser::parse_x509_certificate(&der).unwrap();
        serials.push(cert.serial.to_string());
    }
    serials.sort();
    serials.dedup();
    assert_eq!(serials.len(), 8);
    assert_eq!(
        std::fs::read_to_string(fx.dir.join("ca/serial")).unwrap(),
        "9"
    );
}

#[tokio::test]
async fn malformed_csr_aborts_requester() {
    let fx = fixture();
    fx.authority.enable_signing();
    let requester = CertificateRequester::new(
        Arc::new(InProcess(Arc::clone(&fx.authority))),
        IssuanceKey::new("endpoint", "10.0.0.7"),
        Duration::from_millis(10),
        fx.dir.join("node.crt"),
    );
    let (_tx, rx) = broadcast::channel(1);

    let pem = csr_pem("10.0.0.7");
    let mut tampered = decode_pem(pem.as_bytes(), CSR_LABEL).unwrap();
    let last = tampered.len() - 1;
    tampered[last] ^= 0xff;
    let tampered_pem = scrape_trust::pki::store::encode_pem(CSR_LABEL, &tampered);

    let err = requester.obtain(&tampered_pem, rx).await.unwrap_err();
    assert!(matches!(err, Error::MalformedRequest(_)));
}

#[tokio::test]
async fn requester_over_http() {
    // GIVEN: the authority served on an ephemeral port
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    let fx = fixture();
    fx.authority.enable_signing();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = authority_routes(Arc::clone(&fx.authority));
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    // WHEN: a requester polls it over HTTP
    let transport = HttpTransport::new(&format!("http://{addr}"), None).unwrap();
    let requester = CertificateRequester::new(
        Arc::new(transport),
        IssuanceKey::new("endpoint", "10.0.0.8"),
        Duration::from_millis(20),
        fx.dir.join("node.crt"),
    );
    let (_tx, rx) = broadcast::channel(1);
    let file = tokio::time::timeout(
        Duration::from_secs(10),
        requester.obtain(&csr_pem("10.0.0.8"), rx),
    )
    .await
    .unwrap()
    .unwrap();

    // THEN: the file matches what the authority filed
    assert_eq!(
        file,
        std::fs::read(fx.dir.join("ca/approved/endpoint_10.0.0.8.crt")).unwrap()
    );
    server.abort();
}

#[test]
fn root_attestation_verifies_through_key_directory() {
    // GIVEN: an initialized CA and an attestation by the authority key
    let fx = fixture();
    let key = bootstrap::generate_signing_key();
    let keys_dir = fx.dir.join("keys");
    bootstrap::write_verification_key(
        &keys_dir.join(format!("{}-V1.pub", bootstrap::identity_file_fmt(AUTHORITY_IA))),
        &key.verifying_key(),
    )
    .unwrap();
    let root_file = fx.dir.join("ca/ca.crt");
    let att_file = fx.dir.join("ca/bootstrap.json");
    let attestation = bootstrap::produce(&std::fs::read(&root_file).unwrap(), &key, AUTHORITY_IA);
    bootstrap::write_attestation(&att_file, &attestation).unwrap();
    let resolver = KeyDirectoryResolver::new(&keys_dir);

    // THEN: the untouched root verifies
    assert!(bootstrap::verify_files(&root_file, &att_file, &resolver).is_ok());

    // WHEN: one bit of the stored root changes
    let mut bytes = std::fs::read(&root_file).unwrap();
    bytes[40] ^= 0x01;
    std::fs::write(&root_file, &bytes).unwrap();

    // THEN: it is no longer trusted
    assert!(matches!(
        bootstrap::verify_files(&root_file, &att_file, &resolver),
        Err(Error::UntrustedRoot(_))
    ));
}

fn base64_of(text: &str) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(text)
}

fn decode_b64(text: &str) -> Vec<u8> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(text).unwrap()
}

//! scrape-trust - certificate authority, trust bootstrap and scrape access control

use std::net::IpAddr;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info};
use trust_types::IssuanceKey;

use scrape_trust::{
    access::{self, TimingKind},
    cli::{CaCommand, Cli, Command, PolicyCommand},
    config::Config,
    distribution::{self, Authority, CertificateRequester, HttpTransport},
    pki::{
        self, ApprovedCerts, CertStore, CertificateAuthority, CsrRequest, KeyDirectoryResolver,
        bootstrap,
        store::{CSR_LABEL, decode_pem, encode_pem, write_atomic, write_secret},
    },
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    // Both reqwest and axum-server use rustls; pin the provider once.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Ca(cmd) => run_ca_command(&config, cmd),
        Command::Keygen { out } => run_keygen(&out),
        Command::Authority => run_authority(&config).await,
        Command::Request => run_request(&config).await,
        Command::Policy(cmd) => run_policy_command(&config, cmd),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Command failed");
            eprintln!("❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn cert_store(config: &Config) -> CertStore {
    CertStore::new(
        &config.ca.key_file,
        &config.ca.serial_file,
        &config.ca.cert_file,
    )
}

/// Verify the root attestation, then load the CA.
fn trusted_ca(config: &Config) -> anyhow::Result<CertificateAuthority> {
    let resolver = KeyDirectoryResolver::new(&config.trust.keys_dir);
    bootstrap::verify_files(&config.ca.cert_file, &config.ca.attestation_file, &resolver)
        .context("CA root is not trusted, refusing to use it")?;
    Ok(CertificateAuthority::load(cert_store(config))?)
}

// ── ca ────────────────────────────────────────────────────────────────────

fn run_ca_command(config: &Config, cmd: CaCommand) -> anyhow::Result<()> {
    match cmd {
        CaCommand::Init {
            force,
            dns_names,
            ips,
        } => ca_init(config, force, &dns_names, &ips),
        CaCommand::Issue { csr, out } => {
            let mut ca = trusted_ca(config)?;
            let pem = std::fs::read(&csr)
                .with_context(|| format!("cannot read CSR '{}'", csr.display()))?;
            let der = decode_pem(&pem, CSR_LABEL)?;
            let cert = ca.issue_from_csr(&der, config.ca.leaf_validity)?;
            write_atomic(&out, encode_pem(pki::store::CERTIFICATE_LABEL, &cert).as_bytes())?;
            println!("✅ Issued {} (fingerprint {})", out.display(), pki::fingerprint(&cert));
            Ok(())
        }
        CaCommand::VerifyRoot => {
            let resolver = KeyDirectoryResolver::new(&config.trust.keys_dir);
            bootstrap::verify_files(&config.ca.cert_file, &config.ca.attestation_file, &resolver)?;
            println!("✅ CA root {} is attested", config.ca.cert_file.display());
            Ok(())
        }
    }
}

fn ca_init(config: &Config, force: bool, dns_names: &[String], ips: &[IpAddr]) -> anyhow::Result<()> {
    let store = cert_store(config);
    if store.exists() && !force {
        bail!(
            "CA state already exists at {}; pass --force to replace it",
            config.ca.cert_file.display()
        );
    }
    if config.ca.authority_identity.trim().is_empty() {
        bail!("ca.authority_identity must be set to attest the CA root");
    }
    let signing_key = bootstrap::read_signing_key(&config.ca.signing_key_file).with_context(|| {
        format!(
            "cannot read node signing key '{}' (create one with `scrape-trust keygen`)",
            config.ca.signing_key_file.display()
        )
    })?;

    let mut ca = CertificateAuthority::initialize(&config.ca.name, config.ca.validity, store)?;

    let root_bytes = ca.store().root_cert_file_bytes()?;
    let attestation = bootstrap::produce(&root_bytes, &signing_key, &config.ca.authority_identity);
    bootstrap::write_attestation(&config.ca.attestation_file, &attestation)?;
    println!("✅ CA root written to {}", config.ca.cert_file.display());
    println!("   Fingerprint: {}", pki::fingerprint(ca.root_der()));
    println!("   Attestation: {}", config.ca.attestation_file.display());

    match (&config.authority.tls_cert, &config.authority.tls_key) {
        (Some(cert_path), Some(key_path)) => {
            let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
                .context("cannot generate authority TLS key")?;
            let cert = ca.issue_for_subject(
                "scrape-trust authority",
                &key,
                config.ca.leaf_validity,
                dns_names,
                ips,
            )?;
            // rustls reads PKCS#8 keys under the standard label.
            write_secret(key_path, key.serialize_pem().as_bytes())?;
            write_atomic(
                cert_path,
                encode_pem(pki::store::CERTIFICATE_LABEL, &cert).as_bytes(),
            )?;
            println!("   Authority TLS certificate: {}", cert_path.display());
        }
        _ => println!("   authority.tls_cert/tls_key not set, skipping authority TLS certificate"),
    }
    Ok(())
}

// ── keygen ────────────────────────────────────────────────────────────────

fn run_keygen(out: &Path) -> anyhow::Result<()> {
    let key = bootstrap::generate_signing_key();
    let public = out.with_extension("pub");
    bootstrap::write_signing_key(out, &key)?;
    bootstrap::write_verification_key(&public, &key.verifying_key())?;
    println!("✅ Signing key: {}", out.display());
    println!("   Verification key: {}", public.display());
    println!("   Publish it to peers as <identity>-V<n>.pub in their trust.keys_dir");
    Ok(())
}

// ── authority ─────────────────────────────────────────────────────────────

async fn run_authority(config: &Config) -> anyhow::Result<()> {
    let ca = trusted_ca(config)?;
    let authority = Arc::new(Authority::new(
        ca,
        ApprovedCerts::new(&config.ca.approved_dir),
        config.ca.leaf_validity,
        config.authority.signing_window,
        config.authority.resolve_admin_token(),
    ));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(distribution::shutdown_signal(shutdown_tx));

    info!(
        host = %config.authority.host,
        port = config.authority.port,
        "Starting certificate authority (signing blocked until enabled)"
    );
    distribution::serve(authority, &config.authority, shutdown_rx).await?;
    info!("Authority stopped");
    Ok(())
}

// ── request ───────────────────────────────────────────────────────────────

async fn run_request(config: &Config) -> anyhow::Result<()> {
    let dist = &config.distribution;
    if dist.cert_file.exists() {
        println!("✅ Certificate already present at {}", dist.cert_file.display());
        return Ok(());
    }

    let ip: IpAddr = dist
        .ip
        .parse()
        .with_context(|| format!("distribution.ip '{}' is not an IP address", dist.ip))?;

    let csr_pem = if dist.csr_file.exists() {
        let text = std::fs::read_to_string(&dist.csr_file)?;
        decode_pem(text.as_bytes(), CSR_LABEL)
            .with_context(|| format!("'{}' is not a CSR", dist.csr_file.display()))?;
        text
    } else {
        let identity = if dist.identity.is_empty() {
            dist.ip.clone()
        } else {
            dist.identity.clone()
        };
        let generated = pki::build_csr(&CsrRequest {
            identity,
            node_type: dist.node_type.clone(),
            ip,
            dns_names: dist.dns_names.clone(),
        })?;
        write_secret(&dist.key_file, generated.key_pem.as_bytes())?;
        write_atomic(&dist.csr_file, generated.csr_pem.as_bytes())?;
        info!(key = %dist.key_file.display(), csr = %dist.csr_file.display(), "Generated key and CSR");
        generated.csr_pem
    };

    let root = match &dist.authority_ca_cert {
        Some(path) => Some(
            std::fs::read(path)
                .with_context(|| format!("cannot read authority root '{}'", path.display()))?,
        ),
        None => None,
    };
    let transport = HttpTransport::new(&dist.authority_url, root.as_deref())?;
    let requester = CertificateRequester::new(
        Arc::new(transport),
        IssuanceKey::new(&dist.node_type, ip.to_string()),
        dist.poll_interval,
        &dist.cert_file,
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(distribution::shutdown_signal(shutdown_tx));

    requester.obtain(&csr_pem, shutdown_rx).await?;
    println!("✅ Certificate written to {}", dist.cert_file.display());
    Ok(())
}

// ── policy ────────────────────────────────────────────────────────────────

fn run_policy_command(config: &Config, cmd: PolicyCommand) -> anyhow::Result<()> {
    let ac = access::from_config(&config.access)?;

    match cmd {
        PolicyCommand::Grant { subject, object } => {
            ac.allow_source(&subject, &object)?;
            println!("✅ {subject} may scrape {object}");
        }
        PolicyCommand::Revoke { subject, object } => match object {
            Some(object) => {
                ac.block_source(&subject, &object)?;
                println!("✅ {subject} may no longer scrape {object}");
            }
            None => {
                ac.delete_all_permissions(&subject)?;
                println!("✅ All permissions of {subject} revoked");
            }
        },
        PolicyCommand::RoleAdd { subject, role } => {
            ac.add_role(&subject, &role)?;
            println!("✅ {subject} now holds {role}");
        }
        PolicyCommand::RoleRemove { subject, role } => {
            ac.remove_role(&subject, &role)?;
            println!("✅ {subject} no longer holds {role}");
        }
        PolicyCommand::Window {
            subject,
            object,
            value,
        } => {
            ac.add_timing_permission(&subject, &object, TimingKind::Window, &value)?;
            println!("✅ Window set: {:?}", ac.permissions_for_object(&subject, &object));
        }
        PolicyCommand::Frequency {
            subject,
            object,
            value,
        } => {
            ac.add_timing_permission(&subject, &object, TimingKind::Frequency, &value)?;
            println!("✅ Frequency set: {:?}", ac.permissions_for_object(&subject, &object));
        }
        PolicyCommand::LoadRoles { file } => {
            let applied = ac.load_roles_from_file(&file)?;
            println!("✅ Loaded {applied} role definition(s)");
        }
        PolicyCommand::Check {
            subject,
            object,
            metrics,
        } => {
            let visible = ac.serve_scrape(&subject, &object, metrics)?;
            println!("✅ {subject} may scrape {object}");
            if !visible.is_empty() {
                println!("   Visible metrics: {}", visible.join(", "));
            }
        }
        PolicyCommand::Show { subject } => match subject {
            Some(subject) => {
                let perms = ac.all_permissions(&subject);
                println!("{}", serde_json::to_string_pretty(&perms)?);
                let roles = ac.roles_for(&subject);
                if !roles.is_empty() {
                    println!("Roles: {}", roles.join(", "));
                }
            }
            None => {
                println!("Sources:");
                for source in ac.all_sources() {
                    println!("  {source}");
                }
                println!("Roles:");
                for role in ac.all_roles() {
                    println!("  {role}");
                }
            }
        },
    }
    Ok(())
}

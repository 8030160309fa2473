//! Certificate distribution protocol.
//!
//! The [`server`] side wraps the CA behind a signing gate and files every
//! issued certificate by `(type, ip)`. The [`client`] side polls until its
//! certificate is available.

pub mod client;
pub mod gate;
pub mod server;

pub use client::{CertificateRequester, CertificateTransport, HttpTransport, TransportReply};
pub use gate::SigningGate;
pub use server::{Authority, authority_routes, serve};

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Wait for Ctrl-C (or SIGTERM on Unix), then notify `shutdown_tx`.
pub async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}

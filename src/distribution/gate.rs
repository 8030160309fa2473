//! Authority-wide signing gate.
//!
//! The authority starts blocked. An operator opens the gate for a fixed
//! window; a cancellable timer task closes it again. Re-opening replaces the
//! pending timer, and an explicit block cancels it.
//!
//! Gate state is one word: a generation counter shifted left by one, with the
//! low bit set while open. Every open or block starts a new generation, and a
//! timer only closes the exact state it was started for.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::audit::{self, AuditEvent};

const OPEN: u64 = 1;

/// Whether the authority currently signs certificates.
#[derive(Debug, Default)]
pub struct SigningGate {
    state: Arc<AtomicU64>,
    revert: Mutex<Option<JoinHandle<()>>>,
}

impl SigningGate {
    /// A gate in the blocked state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` while signing is enabled.
    #[must_use]
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.state.load(Ordering::Acquire) & OPEN == OPEN
    }

    /// Enable signing for `window`, then revert to blocked.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn enable(&self, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        let mut revert = self.revert.lock();
        if let Some(previous) = revert.take() {
            previous.abort();
        }
        let (_, opened) = self.advance(OPEN);
        info!(window = %humantime::format_duration(window), "Certificate signing enabled");
        audit::emit(&AuditEvent::signing_enabled(window));

        let state = Arc::clone(&self.state);
        *revert = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if close_window(&state, opened) {
                info!("Certificate signing window elapsed, signing blocked");
                audit::emit(&AuditEvent::signing_blocked("window elapsed"));
            }
        }));
    }

    /// Block signing now and cancel any pending revert.
    pub fn block(&self) {
        let mut revert = self.revert.lock();
        if let Some(previous) = revert.take() {
            previous.abort();
        }
        let (before, _) = self.advance(0);
        drop(revert);
        if before & OPEN == OPEN {
            info!("Certificate signing blocked by operator");
            audit::emit(&AuditEvent::signing_blocked("operator"));
        }
    }

    /// Move to the next generation with the given open bit; returns the
    /// previous and new states.
    fn advance(&self, open: u64) -> (u64, u64) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next = (((current >> 1).wrapping_add(1)) << 1) | open;
            match self.state.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return (current, next),
                Err(actual) => current = actual,
            }
        }
    }
}

impl Drop for SigningGate {
    fn drop(&mut self) {
        if let Some(handle) = self.revert.get_mut().take() {
            handle.abort();
        }
    }
}

/// Close the window opened as `opened`. Fails if the gate was re-opened or
/// blocked since.
fn close_window(state: &AtomicU64, opened: u64) -> bool {
    state
        .compare_exchange(opened, opened & !OPEN, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

//! Signal handling for the `chancache` CLI (SIGINT/SIGTERM)
//!
//! On the first signal the CLI stops reading input, commits the chancacher
//! to disk and exits once the output has closed.
//!
//! On a second signal it exits immediately, leaving whatever is on disk for
//! the next run to recover.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::latch::Latch;

/// Exit code after a second interrupt
pub const EXIT_CODE_INTERRUPTED: i32 = 130;

/// Signal handler state
#[derive(Debug, Default)]
pub struct SignalState {
    /// Fired by the first signal
    shutdown: Latch,
    /// Signal count (for tracking double-SIGINT)
    signal_count: AtomicU8,
}

impl SignalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a graceful shutdown has been requested
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.is_fired()
    }

    /// Latch fired by the first signal
    pub fn shutdown(&self) -> &Latch {
        &self.shutdown
    }

    /// Get the number of signals received
    pub fn signal_count(&self) -> u8 {
        self.signal_count.load(Ordering::SeqCst)
    }

    /// Handle a signal (SIGINT/SIGTERM)
    ///
    /// Returns the action to take
    pub fn handle_signal(&self) -> SignalAction {
        let count = self
            .signal_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(c.saturating_add(1)))
            .unwrap_or(u8::MAX);

        match count {
            0 => {
                self.shutdown.fire();
                SignalAction::Shutdown
            }
            1 => SignalAction::ImmediateExit,
            _ => SignalAction::Ignore,
        }
    }
}

/// Action to take after receiving a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// First signal: commit and shut down
    Shutdown,
    /// Second signal: exit now
    ImmediateExit,
    /// Third+ signal: ignore
    Ignore,
}

/// Install SIGINT/SIGTERM handlers feeding `state`.
///
/// Must be called at most once per process. A second signal terminates the
/// process with [`EXIT_CODE_INTERRUPTED`].
pub fn install(state: Arc<SignalState>) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || match state.handle_signal() {
        SignalAction::Shutdown => {
            warn!("received interrupt, committing cache and shutting down");
        }
        SignalAction::ImmediateExit => {
            warn!("received second interrupt, exiting immediately");
            std::process::exit(EXIT_CODE_INTERRUPTED);
        }
        SignalAction::Ignore => {}
    })
}

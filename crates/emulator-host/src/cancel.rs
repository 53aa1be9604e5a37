//! Cooperative cancellation for emulator startup.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Flag shared between the caller and a pending [`crate::Emulator::start`].
///
/// Cancellation is cooperative: the coordinator observes the flag between
/// waits and abandons startup, tearing down whatever was launched.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a token that has not been cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Repeated calls have no further effect.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns true once [`CancellationToken::cancel`] has been called on any clone.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

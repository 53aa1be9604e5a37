//! Termination-signal handling for the supervisor binary.

use std::io;
use std::thread::{self, JoinHandle};

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use thiserror::Error;
use tracing::{debug, info};

use emulator_host::CancellationToken;

use crate::RUN_TARGET;

/// Signals that end the supervisor.
pub const TERMINATION_SIGNALS: [i32; 4] = [SIGTERM, SIGINT, SIGQUIT, SIGHUP];

/// Source of shutdown requests.
pub trait ShutdownSignal {
    /// Starts listening; the first request cancels `token`.
    ///
    /// # Errors
    ///
    /// Returns an error when the listener cannot be installed.
    fn listen(&self, token: CancellationToken) -> Result<ShutdownListener, ShutdownError>;
}

/// Errors reported by shutdown signal listeners.
#[derive(Debug, Error)]
pub enum ShutdownError {
    /// Installing signal handlers failed.
    #[error("failed to install signal handlers: {source}")]
    Install {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Keeps a listener alive; dropping it uninstalls the listener.
#[derive(Debug, Default)]
pub struct ShutdownListener {
    handle: Option<Handle>,
    thread: Option<JoinHandle<()>>,
}

impl ShutdownListener {
    /// Listener with nothing to release.
    #[must_use]
    pub fn detached() -> Self {
        Self::default()
    }
}

impl Drop for ShutdownListener {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.close();
        }
        let Some(thread) = self.thread.take() else {
            return;
        };
        if thread.join().is_err() {
            debug!(target: RUN_TARGET, "signal listener panicked");
        }
    }
}

/// Listener for `SIGTERM`, `SIGINT`, `SIGQUIT` and `SIGHUP`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemShutdownSignal;

impl ShutdownSignal for SystemShutdownSignal {
    fn listen(&self, token: CancellationToken) -> Result<ShutdownListener, ShutdownError> {
        let mut signals =
            Signals::new(TERMINATION_SIGNALS).map_err(|source| ShutdownError::Install { source })?;
        let handle = signals.handle();
        let thread = thread::Builder::new()
            .name("signal-listener".to_owned())
            .spawn(move || {
                if let Some(signal) = signals.forever().next() {
                    info!(target: RUN_TARGET, signal, "shutdown signal received");
                    token.cancel();
                }
            })
            .map_err(|source| ShutdownError::Install { source })?;
        Ok(ShutdownListener {
            handle: Some(handle),
            thread: Some(thread),
        })
    }
}

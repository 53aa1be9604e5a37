//! Error types for emulator supervision.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::emulator::LifecycleState;
use crate::monitor::StreamKind;
use crate::process::ExitSummary;

/// Errors raised while starting, monitoring, or stopping the emulator.
///
/// IO sources are shared behind [`Arc`] so an error can be cloned onto the
/// startup and fault channels.
#[derive(Debug, Clone, Error)]
pub enum EmulatorError {
    /// The data directory could not be created.
    #[error("failed to prepare emulator data directory {path:?}: {source}")]
    DataDirectory {
        /// Directory that could not be created.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The emulator executable was not found.
    #[error("emulator binary not found: {command}")]
    BinaryNotFound {
        /// The command that was not found.
        command: String,
        /// The underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// Spawning the emulator process failed.
    #[error("failed to spawn emulator process: {message}")]
    SpawnFailed {
        /// Description of the spawn failure.
        message: String,
        /// The underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// An output stream could not be captured.
    #[error("failed to capture emulator {stream}")]
    StreamCapture {
        /// The stream that was not captured.
        stream: StreamKind,
    },

    /// The emulator reported that its port is already bound.
    #[error("emulator failed to start: port {port} already in use")]
    PortConflict {
        /// The configured port.
        port: u16,
    },

    /// The process exited before reporting readiness.
    #[error("emulator process exited {elapsed:?} after launch without reporting readiness ({status})")]
    EarlyExit {
        /// How the process exited.
        status: ExitSummary,
        /// Time between launch and exit.
        elapsed: Duration,
    },

    /// No readiness marker arrived within the startup budget.
    #[error(
        "timed out after {timeout_ms} ms waiting for the emulator to report 'Server started'"
    )]
    Timeout {
        /// The startup budget in milliseconds.
        timeout_ms: u64,
    },

    /// The process exited after it had been marked running.
    #[error("emulator process exited unexpectedly ({status})")]
    UnexpectedCrash {
        /// How the process exited.
        status: ExitSummary,
    },

    /// The caller cancelled startup.
    #[error("emulator startup cancelled")]
    Cancelled,

    /// Reading an output stream failed before it closed.
    #[error("error reading emulator {stream}: {source}")]
    OutputRead {
        /// The stream that failed.
        stream: StreamKind,
        /// The underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// Polling the process for exit failed.
    #[error("failed to monitor emulator process: {source}")]
    Wait {
        /// The underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// `start` was called on an instance that has already left `NotStarted`.
    #[error("emulator already started (state: {state})")]
    AlreadyStarted {
        /// State observed when the call was rejected.
        state: LifecycleState,
    },
}

/// Coarse classification of [`EmulatorError`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad path, executable, or pipe setup.
    Configuration,
    /// A bind-conflict marker was observed.
    PortConflict,
    /// The process terminated before readiness.
    EarlyExit,
    /// Readiness did not arrive within the budget.
    Timeout,
    /// The process terminated after readiness.
    UnexpectedCrash,
    /// The caller aborted startup.
    Cancelled,
    /// Output or exit monitoring failed.
    Monitoring,
    /// The instance was not in a state that permits the call.
    InvalidState,
}

impl EmulatorError {
    /// Returns the coarse kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::DataDirectory { .. }
            | Self::BinaryNotFound { .. }
            | Self::SpawnFailed { .. }
            | Self::StreamCapture { .. } => ErrorKind::Configuration,
            Self::PortConflict { .. } => ErrorKind::PortConflict,
            Self::EarlyExit { .. } => ErrorKind::EarlyExit,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::UnexpectedCrash { .. } => ErrorKind::UnexpectedCrash,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::OutputRead { .. } | Self::Wait { .. } => ErrorKind::Monitoring,
            Self::AlreadyStarted { .. } => ErrorKind::InvalidState,
        }
    }

    /// Returns true for path, executable, and pipe setup failures.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self.kind(), ErrorKind::Configuration)
    }

    pub(crate) fn timeout(budget: Duration) -> Self {
        Self::Timeout {
            timeout_ms: u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

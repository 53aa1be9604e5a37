//! Process-execution seam consumed by the supervisor.
//!
//! The supervisor never touches [`std::process`] directly outside
//! the launcher module; everything else talks to the [`EmulatorProcess`] and
//! [`ProcessSpawner`] traits so tests can script output streams and exits
//! without launching the real emulator.

use std::fmt;
use std::io::{self, Read};
use std::process::ExitStatus;
use std::sync::Arc;

use crate::error::EmulatorError;
use crate::launcher::Invocation;

/// Portable description of how a process exited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitSummary {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal on Unix hosts.
    pub signal: Option<i32>,
}

impl ExitSummary {
    /// Summary for a process that exited with `code`.
    #[must_use]
    pub const fn with_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    /// Summary for a process terminated by `signal`.
    #[must_use]
    pub const fn with_signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// Returns true when the process exited with status zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

impl From<ExitStatus> for ExitSummary {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "terminated by signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// A launched emulator process.
///
/// Implementations must tolerate concurrent calls: the watcher polls
/// [`EmulatorProcess::try_wait`] while teardown may call
/// [`EmulatorProcess::kill`] from another thread.
pub trait EmulatorProcess: Send + Sync {
    /// Operating-system process identifier, if known.
    fn id(&self) -> Option<u32>;

    /// Sends a forceful termination signal.
    fn kill(&self) -> io::Result<()>;

    /// Returns the exit summary when the process has exited.
    fn try_wait(&self) -> io::Result<Option<ExitSummary>>;
}

/// Output stream reader handed to a monitor thread.
pub type OutputReader = Box<dyn Read + Send>;

/// Handles produced by a successful spawn.
pub struct SpawnedEmulator {
    /// The running process.
    pub process: Arc<dyn EmulatorProcess>,
    /// Captured standard output.
    pub stdout: OutputReader,
    /// Captured standard error.
    pub stderr: OutputReader,
}

impl fmt::Debug for SpawnedEmulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnedEmulator")
            .field("pid", &self.process.id())
            .finish_non_exhaustive()
    }
}

/// Starts emulator processes with captured output streams.
pub trait ProcessSpawner: Send + Sync {
    /// Spawns the process described by `invocation`.
    fn spawn(&self, invocation: &Invocation) -> Result<SpawnedEmulator, EmulatorError>;
}

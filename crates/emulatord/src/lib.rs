//! Supervisor binary support for the local Pub/Sub emulator.
//!
//! [`run`] loads the layered configuration, installs telemetry and signal
//! handlers, starts the emulator, and prints
//! `PUBSUB_EMULATOR_HOST=<host:port>` on stdout once it is ready. The process
//! then waits until a termination signal arrives or the emulator crashes, and
//! stops the emulator before exiting. Diagnostics go to stderr so stdout
//! stays machine-readable.

mod error;
pub mod shutdown;
pub mod telemetry;

use std::ffi::OsString;
use std::io::Write;
use std::process::ExitCode;
use std::time::Duration;

use tracing::{error, info};

use emulator_config::Config;
use emulator_host::{
    CancellationToken, Collaborators, EMULATOR_HOST_ENV, Emulator, EmulatorSettings, ErrorKind,
};

pub use error::AppError;
use shutdown::{ShutdownSignal, SystemShutdownSignal};

/// Log target for the supervisor run.
pub(crate) const RUN_TARGET: &str = "emulatord::run";

/// How often the serving loop checks for a shutdown request.
const FAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Runs the supervisor with real processes and operating-system signals.
#[must_use]
pub fn run<I, T, W, E>(args: I, stdout: &mut W, stderr: &mut E) -> ExitCode
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
    W: Write,
    E: Write,
{
    Supervisor::new(SystemShutdownSignal, Collaborators::system()).run(args, stdout, stderr)
}

/// Supervisor run with injectable collaborators.
#[derive(Debug)]
pub struct Supervisor<S> {
    signal: S,
    collaborators: Collaborators,
}

impl<S: ShutdownSignal> Supervisor<S> {
    /// Builds a supervisor listening on `signal` and launching through
    /// `collaborators`.
    #[must_use]
    pub const fn new(signal: S, collaborators: Collaborators) -> Self {
        Self {
            signal,
            collaborators,
        }
    }

    /// Runs to completion and maps the result to an exit code, reporting
    /// failures on `stderr`.
    #[must_use]
    pub fn run<I, T, W, E>(&self, args: I, stdout: &mut W, stderr: &mut E) -> ExitCode
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
        W: Write,
        E: Write,
    {
        match self.execute(args, stdout) {
            Ok(()) => ExitCode::SUCCESS,
            Err(error) => {
                error!(target: RUN_TARGET, %error, "supervisor exiting with failure");
                let _ = writeln!(stderr, "{error}");
                ExitCode::FAILURE
            }
        }
    }

    /// Runs to completion.
    ///
    /// Cancelling startup through a termination signal is a clean exit.
    ///
    /// # Errors
    ///
    /// Returns an [`AppError`] when configuration, telemetry, or signal
    /// handling cannot be set up, when the emulator fails to start, or when it
    /// crashes while serving.
    pub fn execute<I, T, W>(&self, args: I, stdout: &mut W) -> Result<(), AppError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
        W: Write,
    {
        let config = Config::load_from_iter(args).map_err(AppError::LoadConfiguration)?;
        config.validate()?;
        let _telemetry = telemetry::initialise(&config)?;

        let token = CancellationToken::new();
        let _listener = self.signal.listen(token.clone())?;
        let emulator = Emulator::with_collaborators(
            EmulatorSettings::from_config(&config),
            self.collaborators.clone(),
        );

        let endpoint = match emulator.start(&token) {
            Ok(endpoint) => endpoint,
            Err(error) if error.kind() == ErrorKind::Cancelled => {
                info!(target: RUN_TARGET, "startup cancelled by shutdown request");
                return Ok(());
            }
            Err(error) => return Err(AppError::Startup(error)),
        };

        writeln!(stdout, "{EMULATOR_HOST_ENV}={endpoint}")
            .and_then(|()| stdout.flush())
            .map_err(AppError::Output)?;
        info!(target: RUN_TARGET, host = %endpoint, "emulator serving; waiting for shutdown");

        let outcome = serve(&emulator, &token);
        emulator.stop();
        outcome
    }
}

/// Blocks until shutdown is requested or the emulator crashes.
fn serve(emulator: &Emulator, token: &CancellationToken) -> Result<(), AppError> {
    loop {
        if token.is_cancelled() {
            return Ok(());
        }
        if let Some(fault) = emulator.faults().wait(FAULT_POLL_INTERVAL) {
            return Err(AppError::Crashed(fault));
        }
    }
}

#[cfg(test)]
mod tests;

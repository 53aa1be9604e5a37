//! Top-level error type for the supervisor binary.

use std::io;
use std::sync::Arc;

use ortho_config::OrthoError;
use thiserror::Error;

use emulator_config::ConfigError;
use emulator_host::EmulatorError;

use crate::shutdown::ShutdownError;
use crate::telemetry::TelemetryError;

/// Errors that end a supervisor run.
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration failed to load.
    #[error("failed to load configuration: {0}")]
    LoadConfiguration(#[source] Arc<OrthoError>),
    /// Configuration loaded but cannot drive a startup.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(#[from] ConfigError),
    /// Telemetry could not be installed.
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    /// Signal handlers could not be installed.
    #[error(transparent)]
    Signals(#[from] ShutdownError),
    /// The emulator did not become ready.
    #[error(transparent)]
    Startup(EmulatorError),
    /// The emulator exited while it was serving.
    #[error("emulator stopped serving: {0}")]
    Crashed(#[source] EmulatorError),
    /// The endpoint could not be written to stdout.
    #[error("failed to write emulator endpoint: {0}")]
    Output(#[source] io::Error),
}

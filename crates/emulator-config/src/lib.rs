//! Shared configuration for the Pub/Sub emulator fixture.
//!
//! Configuration is layered by `ortho_config`: built-in defaults, then an
//! optional TOML file (`--config-path` or `PUBSUB_EMULATOR_CONFIG_PATH`),
//! then `PUBSUB_EMULATOR_*` environment variables, then command-line flags.
//! Every field is optional in the merged representation; the accessors on
//! [`Config`] resolve the documented defaults so callers never see a hole.

mod defaults;
mod logging;

use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::{OrthoConfig, OrthoError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use defaults::{
    DEFAULT_DATA_DIR_NAME, DEFAULT_EMULATOR_COMMAND, DEFAULT_GRACE_WINDOW, DEFAULT_LOG_FILTER,
    DEFAULT_PORT, DEFAULT_PROJECT_ID, DEFAULT_STARTUP_TIMEOUT, default_data_dir,
    default_log_filter, default_log_format,
};
pub use logging::{LogFormat, LogFormatParseError};

/// Layered configuration for the emulator supervisor and its binary.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq, OrthoConfig)]
#[ortho_config(prefix = "PUBSUB_EMULATOR")]
pub struct Config {
    /// Project label passed to the emulator.
    pub project_id: Option<String>,
    /// Port the emulator binds on localhost.
    pub port: Option<u16>,
    /// Directory holding emulator state between runs.
    pub data_dir: Option<Utf8PathBuf>,
    /// Executable used to launch the emulator.
    pub emulator_command: Option<String>,
    /// Fast-failure window in milliseconds.
    pub grace_window_ms: Option<u64>,
    /// Overall startup budget in milliseconds.
    pub startup_timeout_ms: Option<u64>,
    /// Enables process-name based cleanup as a last resort during teardown.
    pub name_fallback: Option<bool>,
    /// Tracing filter expression.
    pub log_filter: Option<String>,
    /// Log output format.
    pub log_format: Option<LogFormat>,
}

/// Semantic problems in an otherwise well-formed configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Port zero asks the OS for an ephemeral port, which the emulator cannot report back.
    #[error("emulator port must be non-zero")]
    ZeroPort,
    /// A zero startup budget can never observe readiness.
    #[error("startup timeout must be greater than zero")]
    ZeroStartupTimeout,
    /// The project label is blank.
    #[error("project id must not be blank")]
    BlankProjectId,
}

impl Config {
    /// Loads configuration from the process arguments and environment.
    pub fn load() -> Result<Self, Arc<OrthoError>> {
        <Self as OrthoConfig>::load()
    }

    /// Loads configuration from an explicit argument iterator.
    ///
    /// The first item is treated as the program name, mirroring
    /// [`std::env::args_os`].
    pub fn load_from_iter<I, T>(args: I) -> Result<Self, Arc<OrthoError>>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as OrthoConfig>::load_from_iter(args)
    }

    /// Project label passed to the emulator.
    #[must_use]
    pub fn project_id(&self) -> &str {
        self.project_id.as_deref().unwrap_or(DEFAULT_PROJECT_ID)
    }

    /// Port the emulator binds.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    /// Directory holding emulator state.
    #[must_use]
    pub fn data_dir(&self) -> Utf8PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    /// Executable used to launch the emulator.
    #[must_use]
    pub fn emulator_command(&self) -> &str {
        self.emulator_command
            .as_deref()
            .unwrap_or(DEFAULT_EMULATOR_COMMAND)
    }

    /// Fast-failure window applied before the rest of the startup budget.
    #[must_use]
    pub fn grace_window(&self) -> Duration {
        self.grace_window_ms
            .map_or(DEFAULT_GRACE_WINDOW, Duration::from_millis)
    }

    /// Total time allowed for the emulator to report readiness.
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        self.startup_timeout_ms
            .map_or(DEFAULT_STARTUP_TIMEOUT, Duration::from_millis)
    }

    /// Whether teardown may fall back to process-name heuristics.
    #[must_use]
    pub fn name_fallback(&self) -> bool {
        self.name_fallback.unwrap_or(false)
    }

    /// Tracing filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }

    /// Log output format.
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.log_format.unwrap_or_else(default_log_format)
    }

    /// Rejects values that parse but cannot drive a startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port() == 0 {
            return Err(ConfigError::ZeroPort);
        }
        if self.startup_timeout().is_zero() {
            return Err(ConfigError::ZeroStartupTimeout);
        }
        if self.project_id().trim().is_empty() {
            return Err(ConfigError::BlankProjectId);
        }
        Ok(())
    }
}

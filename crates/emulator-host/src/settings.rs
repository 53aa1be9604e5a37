//! Settings for a single emulator instance.

use std::path::PathBuf;
use std::time::Duration;

use emulator_config::{
    Config, DEFAULT_EMULATOR_COMMAND, DEFAULT_GRACE_WINDOW, DEFAULT_STARTUP_TIMEOUT,
    default_data_dir,
};

/// Exits closer than this to launch are classified as early exits.
pub const EARLY_EXIT_WINDOW: Duration = Duration::from_secs(3);

/// Arguments placed before the per-instance flags.
const DEFAULT_BASE_ARGS: [&str; 4] = ["beta", "emulators", "pubsub", "start"];

/// Identity and timing settings for an emulator instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulatorSettings {
    /// Project label passed as `--project`.
    pub project_id: String,
    /// Port bound on localhost.
    pub port: u16,
    /// State directory passed as `--data-dir`; created if missing, never deleted.
    pub data_dir: PathBuf,
    /// Executable used to launch the emulator.
    pub command: PathBuf,
    /// Arguments placed before the per-instance flags.
    pub base_args: Vec<String>,
    /// Fast-failure window.
    pub grace_window: Duration,
    /// Overall startup budget.
    pub startup_timeout: Duration,
    /// Exits within this window of launch are early exits.
    pub early_exit_window: Duration,
    /// Allows process-name heuristics during teardown.
    pub name_fallback: bool,
}

impl EmulatorSettings {
    /// Settings for `project_id` on `port` with the stock `gcloud` invocation.
    #[must_use]
    pub fn new(project_id: impl Into<String>, port: u16) -> Self {
        Self {
            project_id: project_id.into(),
            port,
            data_dir: default_data_dir().into_std_path_buf(),
            command: PathBuf::from(DEFAULT_EMULATOR_COMMAND),
            base_args: DEFAULT_BASE_ARGS.iter().map(|arg| (*arg).to_owned()).collect(),
            grace_window: DEFAULT_GRACE_WINDOW,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            early_exit_window: EARLY_EXIT_WINDOW,
            name_fallback: false,
        }
    }

    /// Derives settings from the layered configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            data_dir: config.data_dir().into_std_path_buf(),
            command: PathBuf::from(config.emulator_command()),
            grace_window: config.grace_window(),
            startup_timeout: config.startup_timeout(),
            name_fallback: config.name_fallback(),
            ..Self::new(config.project_id(), config.port())
        }
    }

    /// Sets the data directory.
    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Replaces the executable and the arguments placed before the instance flags.
    #[must_use]
    pub fn with_command<I, S>(mut self, command: impl Into<PathBuf>, base_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into();
        self.base_args = base_args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the grace window and overall startup budget.
    #[must_use]
    pub fn with_timeouts(mut self, grace_window: Duration, startup_timeout: Duration) -> Self {
        self.grace_window = grace_window;
        self.startup_timeout = startup_timeout;
        self
    }

    /// Sets the early-exit classification window.
    #[must_use]
    pub fn with_early_exit_window(mut self, window: Duration) -> Self {
        self.early_exit_window = window;
        self
    }

    /// Enables or disables name-based teardown fallbacks.
    #[must_use]
    pub fn with_name_fallback(mut self, enabled: bool) -> Self {
        self.name_fallback = enabled;
        self
    }
}

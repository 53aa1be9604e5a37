use std::env;
use std::time::Duration;

use camino::Utf8PathBuf;

use crate::logging::LogFormat;

/// Port the emulator binds when none is configured.
pub const DEFAULT_PORT: u16 = 8085;

/// Project label handed to the emulator when none is configured.
///
/// The emulator accepts any label; it only namespaces topics.
pub const DEFAULT_PROJECT_ID: &str = "local-emulator";

/// Executable used to launch the emulator.
pub const DEFAULT_EMULATOR_COMMAND: &str = "gcloud";

/// Directory name, below the system temporary directory, holding emulator state.
pub const DEFAULT_DATA_DIR_NAME: &str = "pubsub-emulator-data";

/// Short window prioritised for fast failure detection during startup.
pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_secs(3);

/// Total time the emulator is given to report readiness.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default log filter expression used by the binaries.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Default log filter expression used by the binaries.
#[must_use]
pub fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Default logging format for the binaries.
#[must_use]
pub fn default_log_format() -> LogFormat {
    LogFormat::Json
}

/// Computes the default emulator data directory.
#[must_use]
pub fn default_data_dir() -> Utf8PathBuf {
    let base = Utf8PathBuf::from_path_buf(env::temp_dir())
        .unwrap_or_else(|_| Utf8PathBuf::from("/tmp"));
    base.join(DEFAULT_DATA_DIR_NAME)
}

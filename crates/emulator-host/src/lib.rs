//! Supervisor for a local Google Cloud Pub/Sub emulator.
//!
//! An [`Emulator`] launches `gcloud beta emulators pubsub start` with its
//! output captured, watches that output and the process itself until the
//! emulator reports readiness (or fails, times out, or is cancelled), and
//! tears the process and everything it spawned down again. The resolved
//! address is returned from [`Emulator::start`] and published through an
//! explicit [`EndpointRegistry`]; the process environment is never touched.
//!
//! Process creation and teardown sit behind the [`ProcessSpawner`] and
//! [`ProcessReaper`] traits so the lifecycle can be exercised without the
//! real emulator.

mod cancel;
pub mod coordinator;
mod emulator;
mod endpoint;
mod error;
mod launcher;
mod monitor;
mod process;
mod settings;
pub mod shutdown;
mod watcher;

pub use cancel::CancellationToken;
pub use emulator::{Collaborators, Emulator, FaultSignal, LifecycleState, TASK_JOIN_TIMEOUT};
pub use endpoint::{EMULATOR_HOST_ENV, Endpoint, EndpointRegistry};
pub use error::{EmulatorError, ErrorKind};
pub use launcher::{Invocation, SystemSpawner, prepare_data_dir};
pub use monitor::{
    LineSignal, OUTPUT_TARGET, OutputSink, PORT_CONFLICT_MARKERS, READY_MARKER, StreamKind,
    TracingSink, classify_line,
};
pub use process::{EmulatorProcess, ExitSummary, OutputReader, ProcessSpawner, SpawnedEmulator};
pub use settings::{EARLY_EXIT_WINDOW, EmulatorSettings};
pub use shutdown::{HostOs, ProcessReaper, SystemReaper, TeardownCommand, TeardownStep};

#[cfg(test)]
mod tests;

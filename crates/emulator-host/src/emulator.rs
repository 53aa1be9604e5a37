//! The supervised emulator instance.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, sync_channel};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::coordinator::{Coordinator, EVENT_CAPACITY, Outcome, StartupEvent};
use crate::endpoint::{Endpoint, EndpointRegistry};
use crate::error::EmulatorError;
use crate::launcher::{Invocation, SystemSpawner, prepare_data_dir};
use crate::monitor::{MonitorContext, OutputSink, StreamKind, TracingSink, run_monitor};
use crate::process::{EmulatorProcess, ProcessSpawner, SpawnedEmulator};
use crate::settings::EmulatorSettings;
use crate::shutdown::{ProcessReaper, SystemReaper, Teardown};
use crate::watcher::{WatcherContext, run_watcher};

/// Log target for lifecycle operations.
pub(crate) const EMULATOR_TARGET: &str = "emulator_host::emulator";

/// How long `stop` waits for monitoring threads after teardown.
pub const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle of an [`Emulator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Constructed; nothing launched.
    NotStarted,
    /// Launched and waiting for readiness.
    Starting,
    /// Ready and accepting connections.
    Running,
    /// Exited after readiness without being stopped.
    Crashed,
    /// Torn down by [`Emulator::stop`].
    Stopped,
    /// Startup failed and the launch was torn down.
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotStarted => "not started",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Crashed => "crashed",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Mutable state guarded by the lifecycle lock.
pub(crate) struct Lifecycle {
    pub(crate) state: LifecycleState,
    process: Option<Arc<dyn EmulatorProcess>>,
    pid: Option<u32>,
    tasks: Vec<JoinHandle<()>>,
}

impl Lifecycle {
    pub(crate) const fn new() -> Self {
        Self {
            state: LifecycleState::NotStarted,
            process: None,
            pid: None,
            tasks: Vec::new(),
        }
    }
}

/// Process-level collaborators of an [`Emulator`].
#[derive(Clone)]
pub struct Collaborators {
    spawner: Arc<dyn ProcessSpawner>,
    reaper: Arc<dyn ProcessReaper>,
    sink: Arc<dyn OutputSink>,
}

impl Collaborators {
    /// Real processes, host teardown commands, and output forwarded to `tracing`.
    #[must_use]
    pub fn system() -> Self {
        Self {
            spawner: Arc::new(SystemSpawner),
            reaper: Arc::new(SystemReaper::new()),
            sink: Arc::new(TracingSink),
        }
    }

    /// Replaces the process spawner.
    #[must_use]
    pub fn with_spawner(mut self, spawner: Arc<dyn ProcessSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Replaces the teardown reaper.
    #[must_use]
    pub fn with_reaper(mut self, reaper: Arc<dyn ProcessReaper>) -> Self {
        self.reaper = reaper;
        self
    }

    /// Replaces the output sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = sink;
        self
    }
}

impl Default for Collaborators {
    fn default() -> Self {
        Self::system()
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Receives crashes observed after the emulator became ready.
///
/// Holds at most one pending fault.
pub struct FaultSignal {
    receiver: Mutex<Receiver<EmulatorError>>,
}

impl FaultSignal {
    fn channel() -> (SyncSender<EmulatorError>, Self) {
        let (sender, receiver) = sync_channel(1);
        (
            sender,
            Self {
                receiver: Mutex::new(receiver),
            },
        )
    }

    /// Takes the pending fault, if any, without waiting.
    #[must_use]
    pub fn try_take(&self) -> Option<EmulatorError> {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_recv()
            .ok()
    }

    /// Waits up to `timeout` for a fault.
    #[must_use]
    pub fn wait(&self, timeout: Duration) -> Option<EmulatorError> {
        match self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv_timeout(timeout)
        {
            Ok(fault) => Some(fault),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }
}

impl fmt::Debug for FaultSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultSignal").finish_non_exhaustive()
    }
}

/// A supervised Pub/Sub emulator.
///
/// The instance is inert until [`Emulator::start`] launches the process and
/// waits for it to report readiness. [`Emulator::stop`] may be called any
/// number of times from any thread; only the first call after a launch tears
/// anything down. Dropping the instance stops it.
///
/// Each instance launches at most once. After a failed start or a stop,
/// construct a new instance.
pub struct Emulator {
    settings: EmulatorSettings,
    endpoint: Endpoint,
    host: String,
    registry: EndpointRegistry,
    collaborators: Collaborators,
    lifecycle: Arc<Mutex<Lifecycle>>,
    stop_flag: Arc<AtomicBool>,
    fault_sender: SyncSender<EmulatorError>,
    faults: FaultSignal,
}

impl Emulator {
    /// Creates an inert instance backed by real processes.
    #[must_use]
    pub fn new(settings: EmulatorSettings) -> Self {
        Self::with_collaborators(settings, Collaborators::system())
    }

    /// Creates an inert instance with the given collaborators.
    #[must_use]
    pub fn with_collaborators(settings: EmulatorSettings, collaborators: Collaborators) -> Self {
        let endpoint = Endpoint::localhost(settings.port);
        let host = endpoint.to_string();
        let (fault_sender, faults) = FaultSignal::channel();
        Self {
            settings,
            endpoint,
            host,
            registry: EndpointRegistry::new(),
            collaborators,
            lifecycle: Arc::new(Mutex::new(Lifecycle::new())),
            stop_flag: Arc::new(AtomicBool::new(false)),
            fault_sender,
            faults,
        }
    }

    /// Publishes the endpoint into `registry` instead of a private one.
    #[must_use]
    pub fn with_registry(mut self, registry: EndpointRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Launches the emulator and waits for it to report readiness.
    ///
    /// Holds the lifecycle lock for the whole wait, so a concurrent
    /// [`Emulator::stop`] blocks until startup resolves; cancel through
    /// `cancel` instead. Every failure after launch tears the process down
    /// before returning.
    ///
    /// # Errors
    ///
    /// Returns [`EmulatorError::AlreadyStarted`] unless the instance is
    /// [`LifecycleState::NotStarted`]; a configuration error when the data
    /// directory, executable, or pipes cannot be set up; otherwise the error
    /// that resolved startup (port conflict, early exit, timeout,
    /// cancellation, or a monitoring failure).
    pub fn start(&self, cancel: &CancellationToken) -> Result<Endpoint, EmulatorError> {
        let mut lifecycle = self.lock();
        if lifecycle.state != LifecycleState::NotStarted {
            debug!(
                target: EMULATOR_TARGET,
                state = %lifecycle.state,
                "start rejected"
            );
            return Err(EmulatorError::AlreadyStarted {
                state: lifecycle.state,
            });
        }

        info!(
            target: EMULATOR_TARGET,
            project = %self.settings.project_id,
            host = %self.host,
            data_dir = %self.settings.data_dir.display(),
            "starting emulator"
        );

        let spawned = match self.launch() {
            Ok(spawned) => spawned,
            Err(error) => {
                lifecycle.state = LifecycleState::Failed;
                warn!(target: EMULATOR_TARGET, %error, "emulator launch failed");
                return Err(error);
            }
        };
        let launched = Instant::now();
        lifecycle.state = LifecycleState::Starting;
        lifecycle.pid = spawned.process.id();
        lifecycle.process = Some(Arc::clone(&spawned.process));

        let (events, receiver) = sync_channel(EVENT_CAPACITY);
        let outcome = match self.spawn_tasks(spawned, launched, &events) {
            Ok(tasks) => {
                lifecycle.tasks = tasks;
                Coordinator::new(
                    &receiver,
                    cancel,
                    self.settings.grace_window,
                    self.settings.startup_timeout,
                )
                .resolve()
            }
            Err(error) => Outcome::Failed(error),
        };

        match outcome {
            Outcome::Running => {
                lifecycle.state = LifecycleState::Running;
                self.registry.publish(self.endpoint.clone());
                info!(
                    target: EMULATOR_TARGET,
                    host = %self.host,
                    startup_ms = launched.elapsed().as_millis(),
                    "emulator ready"
                );
                Ok(self.endpoint.clone())
            }
            Outcome::Failed(error) => {
                warn!(target: EMULATOR_TARGET, %error, "emulator startup failed");
                let tasks = self.shutdown_locked(&mut lifecycle, LifecycleState::Failed);
                drop(lifecycle);
                join_tasks(tasks);
                Err(error)
            }
        }
    }

    /// Tears the emulator down.
    ///
    /// A no-op unless a launched process is held, so repeated and concurrent
    /// calls run teardown at most once per launch.
    pub fn stop(&self) {
        let tasks = {
            let mut lifecycle = self.lock();
            if lifecycle.process.is_none() {
                debug!(
                    target: EMULATOR_TARGET,
                    state = %lifecycle.state,
                    "stop requested with nothing to tear down"
                );
                return;
            }
            info!(target: EMULATOR_TARGET, host = %self.host, "stopping emulator");
            self.shutdown_locked(&mut lifecycle, LifecycleState::Stopped)
        };
        join_tasks(tasks);
        info!(target: EMULATOR_TARGET, host = %self.host, "emulator stopped");
    }

    /// `localhost:<port>` address the emulator binds. Fixed at construction.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Endpoint the emulator binds.
    #[must_use]
    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Returns true while the emulator is ready and has neither crashed nor
    /// been stopped.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.lock().state
    }

    /// Crashes observed after readiness.
    #[must_use]
    pub const fn faults(&self) -> &FaultSignal {
        &self.faults
    }

    /// Registry holding the published endpoint while running.
    #[must_use]
    pub const fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    /// Settings the instance was built with.
    #[must_use]
    pub const fn settings(&self) -> &EmulatorSettings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn launch(&self) -> Result<SpawnedEmulator, EmulatorError> {
        prepare_data_dir(&self.settings.data_dir)?;
        let invocation = Invocation::for_settings(&self.settings, &self.endpoint);
        self.collaborators.spawner.spawn(&invocation)
    }

    fn spawn_tasks(
        &self,
        spawned: SpawnedEmulator,
        launched: Instant,
        events: &SyncSender<StartupEvent>,
    ) -> Result<Vec<JoinHandle<()>>, EmulatorError> {
        let SpawnedEmulator {
            process,
            stdout,
            stderr,
        } = spawned;
        let mut tasks = Vec::with_capacity(3);

        for (stream, reader) in [(StreamKind::Stdout, stdout), (StreamKind::Stderr, stderr)] {
            let context = MonitorContext {
                stream,
                detect_ready: stream == StreamKind::Stderr,
                port: self.settings.port,
                events: events.clone(),
                sink: Arc::clone(&self.collaborators.sink),
                stop: Arc::clone(&self.stop_flag),
            };
            tasks.push(spawn_named(&format!("emulator-{stream}"), move || {
                run_monitor(&context, reader);
            })?);
        }

        let context = WatcherContext {
            process,
            launched,
            early_exit_window: self.settings.early_exit_window,
            events: events.clone(),
            faults: self.fault_sender.clone(),
            lifecycle: Arc::clone(&self.lifecycle),
            stop: Arc::clone(&self.stop_flag),
        };
        tasks.push(spawn_named("emulator-watcher", move || {
            run_watcher(&context);
        })?);
        Ok(tasks)
    }

    /// Runs teardown with the lifecycle lock held and returns the monitoring
    /// threads for the caller to join once the lock is released.
    fn shutdown_locked(
        &self,
        lifecycle: &mut Lifecycle,
        final_state: LifecycleState,
    ) -> Vec<JoinHandle<()>> {
        let Some(process) = lifecycle.process.take() else {
            return Vec::new();
        };
        self.stop_flag.store(true, Ordering::SeqCst);

        let failed = Teardown {
            process: &process,
            pid: lifecycle.pid.take(),
            port: self.settings.port,
            name_fallback: self.settings.name_fallback,
            reaper: self.collaborators.reaper.as_ref(),
            registry: &self.registry,
        }
        .run();
        if !failed.is_empty() {
            debug!(target: EMULATOR_TARGET, ?failed, "teardown completed with failures");
        }

        lifecycle.state = final_state;
        mem::take(&mut lifecycle.tasks)
    }
}

impl Drop for Emulator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Emulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emulator")
            .field("host", &self.host)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn spawn_named(
    name: &str,
    task: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>, EmulatorError> {
    thread::Builder::new()
        .name(name.to_owned())
        .spawn(task)
        .map_err(|source| EmulatorError::SpawnFailed {
            message: format!("failed to start {name} thread"),
            source: Arc::new(source),
        })
}

/// Joins `tasks`, abandoning any still running after [`TASK_JOIN_TIMEOUT`].
fn join_tasks(tasks: Vec<JoinHandle<()>>) {
    let deadline = Instant::now() + TASK_JOIN_TIMEOUT;
    for task in tasks {
        while !task.is_finished() && Instant::now() < deadline {
            thread::sleep(JOIN_POLL_INTERVAL);
        }
        let name = task.thread().name().unwrap_or("emulator-task").to_owned();
        if !task.is_finished() {
            warn!(target: EMULATOR_TARGET, thread = %name, "monitoring thread still running after teardown");
            continue;
        }
        if task.join().is_err() {
            warn!(target: EMULATOR_TARGET, thread = %name, "monitoring thread panicked");
        }
    }
}

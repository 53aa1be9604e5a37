//! Builds the emulator invocation and spawns it with captured output.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::EmulatorError;
use crate::monitor::StreamKind;
use crate::process::{EmulatorProcess, ExitSummary, ProcessSpawner, SpawnedEmulator};
use crate::settings::EmulatorSettings;

/// Log target for launcher operations.
pub(crate) const LAUNCHER_TARGET: &str = "emulator_host::launcher";

/// Fully resolved command line for one emulator launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: PathBuf,
    args: Vec<String>,
    data_dir: PathBuf,
}

impl Invocation {
    /// Builds the invocation carrying the project label, the `host:port`
    /// binding, and the data directory.
    #[must_use]
    pub fn for_settings(settings: &EmulatorSettings, endpoint: &Endpoint) -> Self {
        let mut args = settings.base_args.clone();
        args.push(format!("--project={}", settings.project_id));
        args.push(format!("--host-port={endpoint}"));
        args.push(format!("--data-dir={}", settings.data_dir.display()));
        Self {
            program: settings.command.clone(),
            args,
            data_dir: settings.data_dir.clone(),
        }
    }

    /// Executable to launch.
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Arguments in launch order.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Data directory named in the arguments.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

/// Creates the data directory when it does not exist yet.
pub fn prepare_data_dir(path: &Path) -> Result<(), EmulatorError> {
    fs::create_dir_all(path).map_err(|source| EmulatorError::DataDirectory {
        path: path.to_path_buf(),
        source: Arc::new(source),
    })
}

/// Spawns real operating-system processes.
///
/// Each emulator starts in a fresh process group so teardown can address the
/// launcher script and the JVM it forks as one unit.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSpawner;

impl ProcessSpawner for SystemSpawner {
    fn spawn(&self, invocation: &Invocation) -> Result<SpawnedEmulator, EmulatorError> {
        debug!(
            target: LAUNCHER_TARGET,
            command = %invocation.program().display(),
            args = ?invocation.args(),
            "spawning emulator process"
        );

        let mut command = Command::new(invocation.program());
        command
            .args(invocation.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        isolate_process_group(&mut command);

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                EmulatorError::BinaryNotFound {
                    command: invocation.program().display().to_string(),
                    source: Arc::new(e),
                }
            } else {
                EmulatorError::SpawnFailed {
                    message: format!("failed to start {}", invocation.program().display()),
                    source: Arc::new(e),
                }
            }
        })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let stream = if child.stdout.is_none() {
                StreamKind::Stdout
            } else {
                StreamKind::Stderr
            };
            let _ = child.kill();
            let _ = child.wait();
            return Err(EmulatorError::StreamCapture { stream });
        };

        let process = SystemProcess::new(child);
        debug!(
            target: LAUNCHER_TARGET,
            pid = process.pid,
            "emulator process spawned"
        );

        Ok(SpawnedEmulator {
            process: Arc::new(process),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        })
    }
}

#[cfg(unix)]
fn isolate_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(windows)]
fn isolate_process_group(command: &mut Command) {
    use std::os::windows::process::CommandExt;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    command.creation_flags(CREATE_NEW_PROCESS_GROUP);
}

#[cfg(not(any(unix, windows)))]
fn isolate_process_group(_command: &mut Command) {}

/// [`EmulatorProcess`] backed by a [`std::process::Child`].
struct SystemProcess {
    pid: u32,
    child: Mutex<Child>,
}

impl SystemProcess {
    fn new(child: Child) -> Self {
        Self {
            pid: child.id(),
            child: Mutex::new(child),
        }
    }

    fn child(&self) -> std::sync::MutexGuard<'_, Child> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EmulatorProcess for SystemProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn kill(&self) -> io::Result<()> {
        let mut child = self.child();
        match child.kill() {
            Ok(()) => {
                // Reap so the pid is not left as a zombie.
                let _ = child.wait();
                Ok(())
            }
            // Already exited and reaped.
            Err(error) if error.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(error) => Err(error),
        }
    }

    fn try_wait(&self) -> io::Result<Option<ExitSummary>> {
        Ok(self.child().try_wait()?.map(ExitSummary::from))
    }
}

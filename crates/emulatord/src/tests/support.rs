//! Process and signal doubles for supervisor runs.

use std::ffi::OsString;
use std::io::{self, Cursor};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use emulator_host::{
    CancellationToken, Collaborators, EmulatorError, EmulatorProcess, ExitSummary, Invocation,
    OutputSink, ProcessReaper, ProcessSpawner, SpawnedEmulator, StreamKind,
};

use crate::shutdown::{ShutdownError, ShutdownListener, ShutdownSignal};

pub(crate) const TEST_PORT: u16 = 9555;
pub(crate) const READY_OUTPUT: &str = "[pubsub] INFO: Server started, listening on 9555\n";
pub(crate) const CONFLICT_OUTPUT: &str = "java.net.BindException: Address already in use\n";

/// Process that stays alive until killed, or until its scheduled exit.
pub(crate) struct FakeProcess {
    exit: Mutex<Option<ExitSummary>>,
    exit_at: Option<(Instant, ExitSummary)>,
}

impl EmulatorProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    fn kill(&self) -> io::Result<()> {
        self.exit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(ExitSummary::with_signal(9));
        Ok(())
    }

    fn try_wait(&self) -> io::Result<Option<ExitSummary>> {
        let killed = *self.exit.lock().unwrap_or_else(PoisonError::into_inner);
        let scheduled = self
            .exit_at
            .filter(|(at, _)| Instant::now() >= *at)
            .map(|(_, status)| status);
        Ok(killed.or(scheduled))
    }
}

/// Spawner whose process prints fixed stderr output.
pub(crate) struct FakeSpawner {
    stderr: &'static str,
    exit_after: Option<(Duration, ExitSummary)>,
}

impl FakeSpawner {
    pub(crate) const fn printing(stderr: &'static str) -> Self {
        Self {
            stderr,
            exit_after: None,
        }
    }

    pub(crate) const fn exiting_after(mut self, delay: Duration, status: ExitSummary) -> Self {
        self.exit_after = Some((delay, status));
        self
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn(&self, _invocation: &Invocation) -> Result<SpawnedEmulator, EmulatorError> {
        let process = FakeProcess {
            exit: Mutex::new(None),
            exit_at: self
                .exit_after
                .map(|(delay, status)| (Instant::now() + delay, status)),
        };
        Ok(SpawnedEmulator {
            process: Arc::new(process),
            stdout: Box::new(Cursor::new(Vec::new())),
            stderr: Box::new(Cursor::new(self.stderr.as_bytes().to_vec())),
        })
    }
}

/// Reaper with nothing to reap.
pub(crate) struct NoopReaper;

impl ProcessReaper for NoopReaper {
    fn kill_port_holders(&self, _port: u16) -> io::Result<()> {
        Ok(())
    }

    fn kill_runtime_processes(&self) -> io::Result<()> {
        Ok(())
    }

    fn kill_tooling_processes(&self) -> io::Result<()> {
        Ok(())
    }

    fn kill_tree(&self, _pid: u32) -> io::Result<()> {
        Ok(())
    }
}

/// Sink that discards emulator output.
pub(crate) struct QuietSink;

impl OutputSink for QuietSink {
    fn line(&self, _stream: StreamKind, _line: &str) {}
}

pub(crate) fn collaborators(spawner: FakeSpawner) -> Collaborators {
    Collaborators::system()
        .with_spawner(Arc::new(spawner))
        .with_reaper(Arc::new(NoopReaper))
        .with_sink(Arc::new(QuietSink))
}

/// Shutdown request delivered after a delay, or never.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ScheduledSignal(pub(crate) Option<Duration>);

impl ShutdownSignal for ScheduledSignal {
    fn listen(&self, token: CancellationToken) -> Result<ShutdownListener, ShutdownError> {
        if let Some(delay) = self.0 {
            thread::spawn(move || {
                thread::sleep(delay);
                token.cancel();
            });
        }
        Ok(ShutdownListener::detached())
    }
}

/// Listener that cannot be installed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BrokenSignal;

impl ShutdownSignal for BrokenSignal {
    fn listen(&self, _token: CancellationToken) -> Result<ShutdownListener, ShutdownError> {
        Err(ShutdownError::Install {
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        })
    }
}

/// Command line for a run against a temporary data directory.
pub(crate) fn args(data: &TempDir, extra: &[&str]) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "pubsub-emulator".into(),
        "--port".into(),
        TEST_PORT.to_string().into(),
        "--data-dir".into(),
        data.path().join("data").into_os_string(),
        "--startup-timeout-ms".into(),
        "1500".into(),
    ];
    args.extend(extra.iter().map(OsString::from));
    args
}

//! Scripted process doubles for exercising the supervisor without `gcloud`.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

use crate::emulator::{Collaborators, Emulator};
use crate::error::EmulatorError;
use crate::launcher::Invocation;
use crate::monitor::{OutputSink, StreamKind};
use crate::process::{EmulatorProcess, ExitSummary, ProcessSpawner, SpawnedEmulator};
use crate::settings::EmulatorSettings;
use crate::shutdown::ProcessReaper;

/// Readiness line as the emulator prints it.
pub(crate) const READY_LINE: &str = "[pubsub] INFO: Server started, listening on 8085";

/// Bind-conflict line as the emulator prints it.
pub(crate) const CONFLICT_LINE: &str =
    "[pubsub] java.net.BindException: Address already in use";

/// Short timings so lifecycle tests finish quickly.
pub(crate) const TEST_GRACE: Duration = Duration::from_millis(300);
pub(crate) const TEST_BUDGET: Duration = Duration::from_millis(900);

/// Reader fed through a channel; reports end of stream once every sender is
/// gone.
pub(crate) struct ChannelReader {
    chunks: Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.chunks.recv() {
                Ok(chunk) => self.pending = chunk,
                Err(_) => return Ok(0),
            }
        }
        let len = self.pending.len().min(buf.len());
        for (dst, src) in buf.iter_mut().zip(self.pending.drain(..len)) {
            *dst = src;
        }
        Ok(len)
    }
}

#[derive(Default)]
struct Pipes {
    stdout: Option<Sender<Vec<u8>>>,
    stderr: Option<Sender<Vec<u8>>>,
}

/// In-memory process whose output and exit are driven by the test.
///
/// Killing or exiting closes both output streams, as the operating system
/// does for a real process group.
pub(crate) struct ScriptedProcess {
    pid: u32,
    exit: Mutex<Option<ExitSummary>>,
    pipes: Mutex<Pipes>,
    wait_fails: AtomicBool,
    kills: AtomicUsize,
}

impl ScriptedProcess {
    pub(crate) fn new(pid: u32) -> Self {
        Self {
            pid,
            exit: Mutex::new(None),
            pipes: Mutex::new(Pipes::default()),
            wait_fails: AtomicBool::new(false),
            kills: AtomicUsize::new(0),
        }
    }

    /// Creates the stream readers handed to the supervisor.
    pub(crate) fn open_streams(&self) -> (ChannelReader, ChannelReader) {
        let (stdout_tx, stdout_rx) = channel();
        let (stderr_tx, stderr_rx) = channel();
        let mut pipes = self.pipes.lock().unwrap_or_else(PoisonError::into_inner);
        pipes.stdout = Some(stdout_tx);
        pipes.stderr = Some(stderr_tx);
        (
            ChannelReader {
                chunks: stdout_rx,
                pending: Vec::new(),
            },
            ChannelReader {
                chunks: stderr_rx,
                pending: Vec::new(),
            },
        )
    }

    /// Writes one line to `stream` if it is still open.
    pub(crate) fn emit(&self, stream: StreamKind, line: &str) {
        let pipes = self.pipes.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = match stream {
            StreamKind::Stdout => pipes.stdout.as_ref(),
            StreamKind::Stderr => pipes.stderr.as_ref(),
        };
        if let Some(sender) = sender {
            drop(sender.send(format!("{line}\n").into_bytes()));
        }
    }

    /// Terminates the process with `status`.
    pub(crate) fn exit_with(&self, status: ExitSummary) {
        self.exit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(status);
        self.close_streams();
    }

    /// Makes every later exit poll fail.
    pub(crate) fn fail_wait(&self) {
        self.wait_fails.store(true, Ordering::SeqCst);
    }

    pub(crate) fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub(crate) fn has_exited(&self) -> bool {
        self.exit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn close_streams(&self) {
        *self.pipes.lock().unwrap_or_else(PoisonError::into_inner) = Pipes::default();
    }
}

impl EmulatorProcess for ScriptedProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn kill(&self) -> io::Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.exit_with(ExitSummary::with_signal(9));
        Ok(())
    }

    fn try_wait(&self) -> io::Result<Option<ExitSummary>> {
        if self.wait_fails.load(Ordering::SeqCst) {
            return Err(io::Error::other("wait failed"));
        }
        Ok(*self.exit.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// One action of a launch script.
#[derive(Debug, Clone)]
pub(crate) enum Action {
    Line(StreamKind, String),
    Sleep(Duration),
    Exit(ExitSummary),
}

impl Action {
    pub(crate) fn stderr(line: &str) -> Self {
        Self::Line(StreamKind::Stderr, line.to_owned())
    }

    pub(crate) fn stdout(line: &str) -> Self {
        Self::Line(StreamKind::Stdout, line.to_owned())
    }
}

/// Spawner that plays a script against a [`ScriptedProcess`].
///
/// The script runs on its own thread and stops at the first action after the
/// process was killed. A script without [`Action::Exit`] leaves the process
/// running until teardown.
pub(crate) struct ScriptedSpawner {
    script: Vec<Action>,
    failure: Option<EmulatorError>,
    launches: Mutex<Vec<Invocation>>,
    processes: Mutex<Vec<Arc<ScriptedProcess>>>,
}

impl ScriptedSpawner {
    pub(crate) fn new(script: Vec<Action>) -> Self {
        Self {
            script,
            failure: None,
            launches: Mutex::new(Vec::new()),
            processes: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing(error: EmulatorError) -> Self {
        Self {
            failure: Some(error),
            ..Self::new(Vec::new())
        }
    }

    pub(crate) fn launches(&self) -> Vec<Invocation> {
        self.launches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn last_process(&self) -> Option<Arc<ScriptedProcess>> {
        self.processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

impl ProcessSpawner for ScriptedSpawner {
    fn spawn(&self, invocation: &Invocation) -> Result<SpawnedEmulator, EmulatorError> {
        self.launches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(invocation.clone());
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }

        let process = Arc::new(ScriptedProcess::new(4242));
        let (stdout, stderr) = process.open_streams();
        self.processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&process));

        let script = self.script.clone();
        let actor = Arc::clone(&process);
        thread::spawn(move || {
            for action in script {
                if actor.has_exited() {
                    break;
                }
                match action {
                    Action::Line(stream, line) => actor.emit(stream, &line),
                    Action::Sleep(pause) => thread::sleep(pause),
                    Action::Exit(status) => actor.exit_with(status),
                }
            }
        });

        Ok(SpawnedEmulator {
            process,
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        })
    }
}

/// Reaper that records the steps it was asked to run.
#[derive(Default)]
pub(crate) struct RecordingReaper {
    calls: Mutex<Vec<String>>,
}

impl RecordingReaper {
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of completed teardowns; every teardown targets the port once.
    pub(crate) fn teardowns(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with("port:"))
            .count()
    }

    fn record(&self, call: String) -> io::Result<()> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
        Ok(())
    }
}

impl ProcessReaper for RecordingReaper {
    fn kill_port_holders(&self, port: u16) -> io::Result<()> {
        self.record(format!("port:{port}"))
    }

    fn kill_runtime_processes(&self) -> io::Result<()> {
        self.record("runtime".to_owned())
    }

    fn kill_tooling_processes(&self) -> io::Result<()> {
        self.record("tooling".to_owned())
    }

    fn kill_tree(&self, pid: u32) -> io::Result<()> {
        self.record(format!("tree:{pid}"))
    }
}

/// Sink that keeps every forwarded line.
#[derive(Default)]
pub(crate) struct RecordingSink {
    lines: Mutex<Vec<(StreamKind, String)>>,
}

impl RecordingSink {
    pub(crate) fn lines(&self) -> Vec<(StreamKind, String)> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl OutputSink for RecordingSink {
    fn line(&self, stream: StreamKind, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((stream, line.to_owned()));
    }
}

/// Emulator wired to scripted doubles, with its data directory in a temp dir.
pub(crate) struct Fixture {
    pub(crate) emulator: Emulator,
    pub(crate) spawner: Arc<ScriptedSpawner>,
    pub(crate) reaper: Arc<RecordingReaper>,
    pub(crate) sink: Arc<RecordingSink>,
    pub(crate) data: TempDir,
}

impl Fixture {
    pub(crate) fn new(spawner: ScriptedSpawner) -> Self {
        Self::with_settings(spawner, |settings| settings)
    }

    pub(crate) fn with_settings(
        spawner: ScriptedSpawner,
        adjust: impl FnOnce(EmulatorSettings) -> EmulatorSettings,
    ) -> Self {
        let data = TempDir::new().expect("temp dir");
        let settings = adjust(
            EmulatorSettings::new("test-project", 8085)
                .with_data_dir(data.path().join("pubsub-data"))
                .with_timeouts(TEST_GRACE, TEST_BUDGET),
        );
        let spawner = Arc::new(spawner);
        let reaper = Arc::new(RecordingReaper::default());
        let sink = Arc::new(RecordingSink::default());
        let collaborators = Collaborators::system()
            .with_spawner(spawner.clone())
            .with_reaper(reaper.clone())
            .with_sink(sink.clone());
        Self {
            emulator: Emulator::with_collaborators(settings, collaborators),
            spawner,
            reaper,
            sink,
            data,
        }
    }

    pub(crate) fn process(&self) -> Arc<ScriptedProcess> {
        self.spawner.last_process().expect("a launched process")
    }
}

/// Script of an emulator that starts normally and keeps running.
pub(crate) fn healthy_script() -> Vec<Action> {
    vec![
        Action::stdout("Executing: cloud-pubsub-emulator/bin/cloud-pubsub-emulator"),
        Action::stderr("[pubsub] This is the Google Pub/Sub fake."),
        Action::Sleep(Duration::from_millis(20)),
        Action::stderr(READY_LINE),
    ]
}

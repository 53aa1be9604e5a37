//! Escalating, best-effort teardown of a launched emulator.
//!
//! Teardown never fails: each step is attempted in order and a failing step
//! is logged before the next one runs. The platform-specific termination
//! commands are plain data ([`TeardownCommand`]) so both command families
//! can be inspected on any host.

use std::fmt;
use std::io;
use std::process::{Command, Stdio};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::endpoint::EndpointRegistry;
use crate::process::{EmulatorProcess, ExitSummary};

/// Log target for teardown.
pub(crate) const SHUTDOWN_TARGET: &str = "emulator_host::shutdown";

/// Runtime the emulator runs on; matched only when name fallbacks are enabled.
pub const RUNTIME_PROCESS_NAME: &str = "java";

/// Command-line fragments of the emulator tooling; matched only when name
/// fallbacks are enabled.
pub const TOOLING_NAME_FRAGMENTS: [&str; 3] = ["emulator", "pubsub", "gcloud"];

/// Operating-system family whose commands teardown uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOs {
    /// Linux, macOS and other Unix-like hosts.
    Unix,
    /// Windows hosts.
    Windows,
}

impl HostOs {
    /// Family of the running host.
    #[must_use]
    pub const fn detect() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Unix
        }
    }
}

/// External command run during teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownCommand {
    program: String,
    args: Vec<String>,
    verbatim: bool,
}

impl TeardownCommand {
    fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_owned(),
            args: args.into_iter().map(Into::into).collect(),
            verbatim: false,
        }
    }

    /// `cmd /c` script passed through without argument quoting, which
    /// `cmd.exe` would otherwise reject.
    fn cmd_script(script: String) -> Self {
        Self {
            program: "cmd".to_owned(),
            args: vec!["/c".to_owned(), script],
            verbatim: true,
        }
    }

    /// Kills every process listening on TCP `port`, except `spared_pid`.
    ///
    /// Only listeners match: clients connected to the emulator, such as the
    /// test process that owns the supervisor, are left alone.
    #[must_use]
    pub fn port_holders(os: HostOs, port: u16, spared_pid: u32) -> Self {
        match os {
            HostOs::Unix => Self::new(
                "sh",
                [
                    "-c".to_owned(),
                    format!(
                        "pids=$(lsof -ti tcp:{port} -sTCP:LISTEN | grep -vx {spared_pid}) && [ -n \"$pids\" ] && kill -9 $pids"
                    ),
                ],
            ),
            // A listener's remote column is `:0`, so `:<port> ` followed by
            // LISTENING can only be the local address.
            HostOs::Windows => Self::cmd_script(format!(
                "for /f \"tokens=5\" %a in ('netstat -ano ^| findstr /r /c:\":{port} .*LISTENING\"') do @if not %a=={spared_pid} taskkill /F /PID %a"
            )),
        }
    }

    /// Kills processes of the emulator's runtime.
    #[must_use]
    pub fn runtime_processes(os: HostOs) -> Self {
        match os {
            HostOs::Unix => Self::new("pkill", ["-9", "-f", RUNTIME_PROCESS_NAME]),
            HostOs::Windows => {
                Self::new("taskkill", ["/F", "/IM", format!("{RUNTIME_PROCESS_NAME}.exe").as_str()])
            }
        }
    }

    /// Kills processes whose command line or window title contains `fragment`.
    #[must_use]
    pub fn tooling_processes(os: HostOs, fragment: &str) -> Self {
        match os {
            HostOs::Unix => Self::new("pkill", ["-9", "-f", fragment]),
            HostOs::Windows => Self::new(
                "taskkill",
                ["/F", "/FI", format!("WINDOWTITLE eq *{fragment}*").as_str()],
            ),
        }
    }

    /// Kills the whole tree rooted at `pid` on Windows.
    ///
    /// Unix has no command: the launched process leads its own process
    /// group, which is signalled directly. Matching children by parent pid
    /// after the leader was reaped could hit a process that reused the pid.
    #[must_use]
    pub fn process_tree(os: HostOs, pid: u32) -> Option<Self> {
        match os {
            HostOs::Unix => None,
            HostOs::Windows => Some(Self::new(
                "taskkill",
                ["/F".to_owned(), "/T".to_owned(), "/PID".to_owned(), pid.to_string()],
            )),
        }
    }

    /// Program name.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments in order.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Returns true when the arguments reach the program unquoted.
    #[must_use]
    pub const fn is_verbatim(&self) -> bool {
        self.verbatim
    }

    /// Runs the command to completion with its output discarded.
    ///
    /// # Errors
    ///
    /// Returns an error when the command cannot be launched or waited on. A
    /// non-zero exit is not an error: most of these commands report "nothing
    /// matched" that way.
    pub fn run(&self) -> io::Result<ExitSummary> {
        let mut command = Command::new(&self.program);
        push_args(&mut command, &self.args, self.verbatim);
        let status = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        let summary = ExitSummary::from(status);
        debug!(
            target: SHUTDOWN_TARGET,
            program = %self.program,
            args = ?self.args,
            %summary,
            "teardown command finished"
        );
        Ok(summary)
    }
}

#[cfg(windows)]
fn push_args(command: &mut Command, args: &[String], verbatim: bool) {
    use std::os::windows::process::CommandExt;
    if !verbatim {
        command.args(args);
        return;
    }
    for arg in args {
        command.raw_arg(arg);
    }
}

#[cfg(not(windows))]
fn push_args(command: &mut Command, args: &[String], _verbatim: bool) {
    command.args(args);
}

/// Terminates processes that outlive the launched handle.
pub trait ProcessReaper: Send + Sync {
    /// Kills whatever listens on `port`, never the calling process.
    ///
    /// # Errors
    ///
    /// Returns an error when the termination could not be attempted.
    fn kill_port_holders(&self, port: u16) -> io::Result<()>;

    /// Kills processes of the emulator's runtime by name.
    ///
    /// # Errors
    ///
    /// Returns an error when the termination could not be attempted.
    fn kill_runtime_processes(&self) -> io::Result<()>;

    /// Kills processes matching the emulator tooling names.
    ///
    /// # Errors
    ///
    /// Returns an error when the termination could not be attempted.
    fn kill_tooling_processes(&self) -> io::Result<()>;

    /// Kills the process group and tree rooted at `pid`.
    ///
    /// # Errors
    ///
    /// Returns an error when the termination could not be attempted.
    fn kill_tree(&self, pid: u32) -> io::Result<()>;
}

/// [`ProcessReaper`] using the host's process tools.
#[derive(Debug, Clone, Copy)]
pub struct SystemReaper {
    os: HostOs,
}

impl SystemReaper {
    /// Reaper for the running host.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            os: HostOs::detect(),
        }
    }
}

impl Default for SystemReaper {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessReaper for SystemReaper {
    fn kill_port_holders(&self, port: u16) -> io::Result<()> {
        TeardownCommand::port_holders(self.os, port, std::process::id())
            .run()
            .map(|_| ())
    }

    fn kill_runtime_processes(&self) -> io::Result<()> {
        TeardownCommand::runtime_processes(self.os).run().map(|_| ())
    }

    fn kill_tooling_processes(&self) -> io::Result<()> {
        let mut first_error = None;
        for fragment in TOOLING_NAME_FRAGMENTS {
            if let Err(error) = TeardownCommand::tooling_processes(self.os, fragment).run() {
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn kill_tree(&self, pid: u32) -> io::Result<()> {
        #[cfg(unix)]
        let group = kill_process_group(pid);
        #[cfg(not(unix))]
        let group = Ok(());
        let tree = TeardownCommand::process_tree(self.os, pid)
            .map_or(Ok(()), |command| command.run().map(|_| ()));
        group.and(tree)
    }
}

/// Sends `SIGKILL` to the process group led by `pid`.
#[cfg(unix)]
fn kill_process_group(pid: u32) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: `kill(2)` only reads its integer arguments; a stale group id
    // yields ESRCH rather than undefined behaviour.
    let result = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if result == 0 {
        return Ok(());
    }
    let error = io::Error::last_os_error();
    if error.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(error)
    }
}

/// One step of the teardown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    /// Kill the launched process handle.
    KillHandle,
    /// Kill whatever holds the configured port.
    PortHolders,
    /// Kill runtime processes by name.
    RuntimeProcesses,
    /// Kill tooling processes by name.
    ToolingProcesses,
    /// Kill the process group and tree captured at launch.
    ProcessTree,
    /// Withdraw the published endpoint.
    ClearRegistry,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::KillHandle => "kill process handle",
            Self::PortHolders => "kill port holders",
            Self::RuntimeProcesses => "kill runtime processes",
            Self::ToolingProcesses => "kill tooling processes",
            Self::ProcessTree => "kill process tree",
            Self::ClearRegistry => "clear endpoint registry",
        };
        f.write_str(label)
    }
}

/// What teardown acts on.
pub(crate) struct Teardown<'a> {
    pub(crate) process: &'a Arc<dyn EmulatorProcess>,
    pub(crate) pid: Option<u32>,
    pub(crate) port: u16,
    pub(crate) name_fallback: bool,
    pub(crate) reaper: &'a dyn ProcessReaper,
    pub(crate) registry: &'a EndpointRegistry,
}

impl Teardown<'_> {
    /// Runs every step, returning the steps that failed.
    pub(crate) fn run(&self) -> Vec<TeardownStep> {
        let mut failed = Vec::new();
        let mut attempt = |step: TeardownStep, result: io::Result<()>| {
            if let Err(error) = result {
                warn!(target: SHUTDOWN_TARGET, %step, %error, "teardown step failed");
                failed.push(step);
            }
        };

        attempt(TeardownStep::KillHandle, self.process.kill());
        attempt(
            TeardownStep::PortHolders,
            self.reaper.kill_port_holders(self.port),
        );
        if self.name_fallback {
            attempt(
                TeardownStep::RuntimeProcesses,
                self.reaper.kill_runtime_processes(),
            );
            attempt(
                TeardownStep::ToolingProcesses,
                self.reaper.kill_tooling_processes(),
            );
        }
        if let Some(pid) = self.pid {
            attempt(TeardownStep::ProcessTree, self.reaper.kill_tree(pid));
        }
        self.registry.clear();

        debug!(
            target: SHUTDOWN_TARGET,
            port = self.port,
            pid = ?self.pid,
            failed_steps = failed.len(),
            "teardown finished"
        );
        failed
    }
}

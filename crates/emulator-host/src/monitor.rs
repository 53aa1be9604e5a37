//! Line-oriented monitoring of the emulator's output streams.
//!
//! Detection relies on substrings in the emulator's log output, which is a
//! fragile contract: the fixtures under `tests/fixtures/` pin the formats the
//! classifier is known to handle.

use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;

use tracing::{debug, info};

use crate::coordinator::{StartupEvent, signal};
use crate::error::EmulatorError;

/// Log target for output monitoring.
pub(crate) const MONITOR_TARGET: &str = "emulator_host::monitor";

/// Log target under which forwarded emulator output is emitted.
pub const OUTPUT_TARGET: &str = "emulator_host::output";

/// Substring announcing that the emulator accepts connections.
pub const READY_MARKER: &str = "Server started";

/// Substrings announcing that the bind port is already occupied.
pub const PORT_CONFLICT_MARKERS: [&str; 3] = [
    "Address already in use",
    "BindException",
    "already in use: bind",
];

/// One of the emulator's output streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Standard output.
    Stdout,
    /// Standard error; the emulator logs its readiness marker here.
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// Receives every output line verbatim.
///
/// Lines from one stream arrive in order; lines from different streams are
/// not ordered relative to each other.
pub trait OutputSink: Send + Sync {
    /// Observes one line, without its trailing newline.
    fn line(&self, stream: StreamKind, line: &str);
}

/// Sink that forwards emulator output to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl OutputSink for TracingSink {
    fn line(&self, stream: StreamKind, line: &str) {
        info!(target: OUTPUT_TARGET, %stream, "{line}");
    }
}

/// Signal carried by a single output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSignal {
    /// The readiness marker.
    Ready,
    /// A bind-conflict marker.
    PortConflict,
}

/// Classifies one line of emulator output.
///
/// Bind conflicts are recognised on every stream; readiness only when
/// `detect_ready` is set. A line carrying both reports the conflict.
#[must_use]
pub fn classify_line(line: &str, detect_ready: bool) -> Option<LineSignal> {
    if PORT_CONFLICT_MARKERS
        .iter()
        .any(|marker| line.contains(marker))
    {
        return Some(LineSignal::PortConflict);
    }
    if detect_ready && line.contains(READY_MARKER) {
        return Some(LineSignal::Ready);
    }
    None
}

/// Everything a monitor thread needs besides its reader.
pub(crate) struct MonitorContext {
    pub(crate) stream: StreamKind,
    pub(crate) detect_ready: bool,
    pub(crate) port: u16,
    pub(crate) events: SyncSender<StartupEvent>,
    pub(crate) sink: Arc<dyn OutputSink>,
    pub(crate) stop: Arc<AtomicBool>,
}

/// Reads `reader` until it closes, fails, reports a bind conflict, or
/// teardown raises the stop flag.
pub(crate) fn run_monitor(context: &MonitorContext, reader: impl Read) {
    let stream = context.stream;
    let mut reader = BufReader::new(reader);
    let mut buffer = Vec::new();
    let mut ready_sent = false;

    loop {
        if context.stop.load(Ordering::SeqCst) {
            debug!(target: MONITOR_TARGET, %stream, "monitor stopped by teardown");
            return;
        }

        buffer.clear();
        match reader.read_until(b'\n', &mut buffer) {
            Ok(0) => {
                debug!(target: MONITOR_TARGET, %stream, "output stream closed");
                return;
            }
            Ok(_) => {
                let text = String::from_utf8_lossy(&buffer);
                let line = text.trim_end_matches(['\r', '\n']);
                context.sink.line(stream, line);

                match classify_line(line, context.detect_ready && !ready_sent) {
                    Some(LineSignal::Ready) => {
                        ready_sent = true;
                        debug!(target: MONITOR_TARGET, %stream, "readiness marker observed");
                        signal(&context.events, StartupEvent::Ready);
                    }
                    Some(LineSignal::PortConflict) => {
                        debug!(
                            target: MONITOR_TARGET,
                            %stream,
                            port = context.port,
                            "bind conflict observed"
                        );
                        signal(
                            &context.events,
                            StartupEvent::Failed(EmulatorError::PortConflict {
                                port: context.port,
                            }),
                        );
                        return;
                    }
                    None => {}
                }
            }
            Err(error) => {
                if context.stop.load(Ordering::SeqCst) {
                    return;
                }
                debug!(target: MONITOR_TARGET, %stream, %error, "output stream read failed");
                signal(
                    &context.events,
                    StartupEvent::Failed(EmulatorError::OutputRead {
                        stream,
                        source: Arc::new(error),
                    }),
                );
                return;
            }
        }
    }
}

//! Watches the launched process for exit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::coordinator::{StartupEvent, signal};
use crate::emulator::{Lifecycle, LifecycleState};
use crate::error::EmulatorError;
use crate::process::{EmulatorProcess, ExitSummary};

/// Log target for the process watcher.
pub(crate) const WATCHER_TARGET: &str = "emulator_host::watcher";

/// Interval between exit polls.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Everything the watcher thread needs.
pub(crate) struct WatcherContext {
    pub(crate) process: Arc<dyn EmulatorProcess>,
    pub(crate) launched: Instant,
    pub(crate) early_exit_window: Duration,
    pub(crate) events: SyncSender<StartupEvent>,
    pub(crate) faults: SyncSender<EmulatorError>,
    pub(crate) lifecycle: Arc<Mutex<Lifecycle>>,
    pub(crate) stop: Arc<AtomicBool>,
}

/// Polls the process until it exits and reports the exit.
///
/// An exit before readiness goes to the startup channel. The event is sent
/// before the lifecycle lock is taken because `start` holds that lock while
/// it waits for the outcome. An exit after the instance is running marks it
/// crashed and raises a fault. Exits caused by teardown are not reported.
pub(crate) fn run_watcher(context: &WatcherContext) {
    let Some(status) = wait_for_exit(context) else {
        return;
    };
    let elapsed = context.launched.elapsed();
    if context.stop.load(Ordering::SeqCst) {
        debug!(target: WATCHER_TARGET, %status, "emulator exited during teardown");
        return;
    }

    if elapsed < context.early_exit_window {
        debug!(target: WATCHER_TARGET, %status, ?elapsed, "emulator exited early");
    } else {
        debug!(target: WATCHER_TARGET, %status, ?elapsed, "emulator exited");
    }
    signal(
        &context.events,
        StartupEvent::Failed(EmulatorError::EarlyExit { status, elapsed }),
    );

    let mut lifecycle = context
        .lifecycle
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if lifecycle.state != LifecycleState::Running || context.stop.load(Ordering::SeqCst) {
        return;
    }
    lifecycle.state = LifecycleState::Crashed;
    drop(lifecycle);

    warn!(target: WATCHER_TARGET, %status, "emulator exited unexpectedly");
    match context
        .faults
        .try_send(EmulatorError::UnexpectedCrash { status })
    {
        Ok(()) | Err(TrySendError::Disconnected(_)) => {}
        Err(TrySendError::Full(_)) => {
            debug!(target: WATCHER_TARGET, "fault already pending; crash not queued");
        }
    }
}

fn wait_for_exit(context: &WatcherContext) -> Option<ExitSummary> {
    loop {
        if context.stop.load(Ordering::SeqCst) {
            debug!(target: WATCHER_TARGET, "watcher stopped by teardown");
            return None;
        }
        match context.process.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(error) => {
                debug!(target: WATCHER_TARGET, %error, "polling emulator process failed");
                signal(
                    &context.events,
                    StartupEvent::Failed(EmulatorError::Wait {
                        source: Arc::new(error),
                    }),
                );
                return None;
            }
        }
    }
}

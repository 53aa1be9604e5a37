//! Readiness coordination for a starting emulator.
//!
//! Startup is a two-phase wait. During the grace window any fatal signal
//! fails startup immediately; when the window closes, events that raced the
//! deadline are drained before the extended phase waits out the remaining
//! budget. The rules live in [`transition`]; the coordinator only turns the
//! clock, the cancellation token and the event channel into [`Signal`]s.

use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::cancel::CancellationToken;
use crate::error::EmulatorError;

/// Log target for readiness coordination.
pub(crate) const COORDINATOR_TARGET: &str = "emulator_host::coordinator";

/// Startup channel capacity: one event per producer plus one spare.
pub(crate) const EVENT_CAPACITY: usize = 4;

/// Upper bound on how long the coordinator sleeps before re-checking the
/// cancellation token.
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Event published by a monitor or the watcher while startup is pending.
#[derive(Debug, Clone)]
pub enum StartupEvent {
    /// The readiness marker was observed.
    Ready,
    /// A fatal condition was observed.
    Failed(EmulatorError),
}

/// Publishes `event` without blocking.
///
/// A full channel means startup has already been resolved by earlier events;
/// a disconnected one means nobody is waiting any more. Either way the event
/// is dropped.
pub(crate) fn signal(events: &SyncSender<StartupEvent>, event: StartupEvent) {
    match events.try_send(event) {
        Ok(()) | Err(TrySendError::Disconnected(_)) => {}
        Err(TrySendError::Full(dropped)) => {
            debug!(target: COORDINATOR_TARGET, ?dropped, "startup channel full; event dropped");
        }
    }
}

/// Phase of the startup wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Within the grace window after launch.
    Grace,
    /// After the grace window, until the overall budget runs out.
    Extended,
}

/// Input to the readiness state machine.
#[derive(Debug, Clone)]
pub enum Signal {
    /// The emulator reported readiness.
    Ready,
    /// A monitor or the watcher reported a fatal condition.
    Error(EmulatorError),
    /// The grace window closed.
    GraceElapsed,
    /// The overall budget ran out.
    BudgetElapsed(Duration),
    /// The caller cancelled startup.
    Cancelled,
}

/// How startup resolved.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The emulator is ready.
    Running,
    /// Startup failed and the emulator must be torn down.
    Failed(EmulatorError),
}

/// Action chosen by [`transition`].
#[derive(Debug, Clone)]
pub enum Step {
    /// Startup is decided.
    Resolve(Outcome),
    /// Collect events already queued before moving on.
    Drain,
    /// Move to another phase.
    Advance(Phase),
    /// Keep waiting in the current phase.
    Wait,
}

/// Readiness transition table.
#[must_use]
pub fn transition(phase: Phase, signal: Signal) -> Step {
    match (phase, signal) {
        (_, Signal::Ready) => Step::Resolve(Outcome::Running),
        (_, Signal::Error(error)) => Step::Resolve(Outcome::Failed(error)),
        (_, Signal::BudgetElapsed(budget)) => {
            Step::Resolve(Outcome::Failed(EmulatorError::timeout(budget)))
        }
        (_, Signal::Cancelled) => Step::Resolve(Outcome::Failed(EmulatorError::Cancelled)),
        (Phase::Grace, Signal::GraceElapsed) => Step::Drain,
        (Phase::Extended, Signal::GraceElapsed) => Step::Wait,
    }
}

/// Drives [`transition`] from the startup channel, the clock and the
/// cancellation token.
pub(crate) struct Coordinator<'a> {
    events: &'a Receiver<StartupEvent>,
    cancel: &'a CancellationToken,
    started: Instant,
    grace_window: Duration,
    budget: Duration,
}

impl<'a> Coordinator<'a> {
    pub(crate) fn new(
        events: &'a Receiver<StartupEvent>,
        cancel: &'a CancellationToken,
        grace_window: Duration,
        budget: Duration,
    ) -> Self {
        Self {
            events,
            cancel,
            started: Instant::now(),
            grace_window,
            budget,
        }
    }

    /// Blocks until startup resolves.
    pub(crate) fn resolve(&self) -> Outcome {
        let mut phase = Phase::Grace;
        loop {
            let Some(signal) = self.next_signal(phase) else {
                continue;
            };
            let mut step = transition(phase, signal);
            if matches!(step, Step::Drain) {
                step = self
                    .drain_pending()
                    .map_or(Step::Advance(Phase::Extended), |pending| {
                        transition(phase, pending)
                    });
            }
            match step {
                Step::Resolve(outcome) => {
                    debug!(
                        target: COORDINATOR_TARGET,
                        ?outcome,
                        elapsed_ms = self.started.elapsed().as_millis(),
                        "startup resolved"
                    );
                    return outcome;
                }
                Step::Advance(next) => {
                    debug!(target: COORDINATOR_TARGET, ?next, "grace window closed");
                    phase = next;
                }
                Step::Drain | Step::Wait => {}
            }
        }
    }

    /// Produces the next signal, or `None` when a poll interval passed
    /// without one.
    fn next_signal(&self, phase: Phase) -> Option<Signal> {
        if self.cancel.is_cancelled() {
            return Some(Signal::Cancelled);
        }

        let now = Instant::now();
        let budget_deadline = self.started + self.budget;
        if now >= budget_deadline {
            return Some(Signal::BudgetElapsed(self.budget));
        }
        let grace_deadline = self.started + self.grace_window;
        let deadline = match phase {
            Phase::Grace if now >= grace_deadline => return Some(Signal::GraceElapsed),
            Phase::Grace => grace_deadline.min(budget_deadline),
            Phase::Extended => budget_deadline,
        };

        let wait = deadline
            .saturating_duration_since(now)
            .min(CANCEL_POLL_INTERVAL);
        match self.events.recv_timeout(wait) {
            Ok(event) => Some(Self::signal_for(event)),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                // Every producer is gone; only the clock or the token can decide.
                thread::sleep(wait);
                None
            }
        }
    }

    /// Collects events queued when the grace window closed. A queued error
    /// outranks a queued readiness report.
    fn drain_pending(&self) -> Option<Signal> {
        let mut ready = false;
        for event in self.events.try_iter() {
            match event {
                StartupEvent::Failed(error) => return Some(Signal::Error(error)),
                StartupEvent::Ready => ready = true,
            }
        }
        ready.then_some(Signal::Ready)
    }

    fn signal_for(event: StartupEvent) -> Signal {
        match event {
            StartupEvent::Ready => Signal::Ready,
            StartupEvent::Failed(error) => Signal::Error(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::sync_channel;

    use rstest::rstest;

    use super::*;
    use crate::error::ErrorKind;
    use crate::process::ExitSummary;

    const GRACE: Duration = Duration::from_millis(200);
    const BUDGET: Duration = Duration::from_millis(600);

    fn failure_kind(outcome: &Outcome) -> Option<ErrorKind> {
        match outcome {
            Outcome::Running => None,
            Outcome::Failed(error) => Some(error.kind()),
        }
    }

    fn step_kind(step: &Step) -> &'static str {
        match step {
            Step::Resolve(Outcome::Running) => "running",
            Step::Resolve(Outcome::Failed(_)) => "failed",
            Step::Drain => "drain",
            Step::Advance(_) => "advance",
            Step::Wait => "wait",
        }
    }

    #[rstest]
    #[case(Phase::Grace, Signal::Ready, "running")]
    #[case(Phase::Extended, Signal::Ready, "running")]
    #[case(Phase::Grace, Signal::Error(EmulatorError::PortConflict { port: 1 }), "failed")]
    #[case(Phase::Extended, Signal::Error(EmulatorError::PortConflict { port: 1 }), "failed")]
    #[case(Phase::Grace, Signal::BudgetElapsed(BUDGET), "failed")]
    #[case(Phase::Extended, Signal::BudgetElapsed(BUDGET), "failed")]
    #[case(Phase::Grace, Signal::Cancelled, "failed")]
    #[case(Phase::Extended, Signal::Cancelled, "failed")]
    #[case(Phase::Grace, Signal::GraceElapsed, "drain")]
    #[case(Phase::Extended, Signal::GraceElapsed, "wait")]
    fn transition_table(#[case] phase: Phase, #[case] signal: Signal, #[case] expected: &str) {
        assert_eq!(step_kind(&transition(phase, signal)), expected);
    }

    #[rstest]
    fn budget_elapsed_reports_timeout_in_milliseconds() {
        let step = transition(Phase::Extended, Signal::BudgetElapsed(Duration::from_secs(30)));

        let Step::Resolve(Outcome::Failed(EmulatorError::Timeout { timeout_ms })) = step else {
            panic!("expected timeout, got {step:?}");
        };
        assert_eq!(timeout_ms, 30_000);
    }

    #[rstest]
    fn queued_ready_resolves_running() {
        let (tx, rx) = sync_channel(EVENT_CAPACITY);
        let cancel = CancellationToken::new();
        signal(&tx, StartupEvent::Ready);

        let outcome = Coordinator::new(&rx, &cancel, GRACE, BUDGET).resolve();

        assert!(matches!(outcome, Outcome::Running));
    }

    #[rstest]
    fn early_exit_during_grace_fails_before_window_closes() {
        let (tx, rx) = sync_channel(EVENT_CAPACITY);
        let cancel = CancellationToken::new();
        signal(
            &tx,
            StartupEvent::Failed(EmulatorError::EarlyExit {
                status: ExitSummary::with_code(1),
                elapsed: Duration::from_millis(10),
            }),
        );

        let started = Instant::now();
        let outcome = Coordinator::new(&rx, &cancel, Duration::from_secs(3), BUDGET).resolve();

        assert_eq!(failure_kind(&outcome), Some(ErrorKind::EarlyExit));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[rstest]
    fn ready_after_grace_window_resolves_running() {
        let (tx, rx) = sync_channel(EVENT_CAPACITY);
        let cancel = CancellationToken::new();
        let producer = thread::spawn(move || {
            thread::sleep(GRACE + Duration::from_millis(100));
            signal(&tx, StartupEvent::Ready);
            tx
        });

        let outcome = Coordinator::new(&rx, &cancel, GRACE, BUDGET).resolve();

        assert!(matches!(outcome, Outcome::Running));
        drop(producer.join());
    }

    #[rstest]
    fn silence_times_out_at_the_budget() {
        let (tx, rx) = sync_channel::<StartupEvent>(EVENT_CAPACITY);
        let cancel = CancellationToken::new();

        let started = Instant::now();
        let outcome = Coordinator::new(&rx, &cancel, GRACE, BUDGET).resolve();
        let elapsed = started.elapsed();

        assert_eq!(failure_kind(&outcome), Some(ErrorKind::Timeout));
        assert!(elapsed >= BUDGET, "resolved early: {elapsed:?}");
        assert!(elapsed < BUDGET + Duration::from_millis(400), "resolved late: {elapsed:?}");
        drop(tx);
    }

    #[rstest]
    fn budget_shorter_than_grace_times_out_in_grace_phase() {
        let (_tx, rx) = sync_channel::<StartupEvent>(EVENT_CAPACITY);
        let cancel = CancellationToken::new();

        let outcome =
            Coordinator::new(&rx, &cancel, Duration::from_secs(3), Duration::from_millis(100))
                .resolve();

        assert_eq!(failure_kind(&outcome), Some(ErrorKind::Timeout));
    }

    #[rstest]
    fn cancellation_is_observed_within_a_poll_interval() {
        let (_tx, rx) = sync_channel::<StartupEvent>(EVENT_CAPACITY);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome =
            Coordinator::new(&rx, &cancel, GRACE, Duration::from_secs(30)).resolve();

        assert_eq!(failure_kind(&outcome), Some(ErrorKind::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
        drop(canceller.join());
    }

    #[rstest]
    fn disconnected_channel_still_times_out() {
        let (tx, rx) = sync_channel::<StartupEvent>(EVENT_CAPACITY);
        drop(tx);
        let cancel = CancellationToken::new();

        let outcome = Coordinator::new(&rx, &cancel, GRACE, BUDGET).resolve();

        assert_eq!(failure_kind(&outcome), Some(ErrorKind::Timeout));
    }

    #[rstest]
    fn drain_prefers_errors_over_readiness() {
        let (tx, rx) = sync_channel(EVENT_CAPACITY);
        let cancel = CancellationToken::new();
        signal(&tx, StartupEvent::Ready);
        signal(
            &tx,
            StartupEvent::Failed(EmulatorError::PortConflict { port: 8085 }),
        );

        let drained = Coordinator::new(&rx, &cancel, GRACE, BUDGET).drain_pending();

        assert!(matches!(
            drained,
            Some(Signal::Error(EmulatorError::PortConflict { port: 8085 }))
        ));
    }

    #[rstest]
    fn drain_of_empty_channel_yields_nothing() {
        let (_tx, rx) = sync_channel::<StartupEvent>(EVENT_CAPACITY);
        let cancel = CancellationToken::new();

        assert!(
            Coordinator::new(&rx, &cancel, GRACE, BUDGET)
                .drain_pending()
                .is_none()
        );
    }

    #[rstest]
    fn full_channel_drops_extra_events() {
        let (tx, rx) = sync_channel(1);
        signal(&tx, StartupEvent::Ready);
        signal(&tx, StartupEvent::Ready);

        assert_eq!(rx.try_iter().count(), 1);
    }
}

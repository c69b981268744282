//! Completion Poller
//!
//! Wakes every `interval`, asks the engine whether the run is resolved and stops
//! the run when it is, when the deadline passes, or when something else raised
//! the shutdown signal.

use crate::context::ShutdownSignal;
use std::time::Duration;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{info, warn};
use transit_tracker::{CorrelationEngine, RunOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionPoller {
    interval: Duration,
    deadline: Duration,
}

impl CompletionPoller {
    pub fn new(interval: Duration, deadline: Duration) -> Self {
        Self { interval, deadline }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Poll until resolved, timed out or interrupted; always raises `shutdown`
    pub async fn run(&self, engine: &CorrelationEngine, shutdown: &ShutdownSignal) -> RunOutcome {
        let start = Instant::now();
        let deadline = start + self.deadline;
        let mut ticker = interval_at(start + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = shutdown.triggered() => break RunOutcome::Interrupted,
                _ = ticker.tick() => {
                    if engine.is_resolved() {
                        break RunOutcome::Resolved;
                    }
                    if Instant::now() >= deadline {
                        break RunOutcome::TimedOut;
                    }
                    let report = engine.snapshot();
                    info!(
                        resolved = report.resolved_count(),
                        total = report.total(),
                        elapsed_secs = start.elapsed().as_secs(),
                        "Transfers still pending"
                    );
                }
                _ = sleep_until(deadline) => {
                    break if engine.is_resolved() {
                        RunOutcome::Resolved
                    } else {
                        RunOutcome::TimedOut
                    };
                }
            }
        };

        match outcome {
            RunOutcome::Resolved => info!("All watched transfers resolved"),
            RunOutcome::TimedOut => warn!(
                deadline_secs = self.deadline.as_secs(),
                "Deadline reached with transfers unresolved"
            ),
            RunOutcome::Interrupted => info!("Polling interrupted"),
        }
        shutdown.trigger();
        outcome
    }
}

//! Per-execution deadline timers and the eviction guard.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::message::{ExecutionId, RunnerIndex};

/// An end timestamp closer than this to the start counts as "no completion".
const STALE_COMPLETION: Duration = Duration::from_millis(1);

/// Delivered to the host's event loop when a deadline passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutTicket {
    pub execution_id: ExecutionId,
    pub runner: RunnerIndex,
    /// When the job was dispatched.
    pub armed_at: Instant,
}

/// A scheduled ticket. Cancelling is idempotent, including after it fired.
#[derive(Debug)]
pub struct TimerHandle(JoinHandle<()>);

impl TimerHandle {
    pub fn cancel(&self) {
        self.0.abort();
    }
}

/// Arms one-shot timers that post `TimeoutTicket`s into a channel.
#[derive(Debug, Clone)]
pub struct Timers {
    tx: mpsc::UnboundedSender<TimeoutTicket>,
}

impl Timers {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimeoutTicket>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn arm(&self, ticket: TimeoutTicket, after: Duration) -> TimerHandle {
        let tx = self.tx.clone();
        TimerHandle(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            // Receiver gone means the host is shutting down.
            let _ = tx.send(ticket);
        }))
    }
}

/// Deadline plus the jitter allowance subtracted before evicting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutGuard {
    pub deadline: Duration,
    pub epsilon: Duration,
}

impl TimeoutGuard {
    pub fn new(deadline: Duration, epsilon: Duration) -> Self {
        Self { deadline, epsilon }
    }

    /// Whether a runner whose timer just fired should be evicted.
    ///
    /// Evict only if no completion was recorded for the current job (end
    /// unset, or not after the latest start) and the job has really been
    /// running for longer than `deadline - epsilon`. An ack that lands right
    /// as the timer fires sets `end` past `start` and saves the runner.
    pub fn should_evict(&self, start: Instant, end: Option<Instant>, now: Instant) -> bool {
        let no_completion = match end {
            None => true,
            Some(end) => end.saturating_duration_since(start) < STALE_COMPLETION,
        };
        let overdue = now.saturating_duration_since(start) > self.deadline.saturating_sub(self.epsilon);
        no_completion && overdue
    }
}

impl Default for TimeoutGuard {
    fn default() -> Self {
        Self::new(Duration::from_millis(400), Duration::from_millis(10))
    }
}

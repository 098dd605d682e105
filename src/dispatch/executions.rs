//! In-flight executions and idle runners.

use std::collections::HashMap;

use tokio::time::Instant;

use super::message::{ExecutionId, RunnerIndex};
use super::phase::Phase;

/// One dispatched job awaiting its acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRecord {
    pub runner: RunnerIndex,
    pub phase: Phase,
    pub dispatched_at: Instant,
}

/// Executions sent but not yet acknowledged or evicted.
#[derive(Debug, Default)]
pub struct InFlight {
    records: HashMap<ExecutionId, ExecutionRecord>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ExecutionId, record: ExecutionRecord) {
        self.records.insert(id, record);
    }

    /// Idempotent: removing an unknown id is not an error.
    pub fn remove(&mut self, id: &ExecutionId) -> Option<ExecutionRecord> {
        self.records.remove(id)
    }

    pub fn contains(&self, id: &ExecutionId) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Runners that asked for work and found none.
#[derive(Debug, Default)]
pub struct IdleRunners {
    runners: Vec<RunnerIndex>,
}

impl IdleRunners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a runner; a runner already listed is not added twice.
    pub fn push(&mut self, runner: RunnerIndex) {
        if !self.runners.contains(&runner) {
            self.runners.push(runner);
        }
    }

    pub fn remove(&mut self, runner: RunnerIndex) {
        self.runners.retain(|r| *r != runner);
    }

    pub fn contains(&self, runner: RunnerIndex) -> bool {
        self.runners.contains(&runner)
    }

    /// Take the whole list, leaving it empty.
    pub fn take(&mut self) -> Vec<RunnerIndex> {
        std::mem::take(&mut self.runners)
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}

//! Runner slots: the host's bookkeeping for each runner process.

use std::collections::BTreeMap;

use tokio::time::Instant;

use super::message::{ExecutionId, RunnerIndex};
use super::timer::TimerHandle;
use crate::runner::RunnerHandle;

/// Local state of one runner.
pub struct RunnerSlot {
    pub index: RunnerIndex,
    pub runner: Box<dyn RunnerHandle>,
    pub last_execution_start: Option<Instant>,
    pub last_execution_end: Option<Instant>,
    /// Job this runner is working on, if any.
    pub current_execution: Option<ExecutionId>,
    timer: Option<TimerHandle>,
}

impl RunnerSlot {
    pub fn new(index: RunnerIndex, runner: Box<dyn RunnerHandle>) -> Self {
        Self {
            index,
            runner,
            last_execution_start: None,
            last_execution_end: None,
            current_execution: None,
            timer: None,
        }
    }

    /// Record a dispatch and take ownership of its deadline timer.
    pub fn begin(&mut self, execution_id: ExecutionId, at: Instant, timer: TimerHandle) {
        self.cancel_timer();
        self.current_execution = Some(execution_id);
        self.last_execution_start = Some(at);
        self.timer = Some(timer);
    }

    /// Record a completion: cancel the deadline and stamp the end time.
    pub fn complete(&mut self, at: Instant) {
        self.cancel_timer();
        self.current_execution = None;
        self.last_execution_end = Some(at);
    }

    pub fn has_timer(&self) -> bool {
        self.timer.is_some()
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

impl Drop for RunnerSlot {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

/// All live slots, plus the monotonic index allocator.
#[derive(Default)]
pub struct SlotTable {
    slots: BTreeMap<RunnerIndex, RunnerSlot>,
    next_index: u32,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next index. Indices are never handed out twice.
    pub fn allocate_index(&mut self) -> RunnerIndex {
        let index = RunnerIndex(self.next_index);
        self.next_index += 1;
        index
    }

    /// Highest index ever allocated.
    pub fn max_index(&self) -> Option<RunnerIndex> {
        self.next_index.checked_sub(1).map(RunnerIndex)
    }

    pub fn insert(&mut self, slot: RunnerSlot) {
        self.slots.insert(slot.index, slot);
    }

    pub fn remove(&mut self, index: RunnerIndex) -> Option<RunnerSlot> {
        self.slots.remove(&index)
    }

    pub fn get(&self, index: RunnerIndex) -> Option<&RunnerSlot> {
        self.slots.get(&index)
    }

    pub fn get_mut(&mut self, index: RunnerIndex) -> Option<&mut RunnerSlot> {
        self.slots.get_mut(&index)
    }

    pub fn contains(&self, index: RunnerIndex) -> bool {
        self.slots.contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn indices(&self) -> Vec<RunnerIndex> {
        self.slots.keys().copied().collect()
    }

    /// Remove every slot (shutdown).
    pub fn drain(&mut self) -> Vec<RunnerSlot> {
        std::mem::take(&mut self.slots).into_values().collect()
    }
}

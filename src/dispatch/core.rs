//! Task assignment, timeout eviction and the phase drain.
//!
//! All state lives here and is mutated only from the host's event loop, one
//! event at a time, so nothing needs a lock. The only cross-host ordering
//! guarantee comes from the shared queue's atomic pop.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::executions::{ExecutionRecord, IdleRunners, InFlight};
use super::heartbeat::{Heartbeat, HeartbeatReporter};
use super::message::{ExecutionId, JobMessage, RunnerIndex, RunnerMessage};
use super::phase::{Phase, PhaseSource, RegistryPhase};
use super::slot::{RunnerSlot, SlotTable};
use super::timer::{TimeoutGuard, TimeoutTicket, Timers};
use crate::bus::keys::{
    PHASE_CHANGED_CHANNEL, TOTAL_NUMBER_OF_SCRIPT_EXECUTIONS_KEY,
    TOTAL_SCRIPT_EXECUTION_TIME_KEY, runner_channel,
};
use crate::bus::{Bus, BusMessage, Publisher, Registry, SharedQueue};
use crate::error::{DispatchError, RunnerError};
use crate::runner::RunnerLauncher;

/// Collaborators the core talks to. Everything crosses an await.
#[derive(Clone)]
pub struct DispatchDeps {
    pub queue: Arc<dyn SharedQueue>,
    pub registry: Arc<dyn Registry>,
    pub publisher: Arc<dyn Publisher>,
    pub phase: Arc<dyn PhaseSource>,
    pub launcher: Arc<dyn RunnerLauncher>,
}

impl DispatchDeps {
    /// Wire every bus-facing dependency to one bus, with the phase read from
    /// its registry.
    pub fn from_bus<B: Bus + 'static>(bus: Arc<B>, launcher: Arc<dyn RunnerLauncher>) -> Self {
        Self {
            queue: bus.clone(),
            registry: bus.clone(),
            publisher: bus.clone(),
            phase: Arc::new(RegistryPhase::new(bus)),
            launcher,
        }
    }
}

/// Point-in-time view of a host, for the status endpoint and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherStats {
    pub host_id: String,
    pub runners: Vec<RunnerIndex>,
    pub in_flight: usize,
    pub idle: Vec<RunnerIndex>,
    pub total_completes: u64,
    pub total_timeouts: u64,
}

/// Owns the runner pool of one dispatcher host.
pub struct DispatchCore {
    host_id: String,
    host_channel: String,
    deps: DispatchDeps,
    guard: TimeoutGuard,
    timers: Timers,
    heartbeat: HeartbeatReporter,
    /// Pool size the host tries to keep.
    runner_target: usize,
    slots: SlotTable,
    in_flight: InFlight,
    idle: IdleRunners,
    total_timeouts: u64,
    total_completes: u64,
}

impl DispatchCore {
    pub fn new(
        host_id: impl Into<String>,
        deps: DispatchDeps,
        guard: TimeoutGuard,
        timers: Timers,
        runner_target: usize,
    ) -> Self {
        let host_id = host_id.into();
        Self {
            host_channel: crate::bus::keys::host_channel(&host_id),
            heartbeat: HeartbeatReporter::new(deps.registry.clone(), host_id.clone()),
            host_id,
            deps,
            guard,
            timers,
            runner_target,
            slots: SlotTable::new(),
            in_flight: InFlight::new(),
            idle: IdleRunners::new(),
            total_timeouts: 0,
            total_completes: 0,
        }
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// The host's private inbox channel.
    pub fn host_channel(&self) -> &str {
        &self.host_channel
    }

    // ── Runner lifecycle ────────────────────────────────────────────────

    /// Start the initial pool, indices `0..runner_target`.
    pub async fn start_runners(&mut self) -> Result<(), RunnerError> {
        for _ in 0..self.runner_target {
            self.start_runner().await?;
        }
        info!(
            host = %self.host_id,
            runners = self.slots.len(),
            "Runner pool started"
        );
        Ok(())
    }

    /// Start one runner under a fresh index.
    async fn start_runner(&mut self) -> Result<RunnerIndex, RunnerError> {
        let index = self.slots.allocate_index();
        let runner = self.deps.launcher.start(&self.host_channel, index).await?;
        self.slots.insert(RunnerSlot::new(index, runner));
        Ok(index)
    }

    /// Top the pool back up if a replacement failed to start earlier.
    pub async fn replenish_runners(&mut self) {
        while self.slots.len() < self.runner_target {
            match self.start_runner().await {
                Ok(index) => info!(runner = %index, "Replenished runner pool"),
                Err(e) => {
                    error!(error = %e, "Failed to replenish runner pool");
                    break;
                }
            }
        }
    }

    // ── Inbound messages ────────────────────────────────────────────────

    /// Route a message from one of the host's subscriptions.
    pub async fn handle_message(&mut self, message: BusMessage) {
        if message.channel == self.host_channel {
            self.handle_inbox(&message.payload).await;
        } else if message.channel == PHASE_CHANGED_CHANNEL {
            self.on_phase_changed(&message.payload).await;
        } else {
            debug!(channel = %message.channel, "Ignoring message on unexpected channel");
        }
    }

    /// Handle a raw inbox message. Malformed input is logged and dropped.
    pub async fn handle_inbox(&mut self, payload: &str) {
        match payload.parse::<RunnerMessage>() {
            Ok(RunnerMessage::Ready { index, completed }) => {
                self.on_runner_ready(index, completed).await
            }
            Err(e) => warn!(payload, error = %e, "Malformed runner message"),
        }
    }

    /// A runner asks for work, possibly acknowledging its last job.
    pub async fn on_runner_ready(&mut self, index: RunnerIndex, completed: Option<ExecutionId>) {
        if let Some(execution_id) = completed {
            self.total_completes += 1;
            if let Some(record) = self.in_flight.remove(&execution_id) {
                debug!(
                    runner = %record.runner,
                    execution_id = %execution_id,
                    phase = %record.phase,
                    elapsed_ms = record.dispatched_at.elapsed().as_millis() as u64,
                    "Runner done"
                );
            }

            let Some(slot) = self.slots.get_mut(index) else {
                debug!(
                    runner = %index,
                    execution_id = %execution_id,
                    "Answer after timeout, runner already replaced"
                );
                return;
            };
            // A runner asking for work is done with whatever it held, even
            // when the ack names some other execution.
            if let Some(current) = slot
                .current_execution
                .take_if(|current| *current != execution_id)
            {
                warn!(
                    runner = %index,
                    acked = %execution_id,
                    current = %current,
                    "Ack does not match current execution, retiring it"
                );
                self.in_flight.remove(&current);
            }
            slot.complete(Instant::now());
        } else if !self.slots.contains(index) {
            warn!(runner = %index, "Readiness from a runner this host does not own");
            return;
        }

        // Fresh read: the phase may have flipped while we were busy.
        let Some(phase) = self.read_phase().await else {
            self.idle.push(index);
            return;
        };

        match self.deps.queue.pop(phase.queue()).await {
            Ok(Some(job)) => self.dispatch_or_idle(&job, index, phase).await,
            Ok(None) => {
                self.idle.push(index);
                if self.in_flight.is_empty() {
                    self.report_heartbeat().await;
                    self.drain().await;
                }
            }
            Err(e) => {
                warn!(runner = %index, error = %e, "Queue pop failed, treating as empty");
                self.idle.push(index);
            }
        }
    }

    /// The tick driver announced a new phase.
    pub async fn on_phase_changed(&mut self, payload: &str) {
        match payload.parse::<Phase>() {
            Ok(phase) => debug!(%phase, "Phase changed"),
            Err(e) => warn!(payload, error = %e, "Unrecognised phase broadcast"),
        }
        self.drain().await;
    }

    // ── Dispatch ────────────────────────────────────────────────────────

    /// Send `job` to `runner` and arm its deadline.
    pub async fn dispatch(
        &mut self,
        job: &str,
        runner: RunnerIndex,
        phase: Phase,
    ) -> Result<ExecutionId, DispatchError> {
        let Some(slot) = self.slots.get_mut(runner) else {
            return Err(DispatchError::UnknownRunner { index: runner.0 });
        };
        let execution_id = ExecutionId::generate();
        let message = JobMessage::for_phase(phase, execution_id.clone(), job)?;

        if let Some(previous) = slot.current_execution.take() {
            warn!(
                runner = %runner,
                execution_id = %previous,
                "Runner still held an execution, retiring it"
            );
            self.in_flight.remove(&previous);
        }

        let now = Instant::now();
        self.in_flight.insert(
            execution_id.clone(),
            ExecutionRecord {
                runner,
                phase,
                dispatched_at: now,
            },
        );
        let timer = self.timers.arm(
            TimeoutTicket {
                execution_id: execution_id.clone(),
                runner,
                armed_at: now,
            },
            self.guard.deadline,
        );
        slot.begin(execution_id.clone(), now, timer);
        self.idle.remove(runner);

        let channel = runner_channel(&self.host_channel, runner);
        match message.to_json() {
            Ok(body) => {
                if let Err(e) = self.deps.publisher.publish(&channel, &body).await {
                    // The deadline will evict and replace the runner.
                    error!(runner = %runner, error = %e, "Failed to publish job");
                }
            }
            Err(e) => error!(runner = %runner, error = %e, "Failed to encode job"),
        }

        debug!(runner = %runner, execution_id = %execution_id, %phase, "Dispatched");
        Ok(execution_id)
    }

    /// Dispatch, falling back to marking the runner idle when the job is
    /// unusable.
    async fn dispatch_or_idle(&mut self, job: &str, runner: RunnerIndex, phase: Phase) {
        match self.dispatch(job, runner, phase).await {
            Ok(_) => {}
            Err(DispatchError::InvalidJob(e)) => {
                error!(runner = %runner, error = %e, job, "Dropping malformed job");
                self.idle.push(runner);
            }
            Err(e) => error!(runner = %runner, error = %e, "Dispatch failed"),
        }
    }

    // ── Phase drain ─────────────────────────────────────────────────────

    /// Hand queued work to idle runners.
    ///
    /// Safe to call redundantly: with nothing queued it changes nothing.
    /// The phase is re-read before every pop, so a flip mid-drain moves the
    /// remaining pops to the new phase's queue.
    pub async fn drain(&mut self) {
        let Some(phase) = self.read_phase().await else {
            return;
        };
        let queued = match self.deps.queue.length(phase.queue()).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, queue = %phase.queue(), "Queue length failed, skipping drain");
                return;
            }
        };
        if queued == 0 {
            return;
        }

        let idle = self.idle.take();
        debug!(idle = idle.len(), queued, %phase, "Draining idle runners");
        for runner in idle {
            if !self.slots.contains(runner) {
                continue;
            }
            let Some(phase) = self.read_phase().await else {
                continue;
            };
            match self.deps.queue.pop(phase.queue()).await {
                Ok(Some(job)) => self.dispatch_or_idle(&job, runner, phase).await,
                Ok(None) => debug!(runner = %runner, "Queue emptied mid-drain"),
                Err(e) => warn!(runner = %runner, error = %e, "Queue pop failed during drain"),
            }
        }
    }

    async fn read_phase(&self) -> Option<Phase> {
        match self.deps.phase.current().await {
            Ok(Some(phase)) => Some(phase),
            Ok(None) => {
                debug!("No phase published yet");
                None
            }
            Err(e) => {
                warn!(error = %e, "Failed to read phase");
                None
            }
        }
    }

    // ── Timeouts ────────────────────────────────────────────────────────

    /// A deadline passed. Evict the runner if it really never answered.
    pub async fn on_timeout(&mut self, ticket: TimeoutTicket) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(ticket.armed_at);
        debug!(
            runner = %ticket.runner,
            execution_id = %ticket.execution_id,
            in_flight = self.in_flight.contains(&ticket.execution_id),
            elapsed_ms = elapsed.as_millis() as u64,
            "Deadline reached"
        );

        let Some(slot) = self.slots.get(ticket.runner) else {
            return;
        };
        let Some(start) = slot.last_execution_start else {
            return;
        };
        if !self.guard.should_evict(start, slot.last_execution_end, now) {
            return;
        }

        self.evict(ticket, elapsed).await;
    }

    async fn evict(&mut self, ticket: TimeoutTicket, elapsed: std::time::Duration) {
        self.total_timeouts += 1;
        warn!(
            runner = %ticket.runner,
            execution_id = %ticket.execution_id,
            elapsed_ms = elapsed.as_millis() as u64,
            "Runner missed its deadline, replacing"
        );

        if let Some(mut slot) = self.slots.remove(ticket.runner) {
            let pid = slot.runner.pid();
            if let Err(e) = slot.runner.terminate().await {
                warn!(runner = %ticket.runner, ?pid, error = %e, "Kill failed, replacing anyway");
            }
            if let Some(current) = slot.current_execution.take() {
                self.in_flight.remove(&current);
            }
        }
        self.in_flight.remove(&ticket.execution_id);
        self.idle.remove(ticket.runner);

        match self.start_runner().await {
            Ok(index) => info!(old = %ticket.runner, new = %index, "Runner replaced"),
            Err(e) => error!(old = %ticket.runner, error = %e, "Failed to start replacement runner"),
        }

        let elapsed_ms = i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX);
        if let Err(e) = self
            .deps
            .registry
            .increment_by(TOTAL_SCRIPT_EXECUTION_TIME_KEY, elapsed_ms)
            .await
        {
            warn!(error = %e, "Failed to record execution time");
        }
        if let Err(e) = self
            .deps
            .registry
            .increment_by(TOTAL_NUMBER_OF_SCRIPT_EXECUTIONS_KEY, 1)
            .await
        {
            warn!(error = %e, "Failed to record execution count");
        }

        self.report_heartbeat().await;
    }

    // ── Reporting ───────────────────────────────────────────────────────

    pub fn heartbeat_payload(&self) -> Heartbeat {
        Heartbeat {
            id: self.host_id.clone(),
            keep_alive: Utc::now(),
            currently_working_runners: self.in_flight.len(),
            total_completes: self.total_completes,
            total_timeouts: self.total_timeouts,
        }
    }

    pub async fn report_heartbeat(&self) {
        if let Err(e) = self.heartbeat.publish(&self.heartbeat_payload()).await {
            warn!(error = %e, "Failed to publish heartbeat");
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            host_id: self.host_id.clone(),
            runners: self.slots.indices(),
            in_flight: self.in_flight.len(),
            idle: self.idle_runners(),
            total_completes: self.total_completes,
            total_timeouts: self.total_timeouts,
        }
    }

    /// Idle runners that still own a slot, in index order.
    fn idle_runners(&self) -> Vec<RunnerIndex> {
        self.slots
            .indices()
            .into_iter()
            .filter(|i| self.idle.contains(*i))
            .collect()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, execution_id: &ExecutionId) -> bool {
        self.in_flight.contains(execution_id)
    }

    pub fn runner_count(&self) -> usize {
        self.slots.len()
    }

    pub fn has_runner(&self, index: RunnerIndex) -> bool {
        self.slots.contains(index)
    }

    pub fn max_runner_index(&self) -> Option<RunnerIndex> {
        self.slots.max_index()
    }

    /// Current execution of a runner, if it has one.
    pub fn execution_of(&self, index: RunnerIndex) -> Option<&ExecutionId> {
        self.slots.get(index)?.current_execution.as_ref()
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    /// Kill every runner and withdraw this host's heartbeat.
    pub async fn shutdown(&mut self) {
        for mut slot in self.slots.drain() {
            if let Err(e) = slot.runner.terminate().await {
                warn!(runner = %slot.index, error = %e, "Failed to stop runner");
            }
        }
        if let Err(e) = self.heartbeat.withdraw().await {
            warn!(error = %e, "Failed to withdraw heartbeat");
        }
        info!(host = %self.host_id, "Dispatcher shut down");
    }
}

#[cfg(test)]
mod tests;

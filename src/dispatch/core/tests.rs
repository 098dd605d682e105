use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::*;
use crate::bus::keys::{DISPATCHERS_KEY, PHASE_KEY};
use crate::bus::{JobQueue, MemoryBus};
use crate::error::BusError;
use crate::runner::RunnerHandle;

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[derive(Default)]
struct LaunchLog {
    started: Vec<RunnerIndex>,
    terminated: Vec<RunnerIndex>,
}

/// Launcher that records lifecycle calls instead of spawning processes.
#[derive(Clone, Default)]
struct FakeLauncher {
    log: Arc<Mutex<LaunchLog>>,
    fail_kill: bool,
    refuse_start: Arc<AtomicBool>,
}

struct FakeRunner {
    index: RunnerIndex,
    log: Arc<Mutex<LaunchLog>>,
    fail_kill: bool,
}

#[async_trait]
impl RunnerHandle for FakeRunner {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn terminate(&mut self) -> Result<(), RunnerError> {
        self.log.lock().unwrap().terminated.push(self.index);
        if self.fail_kill {
            return Err(RunnerError::TerminateFailed {
                index: self.index.0,
                reason: "no such process".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RunnerLauncher for FakeLauncher {
    async fn start(
        &self,
        _host_channel: &str,
        index: RunnerIndex,
    ) -> Result<Box<dyn RunnerHandle>, RunnerError> {
        if self.refuse_start.load(Ordering::SeqCst) {
            return Err(RunnerError::SpawnFailed {
                index: index.0,
                command: "fake".to_string(),
                reason: "refused".to_string(),
            });
        }
        self.log.lock().unwrap().started.push(index);
        Ok(Box::new(FakeRunner {
            index,
            log: self.log.clone(),
            fail_kill: self.fail_kill,
        }))
    }
}

/// Phase source that replays a script of answers, repeating the last one.
struct ScriptedPhase {
    answers: Mutex<VecDeque<Phase>>,
}

impl ScriptedPhase {
    fn new(answers: &[Phase]) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.iter().copied().collect()),
        })
    }
}

#[async_trait]
impl PhaseSource for ScriptedPhase {
    async fn current(&self) -> Result<Option<Phase>, BusError> {
        let mut answers = self.answers.lock().unwrap();
        if answers.len() > 1 {
            Ok(answers.pop_front())
        } else {
            Ok(answers.front().copied())
        }
    }
}

struct Harness {
    core: DispatchCore,
    bus: Arc<MemoryBus>,
    launcher: FakeLauncher,
    timeouts: mpsc::UnboundedReceiver<TimeoutTicket>,
}

impl Harness {
    async fn new(runners: usize) -> Self {
        Self::build(runners, FakeLauncher::default(), None).await
    }

    async fn build(
        runners: usize,
        launcher: FakeLauncher,
        phase: Option<Arc<dyn PhaseSource>>,
    ) -> Self {
        let bus = MemoryBus::new();
        bus.set(PHASE_KEY, "ScriptPhase").await.unwrap();

        let mut deps = DispatchDeps::from_bus(bus.clone(), Arc::new(launcher.clone()));
        if let Some(phase) = phase {
            deps.phase = phase;
        }
        let (timers, timeouts) = Timers::new();
        let mut core = DispatchCore::new("host-a", deps, TimeoutGuard::default(), timers, runners);
        core.start_runners().await.unwrap();

        Self {
            core,
            bus,
            launcher,
            timeouts,
        }
    }

    async fn ready(&mut self, message: &str) {
        self.core.handle_inbox(message).await;
    }

    async fn push_script(&self, player_id: &str) {
        let job = format!(r#"{{"playerId":"{player_id}","script":"move()"}}"#);
        self.bus.push(JobQueue::Scripts, &job).await.unwrap();
    }

    /// Job messages published to `runner`, decoded.
    async fn jobs_for(&self, runner: u32) -> Vec<JobMessage> {
        let channel = runner_channel(self.core.host_channel(), RunnerIndex(runner));
        self.bus
            .published_on(&channel)
            .await
            .iter()
            .map(|raw| serde_json::from_str(raw).unwrap())
            .collect()
    }

    /// Dispatch a script job to `runner` through a plain readiness message.
    async fn busy(&mut self, runner: u32) -> ExecutionId {
        self.push_script(&format!("p{runner}")).await;
        self.ready(&format!("ready:{runner}")).await;
        self.core
            .execution_of(RunnerIndex(runner))
            .cloned()
            .expect("runner should have been dispatched")
    }

    async fn heartbeat(&self) -> Option<serde_json::Value> {
        self.bus
            .hget(DISPATCHERS_KEY, "host-a")
            .await
            .unwrap()
            .map(|raw| serde_json::from_str(&raw).unwrap())
    }

    fn launched(&self) -> Vec<RunnerIndex> {
        self.launcher.log.lock().unwrap().started.clone()
    }

    fn terminated(&self) -> Vec<RunnerIndex> {
        self.launcher.log.lock().unwrap().terminated.clone()
    }
}

#[tokio::test(start_paused = true)]
async fn starts_one_runner_per_slot() {
    let h = Harness::new(4).await;
    assert_eq!(h.core.runner_count(), 4);
    assert_eq!(
        h.launched(),
        vec![RunnerIndex(0), RunnerIndex(1), RunnerIndex(2), RunnerIndex(3)]
    );
    assert_eq!(h.core.max_runner_index(), Some(RunnerIndex(3)));
}

#[tokio::test(start_paused = true)]
async fn ready_with_empty_queue_marks_idle_without_heartbeat_while_busy() {
    let mut h = Harness::new(3).await;
    h.busy(0).await;

    h.ready("ready:2").await;

    assert!(h.core.idle.contains(RunnerIndex(2)));
    assert!(h.jobs_for(2).await.is_empty());
    assert_eq!(h.core.in_flight_len(), 1);
    assert!(h.heartbeat().await.is_none(), "host still busy, no heartbeat");
}

#[tokio::test(start_paused = true)]
async fn ready_when_fully_idle_reports_heartbeat() {
    let mut h = Harness::new(3).await;

    h.ready("ready:2").await;

    assert_eq!(h.core.stats().idle, vec![RunnerIndex(2)]);
    let beat = h.heartbeat().await.expect("heartbeat after draining");
    assert_eq!(beat["id"], "host-a");
    assert_eq!(beat["currentlyWorkingRunners"], 0);
}

#[tokio::test(start_paused = true)]
async fn ack_removes_execution_and_dispatches_next_job() {
    let mut h = Harness::new(3).await;
    let acked = ExecutionId::from("abc-123");
    let now = Instant::now();
    h.core.in_flight.insert(
        acked.clone(),
        ExecutionRecord {
            runner: RunnerIndex(2),
            phase: Phase::ScriptPhase,
            dispatched_at: now,
        },
    );
    let timer = h.core.timers.arm(
        TimeoutTicket {
            execution_id: acked.clone(),
            runner: RunnerIndex(2),
            armed_at: now,
        },
        ms(400),
    );
    h.core
        .slots
        .get_mut(RunnerIndex(2))
        .unwrap()
        .begin(acked.clone(), now, timer);
    h.push_script("p7").await;

    tokio::time::advance(ms(50)).await;
    h.ready("ready:2:abc-123").await;

    assert!(!h.core.is_in_flight(&acked));
    assert_eq!(h.core.stats().total_completes, 1);
    assert_eq!(h.bus.length(JobQueue::Scripts).await.unwrap(), 0);

    let jobs = h.jobs_for(2).await;
    assert_eq!(jobs.len(), 1);
    let JobMessage::ScriptExecution {
        execution_id,
        payload,
    } = &jobs[0]
    else {
        panic!("expected a script job, got {:?}", jobs[0]);
    };
    assert_ne!(execution_id, &acked);
    assert_eq!(payload.get("playerId"), Some(&serde_json::json!("p7")));
    assert!(h.core.is_in_flight(execution_id));
    assert_eq!(h.core.in_flight_len(), 1);
}

#[tokio::test(start_paused = true)]
async fn ack_within_deadline_cancels_timer() {
    let mut h = Harness::new(2).await;
    let id = h.busy(0).await;

    tokio::time::advance(ms(100)).await;
    h.ready(&format!("ready:0:{id}")).await;

    let fired = tokio::time::timeout(ms(1000), h.timeouts.recv()).await;
    assert!(fired.is_err(), "timer must have been cancelled");
    let stats = h.core.stats();
    assert_eq!(stats.total_timeouts, 0);
    assert_eq!(stats.runners, vec![RunnerIndex(0), RunnerIndex(1)]);
    assert!(h.terminated().is_empty());
}

#[tokio::test(start_paused = true)]
async fn missed_deadline_evicts_exactly_once() {
    let mut h = Harness::new(2).await;
    let id = h.busy(0).await;

    let ticket = h.timeouts.recv().await.unwrap();
    assert_eq!(ticket.execution_id, id);
    h.core.on_timeout(ticket.clone()).await;

    let stats = h.core.stats();
    assert_eq!(stats.total_timeouts, 1);
    assert_eq!(stats.runners, vec![RunnerIndex(1), RunnerIndex(2)]);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(h.terminated(), vec![RunnerIndex(0)]);
    let total_ms: i64 = h
        .bus
        .get(TOTAL_SCRIPT_EXECUTION_TIME_KEY)
        .await
        .unwrap()
        .unwrap()
        .parse()
        .unwrap();
    assert!(total_ms >= 400, "recorded {total_ms}ms");
    assert_eq!(
        h.bus
            .get(TOTAL_NUMBER_OF_SCRIPT_EXECUTIONS_KEY)
            .await
            .unwrap()
            .as_deref(),
        Some("1")
    );
    assert_eq!(h.heartbeat().await.unwrap()["totalTimeouts"], 1);

    // A duplicate firing finds no slot and changes nothing.
    h.core.on_timeout(ticket).await;
    let again = h.core.stats();
    assert_eq!(again.total_timeouts, 1);
    assert_eq!(again.runners, vec![RunnerIndex(1), RunnerIndex(2)]);
    assert_eq!(h.launched().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn late_ack_after_eviction_leaves_replacement_alone() {
    let mut h = Harness::new(1).await;
    let id = h.busy(0).await;
    let ticket = h.timeouts.recv().await.unwrap();
    h.core.on_timeout(ticket).await;
    assert!(h.core.has_runner(RunnerIndex(1)));

    h.push_script("waiting").await;
    let published = h.bus.published_count().await;
    h.ready(&format!("ready:0:{id}")).await;

    assert!(!h.core.has_runner(RunnerIndex(0)));
    assert_eq!(h.core.execution_of(RunnerIndex(1)), None);
    assert!(h.core.stats().idle.is_empty());
    assert_eq!(h.bus.published_count().await, published);
    assert_eq!(h.bus.length(JobQueue::Scripts).await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn ack_racing_the_timer_prevents_eviction() {
    let mut h = Harness::new(1).await;
    let id = h.busy(0).await;

    // The timer fires, but the ack is handled before its ticket.
    let ticket = h.timeouts.recv().await.unwrap();
    h.ready(&format!("ready:0:{id}")).await;
    h.core.on_timeout(ticket).await;

    assert_eq!(h.core.stats().total_timeouts, 0);
    assert!(h.core.has_runner(RunnerIndex(0)));
    assert!(h.terminated().is_empty());
}

#[tokio::test(start_paused = true)]
async fn guard_band_ignores_early_ticket() {
    let mut h = Harness::new(1).await;
    let id = h.busy(0).await;
    let armed_at = Instant::now();

    tokio::time::advance(ms(200)).await;
    h.core
        .on_timeout(TimeoutTicket {
            execution_id: id.clone(),
            runner: RunnerIndex(0),
            armed_at,
        })
        .await;

    assert_eq!(h.core.stats().total_timeouts, 0);
    assert!(h.core.is_in_flight(&id));
}

#[tokio::test(start_paused = true)]
async fn failed_kill_still_replaces_runner() {
    let launcher = FakeLauncher {
        fail_kill: true,
        ..FakeLauncher::default()
    };
    let mut h = Harness::build(1, launcher, None).await;
    h.busy(0).await;

    let ticket = h.timeouts.recv().await.unwrap();
    h.core.on_timeout(ticket).await;

    assert_eq!(h.terminated(), vec![RunnerIndex(0)]);
    assert_eq!(h.core.stats().runners, vec![RunnerIndex(1)]);
}

#[tokio::test(start_paused = true)]
async fn failed_replacement_is_replenished_later() {
    let launcher = FakeLauncher::default();
    let refuse = launcher.refuse_start.clone();
    let mut h = Harness::build(2, launcher, None).await;
    h.busy(0).await;

    refuse.store(true, Ordering::SeqCst);
    let ticket = h.timeouts.recv().await.unwrap();
    h.core.on_timeout(ticket).await;
    assert_eq!(h.core.runner_count(), 1);

    refuse.store(false, Ordering::SeqCst);
    h.core.replenish_runners().await;
    assert_eq!(h.core.runner_count(), 2);
    // The refused index is burned; the next one is fresh.
    assert_eq!(h.core.stats().runners, vec![RunnerIndex(1), RunnerIndex(3)]);
}

#[tokio::test(start_paused = true)]
async fn drain_dispatches_one_job_per_idle_runner_until_queue_empties() {
    let mut h = Harness::new(3).await;
    for runner in 0..3 {
        h.ready(&format!("ready:{runner}")).await;
    }
    assert_eq!(h.core.stats().idle.len(), 3);

    h.push_script("a").await;
    h.push_script("b").await;
    h.core
        .handle_message(BusMessage::new(PHASE_CHANGED_CHANNEL, "ScriptPhase"))
        .await;

    let mut dispatched = 0;
    for runner in 0..3 {
        dispatched += h.jobs_for(runner).await.len();
    }
    assert_eq!(dispatched, 2);
    assert_eq!(h.core.in_flight_len(), 2);
    assert!(h.core.stats().idle.is_empty());
    let unassigned = (0..3)
        .filter(|r| h.core.execution_of(RunnerIndex(*r)).is_none())
        .count();
    assert_eq!(unassigned, 1);
}

#[tokio::test(start_paused = true)]
async fn drain_with_nothing_queued_keeps_idle_runners() {
    let mut h = Harness::new(2).await;
    h.ready("ready:0").await;
    h.ready("ready:1").await;

    h.core.on_phase_changed("ResultProcessingPhase").await;

    assert_eq!(h.core.stats().idle, vec![RunnerIndex(0), RunnerIndex(1)]);
    assert_eq!(h.core.in_flight_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn pop_uses_phase_read_at_pop_time() {
    let mut h = Harness::new(1).await;
    h.push_script("stale").await;
    h.bus.push(JobQueue::Maps, "intent-1").await.unwrap();

    // The flip lands after the readiness message was published.
    h.bus.set(PHASE_KEY, "ResultProcessingPhase").await.unwrap();
    h.ready("ready:0").await;

    let jobs = h.jobs_for(0).await;
    assert!(matches!(
        &jobs[..],
        [JobMessage::IntentExecution { payload, .. }] if payload == "intent-1"
    ));
    assert_eq!(h.bus.length(JobQueue::Scripts).await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn drain_can_mix_phases_when_phase_flips_mid_drain() {
    // Length check and first pop see ScriptPhase, the second pop sees the flip.
    let phase: Arc<dyn PhaseSource> = ScriptedPhase::new(&[
        Phase::ScriptPhase,
        Phase::ScriptPhase,
        Phase::ResultProcessingPhase,
    ]);
    let mut h = Harness::build(2, FakeLauncher::default(), Some(phase)).await;
    h.core.idle.push(RunnerIndex(0));
    h.core.idle.push(RunnerIndex(1));
    h.push_script("p").await;
    h.bus.push(JobQueue::Maps, "intent").await.unwrap();

    h.core.drain().await;

    assert!(matches!(
        &h.jobs_for(0).await[..],
        [JobMessage::ScriptExecution { .. }]
    ));
    assert!(matches!(
        &h.jobs_for(1).await[..],
        [JobMessage::IntentExecution { .. }]
    ));
    assert!(h.core.stats().idle.is_empty());
}

#[tokio::test(start_paused = true)]
async fn malformed_and_foreign_messages_are_ignored() {
    let mut h = Harness::new(1).await;
    h.push_script("p").await;

    h.ready("").await;
    h.ready("hello:0").await;
    h.ready("ready:zero").await;
    h.ready("ready:9").await;

    assert_eq!(h.bus.published_count().await, 0);
    assert_eq!(h.bus.length(JobQueue::Scripts).await.unwrap(), 1);
    assert!(h.core.stats().idle.is_empty());
}

#[tokio::test(start_paused = true)]
async fn malformed_script_job_leaves_runner_idle() {
    let mut h = Harness::new(1).await;
    h.bus.push(JobQueue::Scripts, "not a player").await.unwrap();

    h.ready("ready:0").await;

    assert_eq!(h.core.in_flight_len(), 0);
    assert_eq!(h.core.stats().idle, vec![RunnerIndex(0)]);
    assert!(h.jobs_for(0).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn script_job_without_player_id_is_dispatched() {
    let mut h = Harness::new(1).await;
    let job = r#"{"_id":"5f1","name":"alice","position":[1,2]}"#;
    h.bus.push(JobQueue::Scripts, job).await.unwrap();

    h.ready("ready:0").await;

    let jobs = h.jobs_for(0).await;
    let [JobMessage::ScriptExecution { payload, .. }] = &jobs[..] else {
        panic!("expected one script job, got {jobs:?}");
    };
    assert_eq!(payload.get("_id"), Some(&serde_json::json!("5f1")));
    assert_eq!(h.core.in_flight_len(), 1);
    assert!(h.core.stats().idle.is_empty());
}

#[tokio::test(start_paused = true)]
async fn unknown_ack_retires_current_execution() {
    let mut h = Harness::new(1).await;
    let first = h.busy(0).await;
    h.push_script("next").await;

    h.ready("ready:0:not-a-real-id").await;

    assert!(!h.core.is_in_flight(&first));
    assert_eq!(h.core.in_flight_len(), 1);
    let current = h.core.execution_of(RunnerIndex(0)).cloned().unwrap();
    assert_ne!(current, first);
    assert!(h.core.is_in_flight(&current));

    // The new execution still has a live deadline.
    let ticket = h.timeouts.recv().await.unwrap();
    assert_eq!(ticket.execution_id, current);
    h.core.on_timeout(ticket).await;
    assert_eq!(h.core.in_flight_len(), 0);
    assert_eq!(h.core.stats().total_timeouts, 1);
}

#[tokio::test(start_paused = true)]
async fn stale_ack_after_redispatch_keeps_one_record_per_runner() {
    let mut h = Harness::new(1).await;
    let first = h.busy(0).await;
    let second = h.busy(0).await;
    h.push_script("third").await;

    h.ready(&format!("ready:0:{first}")).await;

    assert!(!h.core.is_in_flight(&first));
    assert!(!h.core.is_in_flight(&second));
    assert_eq!(h.core.in_flight_len(), 1);
    assert!(h.core.in_flight_len() <= h.core.runner_count());

    let third = h.core.execution_of(RunnerIndex(0)).cloned().unwrap();
    h.ready(&format!("ready:0:{third}")).await;
    assert_eq!(h.core.in_flight_len(), 0);
    assert_eq!(h.core.stats().idle, vec![RunnerIndex(0)]);
}

#[tokio::test(start_paused = true)]
async fn redispatch_retires_outstanding_execution() {
    let mut h = Harness::new(1).await;
    let first = h.busy(0).await;

    let second = h.busy(0).await;

    assert_ne!(first, second);
    assert!(!h.core.is_in_flight(&first));
    assert!(h.core.is_in_flight(&second));
    assert_eq!(h.core.in_flight_len(), 1);
}

#[tokio::test(start_paused = true)]
async fn in_flight_never_exceeds_runner_count() {
    let mut h = Harness::new(3).await;
    for i in 0..20 {
        h.push_script(&format!("p{i}")).await;
    }

    for round in 0..6 {
        for runner in h.core.stats().runners {
            match h.core.execution_of(runner).cloned() {
                // Every third round the runners stay silent and time out.
                Some(_) if round % 3 == 2 => {}
                Some(id) => h.ready(&format!("ready:{runner}:{id}")).await,
                None => h.ready(&format!("ready:{runner}")).await,
            }
            assert!(h.core.in_flight_len() <= h.core.runner_count());
        }
        if round % 3 == 2 {
            while h.core.in_flight_len() > 0 {
                let ticket = h.timeouts.recv().await.unwrap();
                h.core.on_timeout(ticket).await;
                assert!(h.core.in_flight_len() <= h.core.runner_count());
            }
        }
    }
    assert!(h.core.stats().total_timeouts >= 1);
    assert_eq!(h.core.runner_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_runners_and_withdraws_heartbeat() {
    let mut h = Harness::new(2).await;
    h.core.report_heartbeat().await;
    assert!(h.heartbeat().await.is_some());

    h.core.shutdown().await;

    assert_eq!(h.terminated(), vec![RunnerIndex(0), RunnerIndex(1)]);
    assert_eq!(h.core.runner_count(), 0);
    assert!(h.heartbeat().await.is_none());
}

//! Well-known queue, registry and channel names.

use std::fmt;

/// Registry key holding the current tick phase as text.
pub const PHASE_KEY: &str = "Phase";

/// Registry hash of host id → JSON heartbeat.
pub const DISPATCHERS_KEY: &str = "DispatchersKey";

/// Cumulative milliseconds spent in timed-out executions.
pub const TOTAL_SCRIPT_EXECUTION_TIME_KEY: &str = "TotalScriptExecutionTimeKey";

/// Cumulative count of timed-out executions.
pub const TOTAL_NUMBER_OF_SCRIPT_EXECUTIONS_KEY: &str = "TotalNumberOfScriptExecutionsKey";

/// Global broadcast of the new phase name.
pub const PHASE_CHANGED_CHANNEL: &str = "PhaseChangedChannel";

/// The two shared job queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobQueue {
    /// Player records awaiting script execution.
    Scripts,
    /// Serialized intents awaiting resolution.
    Maps,
}

impl JobQueue {
    pub fn key(&self) -> &'static str {
        match self {
            Self::Scripts => "ScriptsToProcess",
            Self::Maps => "MapsToProcess",
        }
    }
}

impl fmt::Display for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Private inbox of a host: `<hostId>@hosts`.
pub fn host_channel(host_id: &str) -> String {
    format!("{host_id}@hosts")
}

/// Per-runner outbox: `<hostId>@hosts:<runnerIndex>`.
pub fn runner_channel(host_channel: &str, index: impl fmt::Display) -> String {
    format!("{host_channel}:{index}")
}

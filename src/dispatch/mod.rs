//! Dispatcher host: owns a pool of runners and feeds them jobs from the
//! shared queues.
//!
//! `DispatchCore` holds every piece of state and reacts to one event at a
//! time. `DispatcherHost` is the event loop that feeds it bus messages,
//! expired deadlines and heartbeat ticks.

pub mod core;
pub mod executions;
pub mod heartbeat;
pub mod host;
pub mod message;
pub mod phase;
pub mod slot;
pub mod timer;

pub use self::core::{DispatchCore, DispatchDeps, DispatcherStats};
pub use heartbeat::Heartbeat;
pub use host::DispatcherHost;
pub use message::{ExecutionId, JobMessage, RunnerIndex, RunnerMessage};
pub use phase::{Phase, PhaseSource, RegistryPhase};
pub use timer::TimeoutGuard;

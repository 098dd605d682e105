//! Runner processes, the workers that execute scripts and intents.
//!
//! The dispatcher never touches a runner's internals. It starts one through a
//! `RunnerLauncher`, talks to it over the bus, and kills it through its
//! `RunnerHandle` when it misses a deadline.

pub mod process;

use async_trait::async_trait;

use crate::dispatch::message::RunnerIndex;
use crate::error::RunnerError;

pub use process::ProcessLauncher;

/// A started runner.
#[async_trait]
pub trait RunnerHandle: Send + Sync {
    /// OS process id, if the runner is a process and still known.
    fn pid(&self) -> Option<u32>;

    /// Forcefully stop the runner. No graceful negotiation.
    async fn terminate(&mut self) -> Result<(), RunnerError>;
}

/// Starts runners for a host.
#[async_trait]
pub trait RunnerLauncher: Send + Sync {
    /// Start a runner that reports readiness on `host_channel` as `index`.
    async fn start(
        &self,
        host_channel: &str,
        index: RunnerIndex,
    ) -> Result<Box<dyn RunnerHandle>, RunnerError>;
}

//! OS-process runners spawned with `tokio::process`.

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use super::{RunnerHandle, RunnerLauncher};
use crate::dispatch::message::RunnerIndex;
use crate::error::RunnerError;

/// Launches one child process per runner.
///
/// The child inherits the host environment with `REDIS_URL` pointed at the
/// bus endpoint, and gets `[<hostChannel>, <index>]` as arguments.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    command: String,
    redis_url: String,
}

impl ProcessLauncher {
    pub fn new(command: impl Into<String>, redis_url: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            redis_url: redis_url.into(),
        }
    }

    fn command_for(&self, host_channel: &str, index: RunnerIndex) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.arg(host_channel)
            .arg(index.to_string())
            .env("REDIS_URL", &self.redis_url)
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RunnerLauncher for ProcessLauncher {
    async fn start(
        &self,
        host_channel: &str,
        index: RunnerIndex,
    ) -> Result<Box<dyn RunnerHandle>, RunnerError> {
        let child = self
            .command_for(host_channel, index)
            .spawn()
            .map_err(|e| RunnerError::SpawnFailed {
                index: index.0,
                command: self.command.clone(),
                reason: e.to_string(),
            })?;
        info!(runner = %index, pid = ?child.id(), "Runner started");
        Ok(Box::new(ProcessRunner { index, child }))
    }
}

/// Handle to a spawned runner process.
pub struct ProcessRunner {
    index: RunnerIndex,
    child: Child,
}

#[async_trait]
impl RunnerHandle for ProcessRunner {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn terminate(&mut self) -> Result<(), RunnerError> {
        // Send the kill and move on; reaping happens in the background via
        // tokio's orphan queue once the handle is dropped.
        let result = self
            .child
            .start_kill()
            .map_err(|e| RunnerError::TerminateFailed {
                index: self.index.0,
                reason: e.to_string(),
            });
        debug!(runner = %self.index, ok = result.is_ok(), "Kill sent");
        result
    }
}

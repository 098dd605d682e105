//! Wire formats between the host and its runners.
//!
//! Inbound (runner → host inbox) is plain text: `ready:<index>` or
//! `ready:<index>:<executionId>`. Outbound (host → runner channel) is JSON:
//! `{"type": ..., "executionId": ..., "payload": ...}`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::phase::Phase;
use crate::error::MessageError;

/// Key of a runner slot. Never reused once its runner is replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunnerIndex(pub u32);

impl fmt::Display for RunnerIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunnerIndex {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse()
            .map(Self)
            .map_err(|_| MessageError::InvalidRunnerIndex(s.to_string()))
    }
}

/// Identifier of one dispatched job. Opaque on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    /// A fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ExecutionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message a runner sends to its host's inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerMessage {
    /// The runner wants work, optionally acknowledging the job it finished.
    Ready {
        index: RunnerIndex,
        completed: Option<ExecutionId>,
    },
}

impl FromStr for RunnerMessage {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(MessageError::Empty);
        }
        // Execution ids may themselves contain ':', so split at most twice.
        let mut parts = s.splitn(3, ':');
        let kind = parts.next().unwrap_or_default();
        match kind {
            "ready" => {
                let index = parts
                    .next()
                    .ok_or_else(|| MessageError::InvalidRunnerIndex(String::new()))?
                    .parse()?;
                let completed = parts
                    .next()
                    .filter(|id| !id.is_empty())
                    .map(ExecutionId::from);
                Ok(Self::Ready { index, completed })
            }
            other => Err(MessageError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for RunnerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready {
                index,
                completed: None,
            } => write!(f, "ready:{index}"),
            Self::Ready {
                index,
                completed: Some(id),
            } => write!(f, "ready:{index}:{id}"),
        }
    }
}

/// Player document handed to a runner for script execution.
///
/// Any JSON object is accepted; the host never looks inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerRecord(serde_json::Map<String, serde_json::Value>);

impl PlayerRecord {
    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.0.get(field)
    }
}

/// Job sent to a runner's private channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum JobMessage {
    ScriptExecution {
        execution_id: ExecutionId,
        payload: PlayerRecord,
    },
    IntentExecution {
        execution_id: ExecutionId,
        payload: String,
    },
}

impl JobMessage {
    /// Build the message for a raw queue item popped during `phase`.
    ///
    /// Script jobs must be a JSON object; intent jobs are passed through
    /// verbatim.
    pub fn for_phase(
        phase: Phase,
        execution_id: ExecutionId,
        raw: &str,
    ) -> Result<Self, MessageError> {
        match phase {
            Phase::ScriptPhase => Ok(Self::ScriptExecution {
                execution_id,
                payload: serde_json::from_str(raw)?,
            }),
            Phase::ResultProcessingPhase => Ok(Self::IntentExecution {
                execution_id,
                payload: raw.to_string(),
            }),
        }
    }

    pub fn to_json(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }
}

//! Tick phase and the accessor that reads it.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::bus::keys::PHASE_KEY;
use crate::bus::{JobQueue, Registry};
use crate::error::{BusError, MessageError};

/// Global tick stage, owned by the external tick driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Executing player scripts.
    ScriptPhase,
    /// Resolving the intents those scripts produced.
    ResultProcessingPhase,
}

impl Phase {
    /// Queue that feeds this phase.
    pub fn queue(&self) -> JobQueue {
        match self {
            Self::ScriptPhase => JobQueue::Scripts,
            Self::ResultProcessingPhase => JobQueue::Maps,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScriptPhase => "ScriptPhase",
            Self::ResultProcessingPhase => "ResultProcessingPhase",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "ScriptPhase" => Ok(Self::ScriptPhase),
            "ResultProcessingPhase" => Ok(Self::ResultProcessingPhase),
            other => Err(MessageError::UnknownPhase(other.to_string())),
        }
    }
}

/// Read access to the current phase.
///
/// Implementations must fetch the value on every call. Callers re-read it
/// after any await instead of holding on to an earlier answer, because the
/// tick driver may flip it at any moment.
#[async_trait]
pub trait PhaseSource: Send + Sync {
    /// `Ok(None)` when no phase has been published yet.
    async fn current(&self) -> Result<Option<Phase>, BusError>;
}

/// Phase stored as text under the registry's `Phase` key.
pub struct RegistryPhase {
    registry: Arc<dyn Registry>,
}

impl RegistryPhase {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl PhaseSource for RegistryPhase {
    async fn current(&self) -> Result<Option<Phase>, BusError> {
        let Some(raw) = self.registry.get(PHASE_KEY).await? else {
            return Ok(None);
        };
        match raw.parse() {
            Ok(phase) => Ok(Some(phase)),
            Err(e) => {
                tracing::warn!(value = %raw, error = %e, "Ignoring unrecognised phase");
                Ok(None)
            }
        }
    }
}

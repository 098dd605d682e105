//! Host liveness reports in the shared registry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bus::Registry;
use crate::bus::keys::DISPATCHERS_KEY;
use crate::error::BusError;

/// Payload stored under `DispatchersKey[<hostId>]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub id: String,
    pub keep_alive: DateTime<Utc>,
    pub currently_working_runners: usize,
    pub total_completes: u64,
    pub total_timeouts: u64,
}

/// Writes this host's heartbeat. Advisory only; dispatch never reads it.
pub struct HeartbeatReporter {
    registry: Arc<dyn Registry>,
    host_id: String,
}

impl HeartbeatReporter {
    pub fn new(registry: Arc<dyn Registry>, host_id: impl Into<String>) -> Self {
        Self {
            registry,
            host_id: host_id.into(),
        }
    }

    pub async fn publish(&self, heartbeat: &Heartbeat) -> Result<(), BusError> {
        let payload = serde_json::to_string(heartbeat)?;
        self.registry
            .hset(DISPATCHERS_KEY, &self.host_id, &payload)
            .await
    }

    /// Remove this host's entry (clean shutdown).
    pub async fn withdraw(&self) -> Result<(), BusError> {
        self.registry.hdel(DISPATCHERS_KEY, &self.host_id).await
    }
}

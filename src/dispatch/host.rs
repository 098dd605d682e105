//! The per-host event loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use uuid::Uuid;

use super::core::{DispatchCore, DispatchDeps, DispatcherStats};
use super::timer::{TimeoutGuard, TimeoutTicket, Timers};
use crate::bus::keys::PHASE_CHANGED_CHANNEL;
use crate::bus::{Bus, Subscriber};
use crate::config::DispatcherConfig;
use crate::error::{ConfigError, DispatchError, Error};
use crate::runner::RunnerLauncher;

/// Runs one `DispatchCore` until shutdown.
///
/// Bus messages, expired deadlines and heartbeat ticks are handled strictly
/// one after another.
pub struct DispatcherHost {
    core: DispatchCore,
    subscriber: Arc<dyn Subscriber>,
    timeouts: mpsc::UnboundedReceiver<TimeoutTicket>,
    heartbeat_interval: Duration,
    stats_tx: watch::Sender<DispatcherStats>,
}

impl DispatcherHost {
    pub fn new(
        host_id: impl Into<String>,
        deps: DispatchDeps,
        subscriber: Arc<dyn Subscriber>,
        guard: TimeoutGuard,
        runner_count: usize,
        heartbeat_interval: Duration,
    ) -> Self {
        let (timers, timeouts) = Timers::new();
        let core = DispatchCore::new(host_id, deps, guard, timers, runner_count);
        let (stats_tx, _) = watch::channel(core.stats());
        Self {
            core,
            subscriber,
            timeouts,
            heartbeat_interval,
            stats_tx,
        }
    }

    /// Build a host with a fresh id, wired entirely to `bus`.
    pub fn from_config<B: Bus + 'static>(
        config: &DispatcherConfig,
        bus: Arc<B>,
        launcher: Arc<dyn RunnerLauncher>,
    ) -> Self {
        let deps = DispatchDeps::from_bus(bus.clone(), launcher);
        Self::new(
            Uuid::new_v4().to_string(),
            deps,
            bus,
            TimeoutGuard::new(config.execution_timeout, config.timeout_guard),
            config.runner_count,
            config.heartbeat_interval,
        )
    }

    pub fn host_id(&self) -> &str {
        self.core.host_id()
    }

    pub fn host_channel(&self) -> &str {
        self.core.host_channel()
    }

    /// Live view of the host, updated after every event.
    pub fn stats(&self) -> watch::Receiver<DispatcherStats> {
        self.stats_tx.subscribe()
    }

    /// Subscribe, start the runner pool and process events until `shutdown`
    /// resolves or the subscription ends. Runners are stopped on the way out.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<(), Error> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "SCRIPTER_HEARTBEAT_INTERVAL_MS".to_string(),
                message: "must be greater than 0".to_string(),
            }
            .into());
        }
        let channels = [
            self.core.host_channel().to_string(),
            PHASE_CHANGED_CHANNEL.to_string(),
        ];
        let mut messages = self.subscriber.subscribe(&channels).await?;
        info!(
            host = %self.core.host_id(),
            channel = %self.core.host_channel(),
            "Dispatcher subscribed"
        );

        self.core.report_heartbeat().await;
        if let Err(e) = self.core.start_runners().await {
            self.core.shutdown().await;
            return Err(e.into());
        }
        self.publish_stats();

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        // First tick completes immediately.
        heartbeat.tick().await;
        tokio::pin!(shutdown);

        let outcome = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(host = %self.core.host_id(), "Shutdown requested");
                    break Ok(());
                }
                message = messages.next() => match message {
                    Some(message) => self.core.handle_message(message).await,
                    None => break Err(DispatchError::SubscriptionClosed.into()),
                },
                Some(ticket) = self.timeouts.recv() => self.core.on_timeout(ticket).await,
                _ = heartbeat.tick() => {
                    debug!(host = %self.core.host_id(), "Heartbeat tick");
                    self.core.replenish_runners().await;
                    self.core.report_heartbeat().await;
                }
            }
            self.publish_stats();
        };

        self.core.shutdown().await;
        self.publish_stats();
        outcome
    }

    fn publish_stats(&self) {
        self.stats_tx.send_replace(self.core.stats());
    }
}

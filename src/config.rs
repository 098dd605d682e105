//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Default bus endpoint used when `REDIS_URL` is unset.
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Dispatcher host configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Whether the host runs in production mode (no local override file).
    pub production: bool,
    /// Endpoint of the shared queue / registry / pub-sub service.
    pub redis_url: String,
    /// Executable started once per runner slot.
    pub runner_command: String,
    /// Number of runner processes started at boot.
    pub runner_count: usize,
    /// Deadline for a runner to acknowledge a job.
    pub execution_timeout: Duration,
    /// Guard band subtracted from the deadline before evicting.
    pub timeout_guard: Duration,
    /// Interval between periodic heartbeats.
    pub heartbeat_interval: Duration,
    /// Port for the HTTP status endpoint (disabled when `None`).
    pub status_port: Option<u16>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            production: false,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            runner_command: "scripter-runner".to_string(),
            runner_count: available_cores(),
            execution_timeout: Duration::from_millis(400),
            timeout_guard: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(5000),
            status_port: None,
        }
    }
}

impl DispatcherConfig {
    /// Build the configuration from the process environment.
    ///
    /// Outside production a local `.env` file, when present, is loaded first
    /// so its values override nothing already set in the real environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let production = is_production(std::env::var("SCRIPTER_ENV").ok().as_deref());
        if !production {
            match dotenvy::dotenv() {
                Ok(path) => tracing::debug!(path = %path.display(), "Loaded local overrides"),
                Err(e) if e.not_found() => {}
                Err(e) => return Err(ConfigError::OverrideFile(e.to_string())),
            }
        }

        let defaults = Self::default();
        let config = Self {
            production,
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            runner_command: std::env::var("SCRIPTER_RUNNER_CMD")
                .unwrap_or(defaults.runner_command),
            runner_count: parse_var("SCRIPTER_RUNNER_COUNT")?.unwrap_or(defaults.runner_count),
            execution_timeout: parse_var("SCRIPTER_EXECUTION_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.execution_timeout),
            timeout_guard: parse_var("SCRIPTER_TIMEOUT_GUARD_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout_guard),
            heartbeat_interval: parse_var("SCRIPTER_HEARTBEAT_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.heartbeat_interval),
            status_port: parse_var("SCRIPTER_STATUS_PORT")?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the host cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runner_count == 0 {
            return Err(invalid("SCRIPTER_RUNNER_COUNT", "must be at least 1"));
        }
        if self.execution_timeout.is_zero() {
            return Err(invalid("SCRIPTER_EXECUTION_TIMEOUT_MS", "must be greater than 0"));
        }
        if self.timeout_guard >= self.execution_timeout {
            return Err(invalid(
                "SCRIPTER_TIMEOUT_GUARD_MS",
                "must be shorter than the execution timeout",
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(invalid("SCRIPTER_HEARTBEAT_INTERVAL_MS", "must be greater than 0"));
        }
        Ok(())
    }

    /// Default `tracing` filter directive for this mode.
    pub fn default_log_filter(&self) -> &'static str {
        if self.production { "info" } else { "debug" }
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn is_production(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case("production"))
}

fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn parse_var<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw).map(Some),
        Err(_) => Ok(None),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?}: {e}"),
    })
}

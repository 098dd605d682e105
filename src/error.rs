//! Error types for the dispatcher host.

/// Top-level error type for the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load override file: {0}")]
    OverrideFile(String),
}

/// Errors talking to the shared queue, registry or pub/sub service.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Registry value for {key} is not a valid integer: {value}")]
    NotAnInteger { key: String, value: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Runner process lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Failed to spawn runner {index} ({command}): {reason}")]
    SpawnFailed {
        index: u32,
        command: String,
        reason: String,
    },

    #[error("Failed to terminate runner {index}: {reason}")]
    TerminateFailed { index: u32, reason: String },
}

/// Malformed inbound or outbound messages.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Empty message")]
    Empty,

    #[error("Unknown message kind: {0}")]
    UnknownKind(String),

    #[error("Invalid runner index: {0}")]
    InvalidRunnerIndex(String),

    #[error("Unknown phase: {0}")]
    UnknownPhase(String),

    #[error("Invalid job payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

/// Dispatch-loop errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Runner {index} has no slot on this host")]
    UnknownRunner { index: u32 },

    #[error("Invalid job: {0}")]
    InvalidJob(#[from] MessageError),

    #[error("Subscription closed")]
    SubscriptionClosed,
}

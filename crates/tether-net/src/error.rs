//! Error types for the networking bridge.

use std::path::PathBuf;

use tether_core::{ExecutorError, SchedulerError};

use crate::lifecycle::LifecycleState;
use crate::request::RequestHandle;

/// Result type alias for bridge operations.
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Errors returned by [`RequestBridge`](crate::RequestBridge) and request construction.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The bridge's executor rejected or failed a task.
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// The bridge's timer could not be armed.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// The engine refused an operation.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// The request URL could not be parsed.
    #[error("invalid URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// A request header name or value is invalid.
    #[error("invalid header '{name}': {message}")]
    InvalidHeader { name: String, message: String },

    /// The request handle is not (or no longer) known to the bridge.
    #[error("unknown request {0}")]
    UnknownRequest(RequestHandle),

    /// Invalid bridge configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BridgeError {
    /// Create an invalid-header error.
    pub fn invalid_header(name: impl Into<String>, message: impl ToString) -> Self {
        Self::InvalidHeader {
            name: name.into(),
            message: message.to_string(),
        }
    }
}

/// A failure reported by the engine.
///
/// Delivered with the failed terminal callback, or returned synchronously
/// when the engine refuses to start a request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct EngineError {
    /// Engine-specific error code. Network errors use negative codes.
    pub code: i32,
    /// Human-readable description.
    pub message: String,
}

impl EngineError {
    /// Create a new engine error.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Errors loading or validating a [`BridgeConfig`](crate::BridgeConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration is not valid TOML or has unknown keys.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field has an unusable value.
    #[error("invalid value for '{field}': {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

/// A callback that does not fit the request's current state.
///
/// These never reach the engine; the bridge logs them and ignores the event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    /// The event is not valid in the current state.
    #[error("unexpected {event} in state {state}")]
    UnexpectedEvent {
        state: LifecycleState,
        event: &'static str,
    },

    /// The request already reached a terminal state.
    #[error("{event} after the request already completed")]
    AlreadyCompleted { event: &'static str },
}

//! Error types for Tether core.

/// Result type alias for executor operations.
pub type Result<T, E = ExecutorError> = std::result::Result<T, E>;

/// Errors returned by [`TaskExecutor`](crate::TaskExecutor).
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The executor has been stopped and no longer accepts tasks.
    #[error("executor has been shut down; task rejected")]
    ShutDown,

    /// The worker thread could not be spawned.
    #[error("failed to spawn worker thread '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// A task run through `post_and_wait` panicked before producing a result.
    #[error("task panicked: {0}")]
    TaskPanicked(String),
}

impl ExecutorError {
    /// Create a spawn error.
    pub fn spawn(name: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            name: name.into(),
            source,
        }
    }

    /// Check whether this error means the executor is no longer accepting work.
    pub fn is_shut_down(&self) -> bool {
        matches!(self, Self::ShutDown)
    }
}

/// Errors returned by [`DelayScheduler`](crate::DelayScheduler).
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The task ID is invalid, already fired, or was already cancelled.
    #[error("invalid or expired scheduled task ID")]
    InvalidTaskId,

    /// The scheduler has been shut down.
    #[error("scheduler has been shut down")]
    ShutDown,

    /// The timer thread could not be spawned.
    #[error("failed to spawn timer thread '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

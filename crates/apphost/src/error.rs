//! Error taxonomy shared by the pool, supervisor, registry and router.

use thiserror::Error;

/// Result type for instance hosting operations.
pub type HostResult<T> = Result<T, HostError>;

/// Errors surfaced by the hosting core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    /// Every port in the configured range is leased.
    #[error("no free port available in the configured range")]
    PoolExhausted,

    /// The child process could not be launched or died while starting.
    #[error("failed to spawn instance: {0}")]
    SpawnFailed(String),

    /// The process died while it was running.
    #[error("instance crashed: {0}")]
    ExternalCrash(String),

    /// Another transition is in flight for the same key.
    #[error("instance {0} is busy with another transition")]
    Busy(String),

    /// Token or signature rejected.
    #[error("access denied: {0}")]
    AuthDenied(String),

    /// Unknown instance key.
    #[error("instance not found: {0}")]
    NotFound(String),

    /// Repository or ref cannot form an instance key.
    #[error("invalid instance key: {0}")]
    InvalidKey(String),

    /// The event is not legal in the current state.
    #[error("invalid transition for {key}: {event} while {state}")]
    InvalidTransition {
        key: String,
        event: String,
        state: String,
    },

    /// Filesystem or OS failure outside of spawning.
    #[error("io error: {0}")]
    Io(String),
}

impl HostError {
    /// Whether the caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HostError::PoolExhausted | HostError::Busy(_))
    }
}

impl From<std::io::Error> for HostError {
    fn from(err: std::io::Error) -> Self {
        HostError::Io(err.to_string())
    }
}

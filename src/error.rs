//! Error types for the Sleuth operator

use thiserror::Error;

/// Main error type for Sleuth operations
///
/// Outcomes that are not failures never appear here: a create racing to
/// "already exists" and a delete finding nothing are mapped to success inside
/// the synchronizer, and a workload that is not yet ready is a soft-stop
/// pipeline outcome rather than an error.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for a contradictory spec; terminal, never retried
    #[error("validation error: {0}")]
    Validation(String),

    /// Configuration error for a missing external dependency (e.g. a
    /// referenced credential secret that does not exist)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Optimistic-concurrency conflict that survived the bounded local retry
    #[error("conflict error: {0}")]
    Conflict(String),

    /// Failure to persist a derived default back to the durable store
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Store operation exceeded its per-call timeout
    #[error("timeout error: {0}")]
    Timeout(String),

    /// Failure to deliver an inter-controller signal
    #[error("signal error: {0}")]
    Signal(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a conflict error with the given message
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a persistence error with the given message
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Create a timeout error with the given message
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a signal error with the given message
    pub fn signal(msg: impl Into<String>) -> Self {
        Self::Signal(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}

//! Error types for tx-outbox

use thiserror::Error;

/// Errors that can occur in the outbox engine
#[derive(Debug, Error)]
pub enum OutboxError {
    /// Requested record does not exist
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A contract guard was violated (wrong event kind, stalled retry
    /// schedule, etc.); surfaced immediately, never retried
    #[error("Guard violation: {0}")]
    Guard(String),

    /// Dispatch or transport failure during publish
    #[error("Delivery failed for record '{id}': {reason}")]
    Delivery { id: String, reason: String },

    /// Record store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Optimistic-concurrency check failed on save; another worker
    /// already advanced the record
    #[error("Version conflict saving record '{0}'")]
    Conflict(String),

    /// Distributed lock backend failure
    #[error("Lock error: {0}")]
    Lock(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error (unregistered payload type, missing handler, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failure inside a lock-guarded call, re-raised uniformly
    #[error("Guarded call failed at '{site}': {reason}")]
    GuardedCall { site: String, reason: String },
}

/// Result type alias for outbox operations
pub type Result<T> = std::result::Result<T, OutboxError>;

//! Error types for Power Mode
//!
//! `GuardrailViolation` and `HumanRequired` are deliberately absent: they are
//! never surfaced as an `Err`, only converted into `COURSE_CORRECT` and
//! `HUMAN_ESCALATE` messages at the point of detection.

use thiserror::Error;

/// Main error type for Power Mode operations.
#[derive(Error, Debug)]
pub enum PowerModeError {
    /// A message failed to decode: an unknown required field, a tag
    /// mismatch, or a malformed envelope.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The remote store could not be reached, or a round-trip exceeded its
    /// timeout. Retried with backoff by the caller before this is raised.
    #[error("transport error: {0}")]
    Transport(String),

    /// File-mode advisory lock could not be acquired within the configured
    /// timeout.
    #[error("store busy: {0}")]
    StoreBusy(String),

    /// The remote store is unreachable and no permitted degrade path applies.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The file-mode state file was corrupt and has been reset.
    #[error("store reset: {0}")]
    StoreReset(String),

    /// A key name did not match the fixed naming scheme in use.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A schema mismatch or duplicate session id — unrecoverable, the
    /// coordinator terminates.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// A domain-specific timeout (barrier, session, check-in pull).
    #[error("timeout: {0}")]
    Timeout(String),

    /// The coordinator does not (or no longer) hold the session lease.
    #[error("lease not held: {0}")]
    LeaseNotHeld(String),

    /// An objective, agent, barrier or task id had no matching record.
    #[error("not found: {0}")]
    NotFound(String),

    /// An operation was attempted in a lifecycle state that forbids it
    /// (e.g. `advance()` while a barrier is still open).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Underlying I/O failure (file-mode store, config load/save).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Remote store (Redis-compatible) client error.
    #[error("store client error: {0}")]
    StoreClient(#[from] redis::RedisError),

    /// Configuration failed cross-field validation.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PowerModeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_message_displays_reason() {
        let err = PowerModeError::InvalidMessage("missing field `tags`".to_string());
        assert_eq!(err.to_string(), "invalid message: missing field `tags`");
    }
}

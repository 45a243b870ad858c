use thiserror::Error;

use crate::core::registry::StageSlot;

/// Outcome of a stage that refused or failed to process a request.
///
/// Carried as the cancellation reason on a [`RequestContext`](crate::core::RequestContext),
/// so it stays cheap to clone and owns its message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StageError {
    /// A validator rejected the request as malformed.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// Cancellation reason recorded by the orchestrator for a validation failure.
    #[error("validate failed: {0}")]
    ValidateFailed(String),

    /// Admission was refused by the rate limiter.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The circuit breaker rejected the call without executing it.
    #[error("circuit breaker rejected request: {0}")]
    CircuitOpen(String),

    /// Forwarding to a backend failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// Releasing a stage failed during teardown.
    #[error("failed to close {slot}: {message}")]
    Close { slot: StageSlot, message: String },

    #[error("{0}")]
    Other(String),
}

/// Errors raised while constructing stages from configuration.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BuildError {
    /// No factory is registered for the requested kind.
    #[error("unknown {slot} kind '{kind}'")]
    UnknownKind { slot: StageSlot, kind: String },

    /// The factory rejected its parameters.
    #[error("invalid {slot} spec: {message}")]
    InvalidSpec { slot: StageSlot, message: String },
}

impl BuildError {
    pub fn invalid(slot: StageSlot, message: impl Into<String>) -> Self {
        BuildError::InvalidSpec {
            slot,
            message: message.into(),
        }
    }
}

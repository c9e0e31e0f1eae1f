//! Error types for the recovery engine

use std::time::Duration;

use thiserror::Error;

/// Result type alias for fallible configuration APIs
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors the engine itself produces for a caller.
///
/// Errors from the inner service pass through untouched as `tower::BoxError`;
/// these are the engine-originated ones, boxed into the same `BoxError` and
/// recoverable with `downcast_ref::<RecoveryError>()`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecoveryError {
    /// The recovery handler reported failure (or panicked) for this round
    #[error("recovery failed for policy `{policy}`: {message}")]
    RecoveryFailed { policy: String, message: String },

    /// The recovery handler did not settle within the configured timeout
    #[error("recovery for policy `{policy}` timed out after {timeout:?}")]
    RecoveryTimedOut { policy: String, timeout: Duration },

    /// The caller cancelled the request while it was still in flight
    #[error("request cancelled")]
    Cancelled,

    /// The engine dropped a suspended request without settling it
    #[error("recovery engine dropped the request before it settled")]
    EngineShutdown,
}

impl RecoveryError {
    /// Name of the policy whose round produced this error, if any.
    pub fn policy(&self) -> Option<&str> {
        match self {
            RecoveryError::RecoveryFailed { policy, .. }
            | RecoveryError::RecoveryTimedOut { policy, .. } => Some(policy),
            RecoveryError::Cancelled | RecoveryError::EngineShutdown => None,
        }
    }
}

/// Errors raised while assembling policies or loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Policy built without a trigger predicate
    #[error("policy `{policy}` has no trigger")]
    MissingTrigger { policy: String },

    /// Policy built without a recovery handler
    #[error("policy `{policy}` has no recovery handler")]
    MissingRecover { policy: String },

    /// URL tagging rule with an invalid pattern
    #[error("invalid URL pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// TOML parse error
    #[error("configuration parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

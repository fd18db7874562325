//! Fatal engine errors.
//!
//! Everything that can go wrong inside a single attempt (timeouts, provider
//! failures, malformed scores) is recovered locally and recorded on the
//! [`Attempt`](crate::types::Attempt). Everything that can go wrong with a
//! finished consensus (low confidence, high variance, missing quorum) is a
//! [`FlagReason`](crate::types::FlagReason) on the result. Only
//! misconfiguration reaches the caller as an error.

use thiserror::Error;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that abort grading before any attempt is issued.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// The engine was built without a grading capability.
    #[error("no grading capability configured")]
    MissingCapability,

    /// A configuration value is out of range.
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),

    /// The gradable unit cannot be scored (no criteria, bad maxima).
    #[error("invalid gradable unit `{unit}`: {reason}")]
    InvalidUnit { unit: String, reason: String },
}

impl EngineError {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig(reason.into())
    }

    pub(crate) fn unit(unit: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUnit {
            unit: unit.into(),
            reason: reason.into(),
        }
    }
}

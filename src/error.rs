//! Error taxonomy for the allocator core.
//!
//! Risk breaches are deliberately absent: they are supervised state
//! transitions, reported as [`crate::risk::RiskEvent`]s.

use thiserror::Error;

/// Errors that callers of the allocator core branch on.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AllocatorError {
    /// A required snapshot field was missing or stale.
    #[error("degraded input: {0}")]
    DegradedInput(String),

    /// The projector cannot produce a valid allocation (e.g. caps sum below 1).
    #[error("allocation constraint violation: {0}")]
    ConstraintViolation(String),

    /// Policy evaluation failed or produced non-finite values.
    #[error("inference failure: {0}")]
    InferenceFailure(String),

    /// A learning step exceeded sanity bounds.
    #[error("learning diverged ({consecutive} consecutive): {reason}")]
    LearningDivergence { consecutive: u32, reason: String },

    /// A checkpoint or transition was built for another feature layout.
    #[error("feature version mismatch: expected {expected}, found {found}")]
    FeatureVersionMismatch { expected: u32, found: u32 },

    /// The tick's snapshot could not be obtained in time.
    #[error("snapshot unavailable: {0}")]
    SnapshotUnavailable(String),
}

pub type AllocatorResult<T> = std::result::Result<T, AllocatorError>;

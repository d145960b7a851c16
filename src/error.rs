//! Engine errors and the fail-open skip reasons.
//!
//! The engine distinguishes two failure shapes:
//!
//! - [`EngineError`]: unrecoverable misconfiguration or a store fault that the
//!   *caller* asked us to surface (profile erasure, explicit anchor creation).
//!   These propagate with `?`.
//! - [`SkipReason`]: a detector could not run (too little history, singular
//!   covariance, unstable anchor).  These never propagate; the detector
//!   returns a neutral result carrying the reason, and the interaction path
//!   continues.  Drift detection must never block the user-facing action.

use thiserror::Error;

/// Errors surfaced to the caller.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Anchor name outside the fixed vocabulary (rejected at creation time).
    #[error("invalid anchor name: {0:?}")]
    InvalidAnchorName(String),

    /// Decision label outside the fixed vocabulary.
    #[error("invalid decision: {0:?}")]
    InvalidDecision(String),

    /// A store operation failed where the caller required it to succeed.
    #[error("store error: {0}")]
    Store(String),
}

/// Why a detector or anchor check was skipped instead of run.
///
/// Carried inside detector outputs; never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SkipReason {
    /// No historical observations at all.
    NoHistory,
    /// Fewer observations than the test's minimum.
    InsufficientData,
    /// Covariance matrix was singular; outlier status is unknowable.
    SingularCovariance,
    /// Anchor has no value yet or has not reached stability.
    AnchorNotStable,
}

impl SkipReason {
    /// Stable string form for logs and serialized payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::NoHistory => "no_historical_data",
            SkipReason::InsufficientData => "insufficient_data",
            SkipReason::SingularCovariance => "singular_matrix",
            SkipReason::AnchorNotStable => "anchor_not_stable",
        }
    }
}

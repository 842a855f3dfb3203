//! Error types for the nested sampler.
//!
//! Component operations return [`NestError`]. A failed run is reported as a
//! [`RunFailure`], which adds the iteration count and likelihood-call count
//! at which the run stopped.

use thiserror::Error;

/// Errors raised by the sampler components.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NestError {
    /// A user function returned a batch of the wrong shape.
    #[error("shape mismatch in {context}: expected {expected:?}, got {found:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    /// Not enough finite-likelihood points could be drawn for the live set.
    #[error("found only {found} of {needed} finite-likelihood live points after {rounds} rounds")]
    Initialization {
        found: usize,
        needed: usize,
        rounds: usize,
    },

    /// A single proposal search used up its attempt budget.
    #[error("no point above ln L* = {threshold} after {attempts} attempts")]
    ProposalExhausted { threshold: f64, attempts: usize },

    /// The likelihood-call cap was reached in the middle of a replacement search.
    /// The run controller ends the run instead of treating this as a failure.
    #[error("likelihood call budget of {limit} spent")]
    CallBudgetSpent { limit: u64 },

    /// A replacement did not strictly exceed the likelihood threshold, or the
    /// live set was otherwise corrupted.
    #[error("live set invariant violated: {0}")]
    InvariantViolation(String),

    /// Fitting the density model failed; the caller may fall back to local proposals.
    #[error("flow training failed: {0}")]
    FlowTraining(String),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl NestError {
    /// Whether the run loop may keep going after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            NestError::ProposalExhausted { .. } | NestError::FlowTraining(_)
        )
    }
}

/// A fatal error together with where in the run it happened.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("run aborted at iteration {iterations} after {likelihood_calls} likelihood calls: {source}")]
pub struct RunFailure {
    pub iterations: usize,
    pub likelihood_calls: u64,
    #[source]
    pub source: NestError,
}

pub type Result<T, E = NestError> = std::result::Result<T, E>;

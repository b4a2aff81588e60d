//! Error taxonomy for the CPMM engine.
//!
//! `InvalidInput` is the caller's fault and safe to surface to a user.
//! `InvariantViolation` and `NonConvergence` mean the engine produced (or was
//! about to produce) an inconsistent market state and must abort the write.

use std::fmt;

use thiserror::Error;

use crate::cpmm_core::{Outcome, Pool};

/// Snapshot of the inputs of a failed operation, attached to fatal errors so
/// the caller can log and alert with the full picture.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Diagnostics {
    pub pool: Pool,
    pub p: f64,
    pub outcome: Option<Outcome>,
    pub amount: f64,
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool={}, p={}, amount={}", self.pool, self.p, self.amount)?;
        if let Some(outcome) = self.outcome {
            write!(f, ", outcome={}", outcome.as_str())?;
        }
        Ok(())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invariant violation: {reason} ({context})")]
    InvariantViolation {
        reason: String,
        context: Diagnostics,
    },

    #[error("bisection did not converge after {iterations} iterations (low={low}, high={high})")]
    NonConvergence { iterations: usize, low: f64, high: f64 },
}

impl EngineError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        EngineError::InvalidInput(message.into())
    }

    /// Builds an `InvariantViolation` and logs it at the point of detection.
    pub(crate) fn violation(reason: impl Into<String>, context: Diagnostics) -> Self {
        let reason = reason.into();
        tracing::error!(
            reason = %reason,
            yes = context.pool.yes,
            no = context.pool.no,
            p = context.p,
            amount = context.amount,
            outcome = ?context.outcome,
            "CPMM invariant violated"
        );
        EngineError::InvariantViolation { reason, context }
    }

    /// True for engine defects, which must never be retried or clamped.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, EngineError::InvalidInput(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(!EngineError::invalid("bet must be positive").is_fatal());

        let context = Diagnostics {
            pool: Pool::new(1.0, 2.0),
            p: 0.5,
            outcome: Some(Outcome::Yes),
            amount: 3.0,
        };
        assert!(EngineError::violation("negative leg", context).is_fatal());
        assert!(EngineError::NonConvergence {
            iterations: 1,
            low: 0.0,
            high: 1.0
        }
        .is_fatal());
    }

    #[test]
    fn violation_message_carries_context() {
        let context = Diagnostics {
            pool: Pool::new(10.0, 20.0),
            p: 0.25,
            outcome: Some(Outcome::No),
            amount: 5.0,
        };
        let message = EngineError::violation("k drift", context).to_string();
        assert!(message.contains("k drift"), "{message}");
        assert!(message.contains("p=0.25"), "{message}");
        assert!(message.contains("outcome=NO"), "{message}");
    }
}

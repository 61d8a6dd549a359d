//! Error types for the firmware lifecycle controller.
//!
//! Skips are not errors: a precondition that is not met produces
//! [`crate::Outcome::Skipped`]. Everything in [`LifecycleError`] is a failed
//! attempt.

use std::time::Duration;

use thiserror::Error;

use sonic_xcvr_common::XcvrError;

use crate::bank::TransitionError;
use crate::observe::{Invariant, ViolationSet};
use crate::platform::ModuleKey;
use crate::session::Operation;

/// Result type alias for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Failures of a lifecycle operation.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// One or more invariants did not hold after the operation.
    #[error("{operation} on {module} violated invariants: {violations}")]
    InvariantViolation {
        operation: Operation,
        module: ModuleKey,
        violations: ViolationSet,
    },

    /// The controlled download process misbehaved.
    #[error("Process control failed during {operation} on {module}: {message}")]
    ProcessControl {
        operation: Operation,
        module: ModuleKey,
        message: String,
    },

    /// The bank model rejected a transition.
    #[error("Illegal transition during {operation} on {module}: {source}")]
    IllegalTransition {
        operation: Operation,
        module: ModuleKey,
        #[source]
        source: TransitionError,
    },

    /// The recorded reference download is too short to derive interrupt points.
    #[error("Invalid download time {reference:?} recorded for {module} (minimum {minimum:?})")]
    InvalidTimingHistory {
        module: ModuleKey,
        reference: Duration,
        minimum: Duration,
    },

    /// Collaborator failure.
    #[error(transparent)]
    Platform(#[from] XcvrError),

    /// The caller passed arguments the operation cannot accept.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl LifecycleError {
    pub fn process_control(
        operation: Operation,
        module: &ModuleKey,
        message: impl Into<String>,
    ) -> Self {
        Self::ProcessControl {
            operation,
            module: module.clone(),
            message: message.into(),
        }
    }

    pub fn illegal_transition(
        operation: Operation,
        module: &ModuleKey,
        source: TransitionError,
    ) -> Self {
        Self::IllegalTransition {
            operation,
            module: module.clone(),
            source,
        }
    }

    /// Returns the violations if this is an invariant failure.
    pub fn violations(&self) -> Option<&ViolationSet> {
        match self {
            Self::InvariantViolation { violations, .. } => Some(violations),
            _ => None,
        }
    }

    /// Returns true if `invariant` is among the reported violations.
    pub fn violates(&self, invariant: Invariant) -> bool {
        self.violations().is_some_and(|v| v.contains(invariant))
    }
}

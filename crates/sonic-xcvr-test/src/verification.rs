//! Verification helpers for lifecycle scenarios
//!
//! Turns controller outcomes and the simulated switch's command log into
//! `Result`s, so scenario tests can chain checks with `?`.

use thiserror::Error;

use sonic_xcvrfw::{
    Invariant, LifecycleError, LifecycleResult, LifecycleState, OperationReport, Outcome,
    SkipReason,
};

/// Verification error types
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("Operation failed: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Expected the operation to complete, it was skipped: {reason}")]
    UnexpectedSkip { reason: SkipReason },

    #[error("Expected skip '{expected}', got {actual}")]
    SkipMismatch { expected: String, actual: String },

    #[error("Expected final state {expected}, got {actual}")]
    StateMismatch {
        expected: LifecycleState,
        actual: LifecycleState,
    },

    #[error("Expected violation of {expected}, got {actual}")]
    MissingViolation { expected: Invariant, actual: String },

    #[error("Expected command '{expected}' in {actual:?}")]
    CommandNotFound { expected: String, actual: Vec<String> },

    #[error("Command '{unexpected}' should not have been issued")]
    UnexpectedCommand { unexpected: String },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Unwraps a completed operation.
pub fn assert_completed(result: LifecycleResult<Outcome>) -> VerifyResult<OperationReport> {
    match result? {
        Outcome::Completed(report) => Ok(*report),
        Outcome::Skipped(reason) => Err(VerificationError::UnexpectedSkip { reason }),
    }
}

/// Checks that an operation completed in `state`.
pub fn assert_completed_in(
    result: LifecycleResult<Outcome>,
    state: LifecycleState,
) -> VerifyResult<OperationReport> {
    let report = assert_completed(result)?;
    if report.final_state != state {
        return Err(VerificationError::StateMismatch {
            expected: state,
            actual: report.final_state,
        });
    }
    Ok(report)
}

/// Checks that an operation was skipped for `expected`.
pub fn assert_skipped(result: LifecycleResult<Outcome>, expected: &SkipReason) -> VerifyResult<()> {
    match result? {
        Outcome::Skipped(reason) if &reason == expected => Ok(()),
        Outcome::Skipped(reason) => Err(VerificationError::SkipMismatch {
            expected: expected.to_string(),
            actual: reason.to_string(),
        }),
        Outcome::Completed(report) => Err(VerificationError::SkipMismatch {
            expected: expected.to_string(),
            actual: format!("completed in {}", report.final_state),
        }),
    }
}

/// Checks that an operation failed on `invariant` and returns the error.
pub fn assert_violation<T>(result: LifecycleResult<T>, invariant: Invariant) -> VerifyResult<LifecycleError> {
    match result {
        Err(e) if e.violates(invariant) => Ok(e),
        Err(e) => Err(VerificationError::MissingViolation {
            expected: invariant,
            actual: e.to_string(),
        }),
        Ok(_) => Err(VerificationError::MissingViolation {
            expected: invariant,
            actual: "success".to_string(),
        }),
    }
}

/// Command log verifier
pub struct CommandVerifier {
    captured_commands: Vec<String>,
}

impl CommandVerifier {
    pub fn new(captured_commands: Vec<String>) -> Self {
        Self { captured_commands }
    }

    /// Verify that a command containing `expected` was issued
    pub fn assert_command_executed(&self, expected: &str) -> VerifyResult<()> {
        if self.position(expected).is_some() {
            Ok(())
        } else {
            Err(VerificationError::CommandNotFound {
                expected: expected.to_string(),
                actual: self.captured_commands.clone(),
            })
        }
    }

    /// Verify that no command containing `unexpected` was issued
    pub fn assert_command_not_executed(&self, unexpected: &str) -> VerifyResult<()> {
        match self.position(unexpected) {
            Some(_) => Err(VerificationError::UnexpectedCommand {
                unexpected: unexpected.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Verify that `first` was issued before `second`
    pub fn assert_ordered(&self, first: &str, second: &str) -> VerifyResult<()> {
        let a = self
            .position(first)
            .ok_or_else(|| VerificationError::CommandNotFound {
                expected: first.to_string(),
                actual: self.captured_commands.clone(),
            })?;
        match self.captured_commands[a + 1..].iter().position(|c| c.contains(second)) {
            Some(_) => Ok(()),
            None => Err(VerificationError::CommandNotFound {
                expected: format!("{} after {}", second, first),
                actual: self.captured_commands.clone(),
            }),
        }
    }

    /// Number of issued commands containing `pattern`
    pub fn count(&self, pattern: &str) -> usize {
        self.captured_commands
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }

    pub fn captured_commands(&self) -> &[String] {
        &self.captured_commands
    }

    fn position(&self, pattern: &str) -> Option<usize> {
        self.captured_commands.iter().position(|c| c.contains(pattern))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_verifier() {
        let verifier = CommandVerifier::new(vec![
            "dom Ethernet0 disable".to_string(),
            "firmware run Ethernet0".to_string(),
            "dom Ethernet0 enable".to_string(),
        ]);

        assert!(verifier.assert_command_executed("firmware run").is_ok());
        assert!(verifier.assert_command_not_executed("commit").is_ok());
        assert!(verifier.assert_ordered("disable", "firmware run").is_ok());
        assert!(verifier.assert_ordered("firmware run", "disable").is_err());
        assert_eq!(verifier.count("dom"), 2);
        assert!(verifier.assert_command_executed("reset").is_err());
    }

    #[test]
    fn test_skip_assertions() {
        let skipped: LifecycleResult<Outcome> = Ok(Outcome::Skipped(SkipReason::NoDualBank));
        assert!(assert_skipped(skipped, &SkipReason::NoDualBank).is_ok());

        let skipped: LifecycleResult<Outcome> = Ok(Outcome::Skipped(SkipReason::NoImage));
        let err = assert_skipped(skipped, &SkipReason::NoDualBank).unwrap_err();
        assert_eq!(err.to_string(), "Expected skip 'not dual bank', got no FW image");

        let skipped: LifecycleResult<Outcome> = Ok(Outcome::Skipped(SkipReason::NoImage));
        assert!(matches!(
            assert_completed(skipped),
            Err(VerificationError::UnexpectedSkip { .. })
        ));
    }
}

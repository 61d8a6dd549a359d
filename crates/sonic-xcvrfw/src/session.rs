//! Per-operation lifecycle sessions.
//!
//! A [`LifecycleSession`] lives for exactly one controller operation. It holds
//! the baseline snapshot, the wall-clock and monotonic start times, and the
//! trail of lifecycle states the operation went through. When the operation
//! ends the session is consumed into an [`OperationReport`].

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::bank::LifecycleState;
use crate::observe::Snapshot;
use crate::platform::ModuleKey;

/// Controller operations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Operation {
    StageFirmware { valid: bool },
    InterruptStaging { fraction: f64 },
    KillStaging { after: Duration },
    StageInLowPower,
    ActivateStaged,
    CommitRunning,
    ResetAfterDownload,
    ResetAfterRun,
    // port diagnostics, independent of the bank lifecycle
    CheckPresence,
    CheckFirmwareVersions,
    ToggleLowPower,
    ResetModule,
    CycleLink { cycles: u32 },
    RemoteReseat,
}

impl Operation {
    /// Returns true for operations that write the inactive bank.
    pub fn is_download(&self) -> bool {
        matches!(
            self,
            Operation::StageFirmware { .. }
                | Operation::InterruptStaging { .. }
                | Operation::KillStaging { .. }
                | Operation::StageInLowPower
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::StageFirmware { valid: true } => write!(f, "stage_firmware(valid)"),
            Operation::StageFirmware { valid: false } => write!(f, "stage_firmware(invalid)"),
            Operation::InterruptStaging { fraction } => {
                write!(f, "interrupt_staging({:.0}%)", fraction * 100.0)
            }
            Operation::KillStaging { after } => write!(f, "kill_staging({}s)", after.as_secs()),
            Operation::StageInLowPower => write!(f, "stage_in_lpmode"),
            Operation::ActivateStaged => write!(f, "activate_staged"),
            Operation::CommitRunning => write!(f, "commit_running"),
            Operation::ResetAfterDownload => write!(f, "reset_after_download"),
            Operation::ResetAfterRun => write!(f, "reset_after_run"),
            Operation::CheckPresence => write!(f, "check_presence"),
            Operation::CheckFirmwareVersions => write!(f, "check_fw_versions"),
            Operation::ToggleLowPower => write!(f, "toggle_lpmode"),
            Operation::ResetModule => write!(f, "reset_module"),
            Operation::CycleLink { cycles } => write!(f, "cycle_link(x{})", cycles),
            Operation::RemoteReseat => write!(f, "remote_reseat"),
        }
    }
}

/// State of one in-flight operation.
#[derive(Debug)]
pub struct LifecycleSession {
    operation: Operation,
    module: ModuleKey,
    trail: Vec<LifecycleState>,
    started_at: DateTime<Utc>,
    started: Instant,
    baseline: Snapshot,
}

impl LifecycleSession {
    /// Opens a session. `baseline` must be captured before anything is sent
    /// to the module.
    pub fn start(
        operation: Operation,
        module: ModuleKey,
        state: LifecycleState,
        baseline: Snapshot,
    ) -> Self {
        debug!(port = %module, %operation, %state, "Session started");
        Self {
            operation,
            module,
            trail: vec![state],
            started_at: Utc::now(),
            started: Instant::now(),
            baseline,
        }
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn module(&self) -> &ModuleKey {
        &self.module
    }

    pub fn baseline(&self) -> &Snapshot {
        &self.baseline
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        // trail always holds the initial state
        self.trail.last().copied().unwrap_or(LifecycleState::Idle)
    }

    /// Time since the session started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Moves to `next`; returns false and stays put if the edge does not exist.
    pub fn advance(&mut self, next: LifecycleState) -> bool {
        let current = self.state();
        if !current.can_transition_to(next) {
            return false;
        }
        debug!(port = %self.module, from = %current, to = %next, "Lifecycle transition");
        self.trail.push(next);
        true
    }

    /// Closes the session.
    pub fn finish(self, after: Snapshot, output: Vec<String>) -> OperationReport {
        let elapsed = self.started.elapsed();
        OperationReport {
            operation: self.operation,
            module: self.module,
            final_state: self.trail.last().copied().unwrap_or(LifecycleState::Idle),
            trail: self.trail,
            started_at: self.started_at,
            stopped_at: Utc::now(),
            elapsed,
            before: self.baseline,
            after,
            output,
        }
    }
}

/// Result of a completed operation whose invariants all held.
#[derive(Debug, Clone, Serialize)]
pub struct OperationReport {
    pub operation: Operation,
    pub module: ModuleKey,
    pub final_state: LifecycleState,
    /// Every lifecycle state visited, starting with the initial one.
    pub trail: Vec<LifecycleState>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub before: Snapshot,
    pub after: Snapshot,
    /// Output of the controlled command, if any.
    pub output: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn session(state: LifecycleState) -> LifecycleSession {
        LifecycleSession::start(
            Operation::StageFirmware { valid: true },
            ModuleKey::new("sw1", "Ethernet0"),
            state,
            Snapshot::default(),
        )
    }

    #[test]
    fn test_operation_display() {
        assert_eq!(
            Operation::StageFirmware { valid: false }.to_string(),
            "stage_firmware(invalid)"
        );
        assert_eq!(
            Operation::InterruptStaging { fraction: 0.4 }.to_string(),
            "interrupt_staging(40%)"
        );
        assert_eq!(
            Operation::KillStaging { after: Duration::from_secs(20) }.to_string(),
            "kill_staging(20s)"
        );
        assert_eq!(Operation::CycleLink { cycles: 100 }.to_string(), "cycle_link(x100)");
        assert!(Operation::StageInLowPower.is_download());
        assert!(!Operation::ResetAfterRun.is_download());
        assert!(!Operation::RemoteReseat.is_download());
    }

    #[test]
    fn test_advance_follows_graph() {
        let mut s = session(LifecycleState::Idle);
        assert!(s.advance(LifecycleState::Staging));
        assert!(!s.advance(LifecycleState::Running));
        assert_eq!(s.state(), LifecycleState::Staging);
        assert!(s.advance(LifecycleState::Staged));

        let report = s.finish(Snapshot::default(), vec!["done".to_string()]);
        assert_eq!(report.final_state, LifecycleState::Staged);
        assert_eq!(
            report.trail,
            vec![
                LifecycleState::Idle,
                LifecycleState::Staging,
                LifecycleState::Staged
            ]
        );
        assert!(report.stopped_at >= report.started_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_uses_tokio_clock() {
        let s = session(LifecycleState::Idle);
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert!(s.elapsed() >= Duration::from_secs(90));
        let report = s.finish(Snapshot::default(), Vec::new());
        assert!(report.elapsed >= Duration::from_secs(90));
    }
}

//! Two-bank firmware model and its transition rules.
//!
//! ```text
//! Idle --download--> Staging --success--> Staged
//! Staging --kill/abort--> Aborted
//! Staging --failure-----> Failed
//! Staged  --run---------> Running    (swaps active/inactive)
//! Running --commit------> Committed  (commits the now-active bank)
//! ```
//!
//! Aborted, Failed, Staged and Committed are at rest: a new download may
//! start from any of them. Running must be committed first.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::classifier::XcvrFamily;
use crate::platform::{Bank, FirmwareInfo};

/// Inactive version reported after a download was cut short or the image was
/// corrupt.
pub const CORRUPTED_VERSION: &str = "0.0.0";

/// Lifecycle state of a module's firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LifecycleState {
    Idle,
    Staging,
    Staged,
    Aborted,
    Failed,
    Running,
    Committed,
}

impl LifecycleState {
    /// Returns the state name as used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Staging => "staging",
            LifecycleState::Staged => "staged",
            LifecycleState::Aborted => "aborted",
            LifecycleState::Failed => "failed",
            LifecycleState::Running => "running",
            LifecycleState::Committed => "committed",
        }
    }

    /// Returns true if a new download may start from this state.
    pub fn can_stage(&self) -> bool {
        matches!(
            self,
            LifecycleState::Idle
                | LifecycleState::Staged
                | LifecycleState::Aborted
                | LifecycleState::Failed
                | LifecycleState::Committed
        )
    }

    /// Returns true if `next` is an edge of the lifecycle graph.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (*self, next) {
            (from, Staging) => from.can_stage(),
            (Staging, Staged | Aborted | Failed) => true,
            (Staged, Running) => true,
            (Running, Committed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transition the bank model refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("cannot {event} from state {from}")]
    IllegalTransition {
        from: LifecycleState,
        event: &'static str,
    },

    #[error("download requires dual-bank support")]
    NoDualBank,

    #[error("{event} is only defined for CMIS modules (module is {family})")]
    NotCmis {
        family: XcvrFamily,
        event: &'static str,
    },

    #[error("inactive version became '{observed}' after an unsuccessful download (was '{previous}')")]
    WrongInactiveVersion { previous: String, observed: String },

    #[error("commit left the committed bank at {bank}")]
    CommittedBankUnchanged { bank: Bank },
}

/// Firmware bank state of one module, as tracked by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirmwareBankState {
    pub active_version: String,
    pub inactive_version: String,
    pub running_bank: Bank,
    pub committed_bank: Bank,
    /// From static configuration, never derived at runtime.
    pub dual_bank_support: bool,
    pub state: LifecycleState,
}

impl FirmwareBankState {
    /// Builds the model from an observation of the module.
    pub fn from_info(info: &FirmwareInfo, dual_bank_support: bool) -> Self {
        Self {
            active_version: info.active.clone(),
            inactive_version: info.inactive.clone(),
            running_bank: info.running,
            committed_bank: info.committed,
            dual_bank_support,
            state: LifecycleState::Idle,
        }
    }

    /// Placeholder for modules whose firmware state cannot be read.
    pub fn unobserved(dual_bank_support: bool) -> Self {
        Self {
            active_version: String::new(),
            inactive_version: String::new(),
            running_bank: Bank::A,
            committed_bank: Bank::A,
            dual_bank_support,
            state: LifecycleState::Idle,
        }
    }

    /// Enters `Staging`.
    pub fn begin_staging(&mut self) -> Result<(), TransitionError> {
        if !self.dual_bank_support {
            return Err(TransitionError::NoDualBank);
        }
        if !self.state.can_stage() {
            return Err(TransitionError::IllegalTransition {
                from: self.state,
                event: "download",
            });
        }
        self.state = LifecycleState::Staging;
        Ok(())
    }

    /// `Staging -> Staged`; the inactive bank now holds `version`.
    pub fn finish_staged(&mut self, version: impl Into<String>) -> Result<(), TransitionError> {
        self.expect_staging("complete download")?;
        self.inactive_version = version.into();
        self.state = LifecycleState::Staged;
        Ok(())
    }

    /// `Staging -> Aborted` after the download was killed.
    pub fn finish_aborted(&mut self, observed_inactive: &str) -> Result<(), TransitionError> {
        self.expect_staging("abort download")?;
        self.state = LifecycleState::Aborted;
        self.accept_unsuccessful_inactive(observed_inactive)
    }

    /// `Staging -> Failed` after the download reported failure.
    pub fn finish_failed(&mut self, observed_inactive: &str) -> Result<(), TransitionError> {
        self.expect_staging("fail download")?;
        self.state = LifecycleState::Failed;
        self.accept_unsuccessful_inactive(observed_inactive)
    }

    /// `Staging -> Failed` after a download that completed, but broke another
    /// invariant. The inactive bank holds `version` regardless.
    pub fn finish_failed_with(&mut self, version: impl Into<String>) -> Result<(), TransitionError> {
        self.expect_staging("fail download")?;
        self.inactive_version = version.into();
        self.state = LifecycleState::Failed;
        Ok(())
    }

    /// `Staged -> Running`: the inactive image becomes active and vice versa.
    pub fn run(&mut self, family: XcvrFamily) -> Result<(), TransitionError> {
        if family != XcvrFamily::Cmis {
            return Err(TransitionError::NotCmis {
                family,
                event: "run",
            });
        }
        if self.state != LifecycleState::Staged {
            return Err(TransitionError::IllegalTransition {
                from: self.state,
                event: "run",
            });
        }
        std::mem::swap(&mut self.active_version, &mut self.inactive_version);
        self.running_bank = self.running_bank.other();
        self.state = LifecycleState::Running;
        Ok(())
    }

    /// `Running -> Committed`; `observed` is the committed bank read back.
    pub fn commit(&mut self, family: XcvrFamily, observed: Bank) -> Result<(), TransitionError> {
        if family != XcvrFamily::Cmis {
            return Err(TransitionError::NotCmis {
                family,
                event: "commit",
            });
        }
        if self.state != LifecycleState::Running {
            return Err(TransitionError::IllegalTransition {
                from: self.state,
                event: "commit",
            });
        }
        if observed == self.committed_bank {
            return Err(TransitionError::CommittedBankUnchanged { bank: observed });
        }
        self.committed_bank = observed;
        self.state = LifecycleState::Committed;
        Ok(())
    }

    fn expect_staging(&self, event: &'static str) -> Result<(), TransitionError> {
        if self.state == LifecycleState::Staging {
            Ok(())
        } else {
            Err(TransitionError::IllegalTransition {
                from: self.state,
                event,
            })
        }
    }

    /// After an unsuccessful download the inactive image is either untouched
    /// or marked corrupted, never a different valid version.
    fn accept_unsuccessful_inactive(&mut self, observed: &str) -> Result<(), TransitionError> {
        if observed == self.inactive_version {
            Ok(())
        } else if observed == CORRUPTED_VERSION {
            self.inactive_version = CORRUPTED_VERSION.to_string();
            Ok(())
        } else {
            Err(TransitionError::WrongInactiveVersion {
                previous: self.inactive_version.clone(),
                observed: observed.to_string(),
            })
        }
    }
}

//! Port diagnostics.
//!
//! Presence, firmware version, low-power, reset, link and reseat checks
//! that exercise a module through the same platform traits as the lifecycle
//! operations. None of them moves the bank model: each ends in the state it
//! started in, and any bank movement is reported as a violation.

use std::sync::Arc;

use tokio::time::sleep;
use tracing::{info, instrument, warn};

use sonic_xcvr_common::XcvrResult;

use super::{
    banks_untouched, finish_guarded, FirmwareLifecycleController, Gates, ModuleUnderTest, Outcome,
    SkipReason,
};
use crate::bank::LifecycleState;
use crate::error::{LifecycleError, LifecycleResult};
use crate::guard::ScopedSetting;
use crate::identity::ModuleIdentity;
use crate::observe::{
    expect_baseline, expect_flag, Invariant, InvariantChecker, Snapshot, Violation, ViolationSet,
    UNAVAILABLE,
};
use crate::platform::{ModuleKey, Platform};
use crate::session::{LifecycleSession, Operation};

impl<P: Platform + ?Sized + 'static> FirmwareLifecycleController<P> {
    /// Confirms the module is present and still classifies as it did when
    /// attached.
    #[instrument(skip(self, module), fields(port = %module.key))]
    pub async fn check_presence(&self, module: &ModuleUnderTest) -> LifecycleResult<Outcome> {
        let op = Operation::CheckPresence;
        let present = self.platform.is_present(&module.key).await.ok();
        let readable = present == Some(true) && module.identity.is_cmis();
        let before = if readable {
            Snapshot::capture(&*self.platform, &module.key).await
        } else {
            Snapshot::default()
        };
        let session = LifecycleSession::start(op, module.key.clone(), module.bank.state, before.clone());

        let mut violations = ViolationSet::new();
        violations.check(expect_flag(Invariant::ModulePresent, true, present));
        if present == Some(true) {
            let reread =
                ModuleIdentity::probe(&*self.platform, &module.key, self.config.active_cable_policy).await;
            if reread.is_indeterminate() || reread.family != module.identity.family {
                let expected = if module.identity.is_indeterminate() {
                    "a known module family".to_string()
                } else {
                    module.identity.family.to_string()
                };
                violations.push(Violation::new(
                    Invariant::Identification,
                    expected,
                    reread.family.to_string(),
                ));
            }
        }

        self.conclude(session, violations, before, Vec::new())
    }

    /// Reads both firmware versions with DOM polling suspended and compares
    /// them with the static description (before any lifecycle operation) or
    /// with the bank model (after).
    #[instrument(skip(self, module), fields(port = %module.key))]
    pub async fn check_firmware_versions(&self, module: &ModuleUnderTest) -> LifecycleResult<Outcome> {
        let op = Operation::CheckFirmwareVersions;
        if let Some(reason) = self.gates(module, Gates::LIFECYCLE).await? {
            return Ok(self.skip(op, module, reason));
        }

        let guard = ScopedSetting::suspend_dom_polling(Arc::clone(&self.platform), &module.key).await?;
        let observed = Snapshot::capture(&*self.platform, &module.key).await;
        let observed = finish_guarded(Ok(observed), guard.release().await)?;

        let session = LifecycleSession::start(op, module.key.clone(), module.bank.state, observed.clone());
        let mut violations = ViolationSet::new();
        if module.bank.state == LifecycleState::Idle {
            violations.check(expect_baseline(
                "active_firmware",
                module.config.active_firmware.as_deref(),
                observed.active_version.as_deref(),
                false,
            ));
            violations.check(expect_baseline(
                "inactive_firmware",
                module.config.inactive_firmware.as_deref(),
                observed.inactive_version.as_deref(),
                false,
            ));
        } else {
            violations.check(expect_model_version(
                Invariant::ActiveVersion,
                &module.bank.active_version,
                observed.active_version.as_deref(),
            ));
            violations.check(expect_model_version(
                Invariant::InactiveVersion,
                &module.bank.inactive_version,
                observed.inactive_version.as_deref(),
            ));
        }

        self.conclude(session, violations, observed, Vec::new())
    }

    /// LPMode on takes every subport down, LPMode off brings them back.
    ///
    /// Only CMIS modules are checked: SFF modules may keep transmitting in
    /// low-power mode.
    #[instrument(skip(self, module), fields(port = %module.key))]
    pub async fn toggle_low_power(&self, module: &ModuleUnderTest) -> LifecycleResult<Outcome> {
        let op = Operation::ToggleLowPower;
        if let Some(reason) = self.gates(module, Gates::LIFECYCLE).await? {
            return Ok(self.skip(op, module, reason));
        }
        if !module.identity.supports_lpmode {
            return Ok(self.skip(op, module, SkipReason::NoLowPowerMode));
        }

        let before = Snapshot::capture(&*self.platform, &module.key).await;
        let session = LifecycleSession::start(op, module.key.clone(), module.bank.state, before);
        let subports = self.platform.subports(&module.key).await?;

        let mut violations = ViolationSet::new();
        self.cycle_low_power(&module.key, &subports, &mut violations).await?;
        let recovered = self
            .wait_link_up(&subports, self.config.link_up_bound(&module.identity))
            .await;
        violations.check(expect_flag(Invariant::LinkNotRecovered, true, Some(recovered)));

        let after = Snapshot::capture(&*self.platform, &module.key).await;
        violations.extend(
            InvariantChecker::new(banks_untouched(&module.identity)).diff(session.baseline(), &after),
        );
        self.conclude(session, violations, after, Vec::new())
    }

    /// Resets any present module regardless of its lifecycle state, then
    /// restarts its subports.
    #[instrument(skip(self, module), fields(port = %module.key))]
    pub async fn reset_module(&self, module: &mut ModuleUnderTest) -> LifecycleResult<Outcome> {
        let op = Operation::ResetModule;
        if let Some(reason) = self.gates(module, Gates::PORT).await? {
            return Ok(self.skip(op, module, reason));
        }
        let expect_link_down = self.config.reset_holds_link_down(&module.key.switch);
        self.reset(op, module, expect_link_down).await
    }

    /// Shuts the port down and starts it again `cycles` times.
    ///
    /// Stops at the first cycle that violates an invariant; the port is
    /// always started again.
    #[instrument(skip(self, module), fields(port = %module.key))]
    pub async fn cycle_link(&self, module: &ModuleUnderTest, cycles: u32) -> LifecycleResult<Outcome> {
        if cycles == 0 {
            return Err(LifecycleError::InvalidRequest(
                "link cycle count must be > 0".to_string(),
            ));
        }
        let op = Operation::CycleLink { cycles };
        let gates = Gates {
            main_subport: false,
            ..Gates::PORT
        };
        if let Some(reason) = self.gates(module, gates).await? {
            return Ok(self.skip(op, module, reason));
        }

        let key = &module.key;
        let before = Snapshot::capture(&*self.platform, key).await;
        let session = LifecycleSession::start(op, key.clone(), module.bank.state, before);
        let bound = self.config.link_up_bound(&module.identity);

        let mut violations = ViolationSet::new();
        for cycle in 1..=cycles {
            self.platform.shutdown(key).await?;
            sleep(self.config.shutdown_settle()).await;
            let up = self.platform.is_oper_up(key).await.ok();
            violations.check(expect_flag(Invariant::LinkNotDown, false, up));

            self.platform.startup(key).await?;
            let recovered = self.wait_link_up(std::slice::from_ref(key), bound).await;
            violations.check(expect_flag(Invariant::LinkNotRecovered, true, Some(recovered)));

            if !violations.is_empty() {
                warn!(port = %key, cycle, cycles, "Link cycle failed");
                break;
            }
        }
        info!(port = %key, cycles, "Link cycling finished");

        let after = Snapshot::capture(&*self.platform, key).await;
        violations.extend(
            InvariantChecker::new(banks_untouched(&module.identity)).diff(session.baseline(), &after),
        );
        self.conclude(session, violations, after, Vec::new())
    }

    /// Link stress: [`Self::cycle_link`] with the configured cycle count.
    pub async fn stress_link(&self, module: &ModuleUnderTest) -> LifecycleResult<Outcome> {
        self.cycle_link(module, self.config.link_stress_cycles).await
    }

    /// Reseat without touching the cage: ports down, module reset, LPMode
    /// cycled where supported, ports up. DOM polling stays suspended
    /// throughout.
    #[instrument(skip(self, module), fields(port = %module.key))]
    pub async fn remote_reseat(&self, module: &ModuleUnderTest) -> LifecycleResult<Outcome> {
        let op = Operation::RemoteReseat;
        if let Some(reason) = self.gates(module, Gates::PORT).await? {
            return Ok(self.skip(op, module, reason));
        }

        let guard = ScopedSetting::suspend_dom_polling(Arc::clone(&self.platform), &module.key).await?;
        let result = self.reseat_suspended(op, module).await;
        finish_guarded(result, guard.release().await)
    }

    async fn reseat_suspended(&self, op: Operation, module: &ModuleUnderTest) -> LifecycleResult<Outcome> {
        let key = &module.key;
        let before = Snapshot::capture(&*self.platform, key).await;
        let session = LifecycleSession::start(op, key.clone(), module.bank.state, before);
        let subports = self.platform.subports(key).await?;

        for sub in &subports {
            self.platform.shutdown(sub).await?;
        }
        sleep(self.config.shutdown_settle()).await;
        let mut violations = ViolationSet::new();
        let up = self.platform.is_oper_up(key).await.ok();
        violations.check(expect_flag(Invariant::LinkNotDown, false, up));

        let reset = self.reseat_module(module, &mut violations).await;
        let started = self.startup_all(&subports).await;
        reset?;
        started?;

        let recovered = self
            .wait_link_up(&subports, self.config.link_up_bound(&module.identity))
            .await;
        violations.check(expect_flag(Invariant::LinkNotRecovered, true, Some(recovered)));

        let after = Snapshot::capture(&*self.platform, key).await;
        violations.extend(
            InvariantChecker::new(banks_untouched(&module.identity)).diff(session.baseline(), &after),
        );
        self.conclude(session, violations, after, Vec::new())
    }

    /// Reset plus the LPMode cycle of a reseat, run while the ports are down.
    async fn reseat_module(&self, module: &ModuleUnderTest, violations: &mut ViolationSet) -> XcvrResult<()> {
        self.platform.reset_module(&module.key).await?;
        sleep(self.config.reset_settle()).await;
        // LPMode cannot be driven on switches exempt from the reset link check
        if module.identity.supports_lpmode && self.config.reset_holds_link_down(&module.key.switch) {
            self.cycle_low_power(&module.key, &[], violations).await?;
        }
        Ok(())
    }

    /// Engages LPMode, checks it took effect and that every port in `down`
    /// lost its link, then releases it and checks it is off again.
    async fn cycle_low_power(
        &self,
        key: &ModuleKey,
        down: &[ModuleKey],
        violations: &mut ViolationSet,
    ) -> XcvrResult<()> {
        let lpmode = ScopedSetting::low_power_mode(Arc::clone(&self.platform), key).await?;
        sleep(self.config.lpmode_settle()).await;

        let engaged = lpmode.current().await.ok();
        violations.check(expect_flag(Invariant::LowPowerModeNotEngaged, true, engaged));
        for sub in down {
            let up = self.platform.is_oper_up(sub).await.ok();
            violations.check(expect_flag(Invariant::LinkNotDown, false, up));
        }

        lpmode.release().await?;
        let still_engaged = self.platform.lpmode_enabled(key).await.ok();
        violations.check(expect_flag(Invariant::LowPowerModeNotReleased, false, still_engaged));
        Ok(())
    }
}

/// Observed version against the bank model.
fn expect_model_version(invariant: Invariant, model: &str, observed: Option<&str>) -> Option<Violation> {
    match observed {
        Some(v) if v == model => None,
        other => Some(Violation::new(
            invariant,
            format!("'{}' (bank model)", model),
            other.map_or_else(|| UNAVAILABLE.to_string(), |v| format!("'{}'", v)),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_model_version_mismatch() {
        assert_eq!(expect_model_version(Invariant::ActiveVersion, "1.1.0", Some("1.1.0")), None);

        let stale = expect_model_version(Invariant::InactiveVersion, "0.9.0", Some("1.1.0")).unwrap();
        assert_eq!(stale.expected, "'0.9.0' (bank model)");
        assert_eq!(stale.observed, "'1.1.0'");

        let unread = expect_model_version(Invariant::ActiveVersion, "1.0.0", None).unwrap();
        assert_eq!(unread.observed, UNAVAILABLE);
    }
}

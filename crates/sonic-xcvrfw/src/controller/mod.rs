//! Firmware lifecycle controller.
//!
//! Drives stage/activate/commit/abort/reset operations against one module at
//! a time. Every operation:
//!
//! 1. checks its eligibility gates and returns [`Outcome::Skipped`] if one
//!    fails, without touching the module;
//! 2. suspends DOM polling for its duration;
//! 3. captures a baseline [`Snapshot`], drives the platform, captures an after
//!    snapshot once the operation reached a terminal state;
//! 4. diffs the two and fails with [`LifecycleError::InvariantViolation`] if
//!    any invariant did not hold.
//!
//! Nothing is retried.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

use sonic_xcvr_common::{ProcessHandle, XcvrResult};

use crate::bank::{FirmwareBankState, LifecycleState};
use crate::classifier::XcvrFamily;
use crate::config::{LifecycleConfig, ModuleStaticConfig, StaticConfig};
use crate::error::{LifecycleError, LifecycleResult};
use crate::guard::ScopedSetting;
use crate::history::DownloadTimingHistory;
use crate::identity::ModuleIdentity;
use crate::image::prepare_invalid_image;
use crate::observe::{
    expect_baseline, expect_download_time, expect_failure_message, expect_flag,
    expect_success_message, expect_transition, Expectations, Invariant, InvariantChecker,
    Snapshot, Violation, ViolationSet,
};
use crate::platform::{ModuleKey, Platform};
use crate::session::{LifecycleSession, Operation, OperationReport};

mod diagnostics;

/// Output marker of a successful download.
pub const DOWNLOAD_SUCCESS: &str = "firmware download complete success";
/// Output marker of a successful run.
pub const RUN_SUCCESS: &str = "firmware run in mode=0 success";
/// Output marker of a successful commit.
pub const COMMIT_SUCCESS: &str = "firmware commit successful";

/// Why an operation was not attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    NotPresent,
    ClassificationIndeterminate,
    NotCmis(XcvrFamily),
    /// Breakout subport other than the first.
    NotMainSubport(u8),
    NoDualBank,
    NoImage,
    ImageMissing(PathBuf),
    NoTimingHistory,
    NoLowPowerMode,
    WrongState {
        required: &'static str,
        actual: LifecycleState,
    },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NotPresent => write!(f, "not present"),
            SkipReason::ClassificationIndeterminate => write!(f, "classification undetermined"),
            SkipReason::NotCmis(family) => write!(f, "not CMIS ({})", family),
            SkipReason::NotMainSubport(n) => write!(f, "not main (sub)port (subport {})", n),
            SkipReason::NoDualBank => write!(f, "not dual bank"),
            SkipReason::NoImage => write!(f, "no FW image"),
            SkipReason::ImageMissing(path) => write!(f, "FW image {} missing", path.display()),
            SkipReason::NoTimingHistory => write!(f, "no reference download time"),
            SkipReason::NoLowPowerMode => write!(f, "LPMode not supported"),
            SkipReason::WrongState { required, actual } => {
                write!(f, "requires {} state, module is {}", required, actual)
            }
        }
    }
}

/// Result of an operation that did not fail.
#[derive(Debug)]
pub enum Outcome {
    Completed(Box<OperationReport>),
    Skipped(SkipReason),
}

impl Outcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Outcome::Skipped(_))
    }

    pub fn report(&self) -> Option<&OperationReport> {
        match self {
            Outcome::Completed(report) => Some(report.as_ref()),
            Outcome::Skipped(_) => None,
        }
    }

    pub fn skip_reason(&self) -> Option<&SkipReason> {
        match self {
            Outcome::Skipped(reason) => Some(reason),
            Outcome::Completed(_) => None,
        }
    }
}

/// A module attached to the controller.
#[derive(Debug, Clone)]
pub struct ModuleUnderTest {
    pub key: ModuleKey,
    pub identity: ModuleIdentity,
    pub config: ModuleStaticConfig,
    pub bank: FirmwareBankState,
}

impl ModuleUnderTest {
    pub fn state(&self) -> LifecycleState {
        self.bank.state
    }
}

/// Eligibility checks run before an operation.
#[derive(Debug, Clone, Copy)]
struct Gates {
    cmis: bool,
    main_subport: bool,
    download: bool,
}

impl Gates {
    const LIFECYCLE: Gates = Gates {
        cmis: true,
        main_subport: true,
        download: false,
    };
    const DOWNLOAD: Gates = Gates {
        cmis: true,
        main_subport: true,
        download: true,
    };
    /// Any present module, e.g. for port diagnostics.
    const PORT: Gates = Gates {
        cmis: false,
        main_subport: true,
        download: false,
    };
}

/// A download process that ran to completion.
struct DownloadRun {
    lines: Vec<String>,
    exit_code: Option<i32>,
    elapsed: Duration,
}

/// Orchestrates firmware lifecycle operations on a platform.
pub struct FirmwareLifecycleController<P: Platform + ?Sized + 'static> {
    platform: Arc<P>,
    config: LifecycleConfig,
}

impl<P: Platform + ?Sized + 'static> FirmwareLifecycleController<P> {
    pub fn new(platform: Arc<P>, config: LifecycleConfig) -> Self {
        Self { platform, config }
    }

    /// Creates a controller using the `lifecycle` section of `config`.
    pub fn from_static(platform: Arc<P>, config: &StaticConfig) -> Self {
        Self::new(platform, config.lifecycle.clone())
    }

    pub fn platform(&self) -> &Arc<P> {
        &self.platform
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Classifies a module and reads its initial bank state.
    #[instrument(skip(self, key, config), fields(port = %key))]
    pub async fn attach(&self, key: ModuleKey, config: ModuleStaticConfig) -> ModuleUnderTest {
        let identity =
            ModuleIdentity::probe(&*self.platform, &key, self.config.active_cable_policy).await;

        let bank = if identity.is_cmis() {
            match self.platform.read_firmware_info(&key).await {
                Ok(info) => FirmwareBankState::from_info(&info, config.dual_bank_support),
                Err(e) => {
                    warn!(port = %key, error = %e, "Failed to read initial firmware state");
                    FirmwareBankState::unobserved(config.dual_bank_support)
                }
            }
        } else {
            FirmwareBankState::unobserved(config.dual_bank_support)
        };

        ModuleUnderTest {
            key,
            identity,
            config,
            bank,
        }
    }

    /// Attaches every module of `switch` described in `config`.
    pub async fn attach_switch(&self, config: &StaticConfig, switch: &str) -> Vec<ModuleUnderTest> {
        let mut modules = Vec::new();
        for port in config.ports(switch) {
            let key = ModuleKey::new(switch, port);
            if let Some(module_config) = config.module(&key) {
                modules.push(self.attach(key, module_config.clone()).await);
            }
        }
        modules
    }

    // ---- downloads -------------------------------------------------------

    /// Downloads the configured image (`valid`) or a corrupted copy of it.
    ///
    /// A successful valid download records its duration in `history`.
    #[instrument(skip(self, module, history), fields(port = %module.key))]
    pub async fn stage_firmware(
        &self,
        module: &mut ModuleUnderTest,
        valid: bool,
        history: &mut DownloadTimingHistory,
    ) -> LifecycleResult<Outcome> {
        let op = Operation::StageFirmware { valid };
        let image = match self.download_gates(op, module).await? {
            Ok(image) => image,
            Err(reason) => return Ok(self.skip(op, module, reason)),
        };
        let image = if valid {
            image
        } else {
            let header = match module.config.start_cmd_payload_size {
                Some(size) => Some(size),
                None => self.platform.start_cmd_payload_size(&module.key).await?,
            };
            prepare_invalid_image(&image, header).await?
        };

        info!(port = %module.key, image = %image.display(), "Staging firmware");
        let guard = ScopedSetting::suspend_dom_polling(Arc::clone(&self.platform), &module.key).await?;
        let result = self.stage_suspended(op, module, &image, valid, history).await;
        finish_guarded(result, guard.release().await)
    }

    async fn stage_suspended(
        &self,
        op: Operation,
        module: &mut ModuleUnderTest,
        image: &Path,
        valid: bool,
        history: &mut DownloadTimingHistory,
    ) -> LifecycleResult<Outcome> {
        let before = Snapshot::capture(&*self.platform, &module.key).await;

        // until the first operation the module must look as configured
        if module.bank.state == LifecycleState::Idle {
            let mut baseline = ViolationSet::new();
            baseline.check(expect_baseline(
                "active_firmware",
                module.config.active_firmware.as_deref(),
                before.active_version.as_deref(),
                false,
            ));
            baseline.check(expect_baseline(
                "inactive_firmware",
                module.config.inactive_firmware.as_deref(),
                before.inactive_version.as_deref(),
                true,
            ));
            if !baseline.is_empty() {
                return Err(self.violation(op, &module.key, baseline));
            }
        }

        let mut session = self.begin_staging(op, module, before)?;
        let run = match self.run_download(op, module, image).await {
            Ok(run) => run,
            Err(e) => {
                self.abandon_staging(module).await;
                return Err(e);
            }
        };

        let after = Snapshot::capture(&*self.platform, &module.key).await;
        let target = module.config.firmware_valid_image_ver.as_deref();
        let expectations = if valid {
            Expectations::valid_download(target)
        } else {
            Expectations::invalid_download()
        };
        let mut violations = InvariantChecker::new(expectations).diff(session.baseline(), &after);
        if valid {
            violations.check(expect_success_message(&run.lines, DOWNLOAD_SUCCESS));
            violations.check(expect_download_time(
                run.elapsed,
                self.config.max_download_time(),
            ));
        } else {
            violations.check(expect_failure_message(&run.lines, run.exit_code));
        }
        violations.check(self.expect_admin_up(&module.key).await);

        let observed_inactive = after
            .inactive_version
            .clone()
            .unwrap_or_else(|| module.bank.inactive_version.clone());
        if valid && violations.is_empty() {
            module
                .bank
                .finish_staged(observed_inactive)
                .map_err(|e| LifecycleError::illegal_transition(op, &module.key, e))?;
            session.advance(LifecycleState::Staged);
            history.record(&module.key, run.elapsed);
            info!(
                port = %module.key,
                elapsed_s = run.elapsed.as_secs_f64(),
                "Recorded download time"
            );
        } else {
            // the image landed even though another check failed
            let transition = if valid && !violations.contains(Invariant::CompletionMessage) {
                module.bank.finish_failed_with(observed_inactive)
            } else {
                module.bank.finish_failed(&observed_inactive)
            };
            violations.check(expect_transition(LifecycleState::Failed, transition));
            session.advance(LifecycleState::Failed);
        }

        self.conclude(session, violations, after, run.lines)
    }

    /// Starts a download and kills it at `fraction` of the recorded
    /// reference duration for this module.
    #[instrument(skip(self, module, history), fields(port = %module.key))]
    pub async fn interrupt_staging(
        &self,
        module: &mut ModuleUnderTest,
        fraction: f64,
        history: &DownloadTimingHistory,
    ) -> LifecycleResult<Outcome> {
        let op = Operation::InterruptStaging { fraction };
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(LifecycleError::InvalidRequest(format!(
                "interrupt fraction {} is outside (0, 1]",
                fraction
            )));
        }
        let image = match self.download_gates(op, module).await? {
            Ok(image) => image,
            Err(reason) => return Ok(self.skip(op, module, reason)),
        };
        let Some(reference) = history.get(&module.key) else {
            return Ok(self.skip(op, module, SkipReason::NoTimingHistory));
        };
        let minimum = self.config.min_reference_download();
        if reference < minimum {
            return Err(LifecycleError::InvalidTimingHistory {
                module: module.key.clone(),
                reference,
                minimum,
            });
        }

        let delay = reference.mul_f64(fraction);
        info!(
            port = %module.key,
            reference_s = reference.as_secs_f64(),
            delay_s = delay.as_secs_f64(),
            "Interrupting download"
        );
        self.interrupt_download(op, module, &image, delay).await
    }

    /// Starts a download and kills it after the configured kill delay.
    #[instrument(skip(self, module), fields(port = %module.key))]
    pub async fn kill_staging(&self, module: &mut ModuleUnderTest) -> LifecycleResult<Outcome> {
        let delay = self.config.kill_delay();
        let op = Operation::KillStaging { after: delay };
        let image = match self.download_gates(op, module).await? {
            Ok(image) => image,
            Err(reason) => return Ok(self.skip(op, module, reason)),
        };
        info!(port = %module.key, delay_s = delay.as_secs(), "Killing download");
        self.interrupt_download(op, module, &image, delay).await
    }

    /// Runs [`interrupt_staging`](Self::interrupt_staging) for every
    /// configured fraction, stopping at the first skip or failure.
    #[instrument(skip(self, module, history), fields(port = %module.key))]
    pub async fn abort_sweep(
        &self,
        module: &mut ModuleUnderTest,
        history: &DownloadTimingHistory,
    ) -> LifecycleResult<Vec<Outcome>> {
        let mut outcomes = Vec::new();
        for fraction in self.config.abort_fractions.clone() {
            let outcome = self.interrupt_staging(module, fraction, history).await?;
            let skipped = outcome.is_skipped();
            outcomes.push(outcome);
            if skipped {
                break;
            }
        }
        Ok(outcomes)
    }

    async fn interrupt_download(
        &self,
        op: Operation,
        module: &mut ModuleUnderTest,
        image: &Path,
        delay: Duration,
    ) -> LifecycleResult<Outcome> {
        let guard = ScopedSetting::suspend_dom_polling(Arc::clone(&self.platform), &module.key).await?;
        let result = self.interrupt_suspended(op, module, image, delay).await;
        finish_guarded(result, guard.release().await)
    }

    async fn interrupt_suspended(
        &self,
        op: Operation,
        module: &mut ModuleUnderTest,
        image: &Path,
        delay: Duration,
    ) -> LifecycleResult<Outcome> {
        let before = Snapshot::capture(&*self.platform, &module.key).await;
        let mut session = self.begin_staging(op, module, before)?;

        let lines = match self.run_interrupted(op, module, image, delay).await {
            Ok(lines) => lines,
            Err(e) => {
                self.abandon_staging(module).await;
                return Err(e);
            }
        };

        let after = Snapshot::capture(&*self.platform, &module.key).await;
        let mut violations =
            InvariantChecker::new(Expectations::interrupted_download()).diff(session.baseline(), &after);
        violations.check(self.expect_admin_up(&module.key).await);

        let observed_inactive = after
            .inactive_version
            .clone()
            .unwrap_or_else(|| module.bank.inactive_version.clone());
        violations.check(expect_transition(
            LifecycleState::Aborted,
            module.bank.finish_aborted(&observed_inactive),
        ));
        session.advance(LifecycleState::Aborted);

        self.conclude(session, violations, after, lines)
    }

    /// Downloads the configured image with the module held in low-power mode.
    #[instrument(skip(self, module), fields(port = %module.key))]
    pub async fn stage_in_low_power(&self, module: &mut ModuleUnderTest) -> LifecycleResult<Outcome> {
        let op = Operation::StageInLowPower;
        let image = match self.download_gates(op, module).await? {
            Ok(image) => image,
            Err(reason) => return Ok(self.skip(op, module, reason)),
        };
        if !module.identity.supports_lpmode {
            return Ok(self.skip(op, module, SkipReason::NoLowPowerMode));
        }

        let dom = ScopedSetting::suspend_dom_polling(Arc::clone(&self.platform), &module.key).await?;
        let result = self.stage_low_power_suspended(op, module, &image).await;
        finish_guarded(result, dom.release().await)
    }

    async fn stage_low_power_suspended(
        &self,
        op: Operation,
        module: &mut ModuleUnderTest,
        image: &Path,
    ) -> LifecycleResult<Outcome> {
        let lpmode = ScopedSetting::low_power_mode(Arc::clone(&self.platform), &module.key).await?;
        sleep(self.config.lpmode_settle()).await;
        let result = match lpmode.current().await {
            Ok(true) => {
                // entering low-power mode drops the link; the baseline starts here
                let before = Snapshot::capture(&*self.platform, &module.key).await;
                self.stage_low_power_engaged(op, module, image, before).await
            }
            Ok(false) => {
                let mut violations = ViolationSet::new();
                violations.push(Violation::new(Invariant::LowPowerModeNotEngaged, "On", "Off"));
                Err(self.violation(op, &module.key, violations))
            }
            Err(e) => Err(e.into()),
        };
        finish_guarded(result, lpmode.release().await)
    }

    async fn stage_low_power_engaged(
        &self,
        op: Operation,
        module: &mut ModuleUnderTest,
        image: &Path,
        before: Snapshot,
    ) -> LifecycleResult<Outcome> {
        let mut session = self.begin_staging(op, module, before)?;
        let run = match self.run_download(op, module, image).await {
            Ok(run) => run,
            Err(e) => {
                self.abandon_staging(module).await;
                return Err(e);
            }
        };

        let after = Snapshot::capture(&*self.platform, &module.key).await;
        let target = module.config.firmware_valid_image_ver.as_deref();
        let mut violations =
            InvariantChecker::new(Expectations::low_power_download(target)).diff(session.baseline(), &after);
        violations.check(expect_success_message(&run.lines, DOWNLOAD_SUCCESS));

        let observed_inactive = after
            .inactive_version
            .clone()
            .unwrap_or_else(|| module.bank.inactive_version.clone());
        if violations.is_empty() {
            module
                .bank
                .finish_staged(observed_inactive)
                .map_err(|e| LifecycleError::illegal_transition(op, &module.key, e))?;
            session.advance(LifecycleState::Staged);
        } else {
            let transition = if violations.contains(Invariant::CompletionMessage) {
                module.bank.finish_failed(&observed_inactive)
            } else {
                module.bank.finish_failed_with(observed_inactive)
            };
            violations.check(expect_transition(LifecycleState::Failed, transition));
            session.advance(LifecycleState::Failed);
        }

        self.conclude(session, violations, after, run.lines)
    }

    // ---- run / commit ----------------------------------------------------

    /// Switches the module to the staged image.
    #[instrument(skip(self, module), fields(port = %module.key))]
    pub async fn activate_staged(&self, module: &mut ModuleUnderTest) -> LifecycleResult<Outcome> {
        let op = Operation::ActivateStaged;
        if let Some(reason) = self.gates(module, Gates::LIFECYCLE).await? {
            return Ok(self.skip(op, module, reason));
        }
        if module.bank.state != LifecycleState::Staged {
            return Ok(self.skip(
                op,
                module,
                SkipReason::WrongState {
                    required: "staged",
                    actual: module.bank.state,
                },
            ));
        }
        self.with_ports_down(op, module).await
    }

    /// Commits the running image.
    #[instrument(skip(self, module), fields(port = %module.key))]
    pub async fn commit_running(&self, module: &mut ModuleUnderTest) -> LifecycleResult<Outcome> {
        let op = Operation::CommitRunning;
        if let Some(reason) = self.gates(module, Gates::LIFECYCLE).await? {
            return Ok(self.skip(op, module, reason));
        }
        if module.bank.state != LifecycleState::Running {
            return Ok(self.skip(
                op,
                module,
                SkipReason::WrongState {
                    required: "running",
                    actual: module.bank.state,
                },
            ));
        }
        self.with_ports_down(op, module).await
    }

    /// Shuts down every subport, runs `op`, then always starts them again.
    async fn with_ports_down(
        &self,
        op: Operation,
        module: &mut ModuleUnderTest,
    ) -> LifecycleResult<Outcome> {
        let subports = self.platform.subports(&module.key).await?;
        for sub in &subports {
            self.platform.shutdown(sub).await?;
        }
        sleep(self.config.shutdown_settle()).await;

        let result = match ScopedSetting::suspend_dom_polling(Arc::clone(&self.platform), &module.key).await {
            Ok(guard) => {
                let result = self.switch_image(op, module).await;
                finish_guarded(result, guard.release().await)
            }
            Err(e) => Err(e.into()),
        };

        let started = self.startup_all(&subports).await;
        sleep(self.config.startup_settle()).await;
        finish_guarded(result, started)
    }

    async fn switch_image(&self, op: Operation, module: &mut ModuleUnderTest) -> LifecycleResult<Outcome> {
        let before = Snapshot::capture(&*self.platform, &module.key).await;
        let mut session = LifecycleSession::start(op, module.key.clone(), module.bank.state, before);

        let (exec, expectations, marker) = match op {
            Operation::CommitRunning => (
                self.platform.commit_firmware(&module.key).await?,
                Expectations::commit(),
                COMMIT_SUCCESS,
            ),
            _ => (
                self.platform.run_firmware(&module.key).await?,
                Expectations::run(),
                RUN_SUCCESS,
            ),
        };
        let lines: Vec<String> = exec
            .combined_output()
            .lines()
            .map(str::to_string)
            .collect();

        let after = Snapshot::capture(&*self.platform, &module.key).await;
        let mut violations = InvariantChecker::new(expectations).diff(session.baseline(), &after);
        violations.check(expect_success_message(&lines, marker));

        if violations.is_empty() {
            let family = module.identity.family;
            let transition = match (op, after.committed_bank) {
                (Operation::CommitRunning, Some(bank)) => module.bank.commit(family, bank),
                (Operation::CommitRunning, None) => Ok(()),
                _ => module.bank.run(family),
            };
            transition.map_err(|e| LifecycleError::illegal_transition(op, &module.key, e))?;
            session.advance(module.bank.state);
        }

        self.conclude(session, violations, after, lines)
    }

    // ---- resets ----------------------------------------------------------

    /// Resets a module holding a staged (not yet running) image.
    #[instrument(skip(self, module), fields(port = %module.key))]
    pub async fn reset_after_download(&self, module: &mut ModuleUnderTest) -> LifecycleResult<Outcome> {
        let op = Operation::ResetAfterDownload;
        if let Some(reason) = self.gates(module, Gates::LIFECYCLE).await? {
            return Ok(self.skip(op, module, reason));
        }
        if module.bank.state != LifecycleState::Staged {
            return Ok(self.skip(
                op,
                module,
                SkipReason::WrongState {
                    required: "staged",
                    actual: module.bank.state,
                },
            ));
        }
        let expect_link_down = self.config.reset_holds_link_down(&module.key.switch);
        self.reset(op, module, expect_link_down).await
    }

    /// Resets a module after its new image was activated.
    #[instrument(skip(self, module), fields(port = %module.key))]
    pub async fn reset_after_run(&self, module: &mut ModuleUnderTest) -> LifecycleResult<Outcome> {
        let op = Operation::ResetAfterRun;
        if let Some(reason) = self.gates(module, Gates::LIFECYCLE).await? {
            return Ok(self.skip(op, module, reason));
        }
        if !matches!(
            module.bank.state,
            LifecycleState::Running | LifecycleState::Committed
        ) {
            return Ok(self.skip(
                op,
                module,
                SkipReason::WrongState {
                    required: "running or committed",
                    actual: module.bank.state,
                },
            ));
        }
        self.reset(op, module, false).await
    }

    async fn reset(
        &self,
        op: Operation,
        module: &mut ModuleUnderTest,
        expect_link_down: bool,
    ) -> LifecycleResult<Outcome> {
        let guard = ScopedSetting::suspend_dom_polling(Arc::clone(&self.platform), &module.key).await?;
        let result = self.reset_suspended(op, module, expect_link_down).await;
        finish_guarded(result, guard.release().await)
    }

    async fn reset_suspended(
        &self,
        op: Operation,
        module: &mut ModuleUnderTest,
        expect_link_down: bool,
    ) -> LifecycleResult<Outcome> {
        let key = module.key.clone();
        let before = Snapshot::capture(&*self.platform, &key).await;
        let session = LifecycleSession::start(op, key.clone(), module.bank.state, before);

        self.platform.reset_module(&key).await?;
        sleep(self.config.reset_settle()).await;

        let mut violations = ViolationSet::new();
        if expect_link_down {
            let up = self.platform.is_oper_up(&key).await.ok();
            violations.check(expect_flag(Invariant::LinkNotDown, false, up));
        }

        let after = Snapshot::capture(&*self.platform, &key).await;
        violations.extend(
            InvariantChecker::new(banks_untouched(&module.identity)).diff(session.baseline(), &after),
        );

        // clear the reset
        let subports = self.platform.subports(&key).await?;
        for sub in &subports {
            self.platform.shutdown(sub).await?;
        }
        sleep(self.config.shutdown_settle()).await;
        self.startup_all(&subports).await?;
        let recovered = self.wait_link_up(&subports, self.config.startup_settle()).await;
        violations.check(expect_flag(Invariant::LinkNotRecovered, true, Some(recovered)));

        self.conclude(session, violations, after, Vec::new())
    }

    // ---- helpers ---------------------------------------------------------

    /// Presence gate, classification and subport gates as requested, plus
    /// dual bank and image gates for downloads.
    async fn gates(&self, module: &ModuleUnderTest, gates: Gates) -> XcvrResult<Option<SkipReason>> {
        if !self.platform.is_present(&module.key).await? {
            return Ok(Some(SkipReason::NotPresent));
        }
        if gates.cmis {
            if module.identity.is_indeterminate() {
                return Ok(Some(SkipReason::ClassificationIndeterminate));
            }
            if !module.identity.is_cmis() {
                return Ok(Some(SkipReason::NotCmis(module.identity.family)));
            }
        }
        if gates.main_subport {
            let subport = self.platform.subport_index(&module.key).await?;
            if subport > 1 {
                return Ok(Some(SkipReason::NotMainSubport(subport)));
            }
        }
        if gates.download {
            if !module.config.dual_bank_support {
                return Ok(Some(SkipReason::NoDualBank));
            }
            let Some(image) = module.config.firmware_valid_image.as_ref() else {
                return Ok(Some(SkipReason::NoImage));
            };
            if !tokio::fs::try_exists(image).await.unwrap_or(false) {
                return Ok(Some(SkipReason::ImageMissing(image.clone())));
            }
        }
        Ok(None)
    }

    /// Download gates; yields the configured image path when they pass.
    async fn download_gates(
        &self,
        op: Operation,
        module: &ModuleUnderTest,
    ) -> LifecycleResult<Result<PathBuf, SkipReason>> {
        if let Some(reason) = self.gates(module, Gates::DOWNLOAD).await? {
            return Ok(Err(reason));
        }
        if !module.bank.state.can_stage() {
            debug!(port = %module.key, %op, state = %module.bank.state, "Download not allowed");
            return Ok(Err(SkipReason::WrongState {
                required: "idle, staged, aborted, failed or committed",
                actual: module.bank.state,
            }));
        }
        match module.config.firmware_valid_image.clone() {
            Some(image) => Ok(Ok(image)),
            None => Ok(Err(SkipReason::NoImage)),
        }
    }

    fn skip(&self, op: Operation, module: &ModuleUnderTest, reason: SkipReason) -> Outcome {
        info!(port = %module.key, %op, %reason, "Skipped");
        Outcome::Skipped(reason)
    }

    fn begin_staging(
        &self,
        op: Operation,
        module: &mut ModuleUnderTest,
        before: Snapshot,
    ) -> LifecycleResult<LifecycleSession> {
        let mut session = LifecycleSession::start(op, module.key.clone(), module.bank.state, before);
        module
            .bank
            .begin_staging()
            .map_err(|e| LifecycleError::illegal_transition(op, &module.key, e))?;
        session.advance(LifecycleState::Staging);
        Ok(session)
    }

    /// Moves a download that ended in a process control failure to `Failed`.
    async fn abandon_staging(&self, module: &mut ModuleUnderTest) {
        let observed = match self.platform.read_firmware_versions(&module.key).await {
            Ok((_, inactive)) => inactive,
            Err(e) => {
                warn!(port = %module.key, error = %e, "Cannot read versions after failed download");
                module.bank.inactive_version.clone()
            }
        };
        if let Err(e) = module.bank.finish_failed(&observed) {
            warn!(port = %module.key, error = %e, "Inactive bank in unexpected state");
        }
    }

    /// Spawns the download and polls it to completion within the wait bound
    /// for this kind of module.
    async fn run_download(
        &self,
        op: Operation,
        module: &ModuleUnderTest,
        image: &Path,
    ) -> LifecycleResult<DownloadRun> {
        let handle = self.spawn_download(op, module, image).await?;
        let started = Instant::now();
        let result = self.poll_download(op, module, handle, started).await;
        let released = self.platform.release(handle).await;
        let run = result?;
        released?;
        info!(
            port = %module.key,
            elapsed_s = run.elapsed.as_secs_f64(),
            exit_code = ?run.exit_code,
            "Download finished"
        );
        Ok(run)
    }

    async fn poll_download(
        &self,
        op: Operation,
        module: &ModuleUnderTest,
        handle: ProcessHandle,
        started: Instant,
    ) -> LifecycleResult<DownloadRun> {
        let bound = self.config.wait_bound(&module.identity);
        let mut lines = Vec::new();
        loop {
            lines.extend(self.platform.read_output(handle).await?);
            if !self.platform.is_running(handle).await? {
                break;
            }
            if started.elapsed() >= bound {
                self.platform.terminate(handle).await?;
                sleep(self.config.kill_settle()).await;
                if self.platform.is_running(handle).await? {
                    return Err(LifecycleError::process_control(
                        op,
                        &module.key,
                        "failed to kill download process",
                    ));
                }
                return Err(LifecycleError::process_control(
                    op,
                    &module.key,
                    format!("download still running after {}s", bound.as_secs()),
                ));
            }
            sleep(self.config.poll_interval()).await;
        }
        let elapsed = started.elapsed();
        lines.extend(self.platform.read_output(handle).await?);
        let exit_code = self.platform.exit_code(handle).await?;
        for line in &lines {
            debug!(port = %module.key, "{}", line);
        }
        Ok(DownloadRun {
            lines,
            exit_code,
            elapsed,
        })
    }

    /// Spawns the download, terminates it after `delay`, and confirms that
    /// nothing of it is left running.
    async fn run_interrupted(
        &self,
        op: Operation,
        module: &ModuleUnderTest,
        image: &Path,
        delay: Duration,
    ) -> LifecycleResult<Vec<String>> {
        let handle = self.spawn_download(op, module, image).await?;
        let result = self.interrupt(op, module, handle, delay).await;
        let released = self.platform.release(handle).await;
        let lines = result?;
        released?;
        Ok(lines)
    }

    async fn interrupt(
        &self,
        op: Operation,
        module: &ModuleUnderTest,
        handle: ProcessHandle,
        delay: Duration,
    ) -> LifecycleResult<Vec<String>> {
        if !self.platform.is_running(handle).await? {
            return Err(LifecycleError::process_control(
                op,
                &module.key,
                "failed to start download process",
            ));
        }
        sleep(delay).await;

        let mut lines = self.platform.read_output(handle).await?;
        self.platform
            .terminate(handle)
            .await
            .map_err(|e| LifecycleError::process_control(op, &module.key, e.to_string()))?;
        sleep(self.config.kill_settle()).await;
        if self.platform.is_running(handle).await? {
            return Err(LifecycleError::process_control(
                op,
                &module.key,
                "failed to kill download process",
            ));
        }
        lines.extend(self.platform.read_output(handle).await?);
        info!(port = %module.key, after_s = delay.as_secs_f64(), "Download killed");
        Ok(lines)
    }

    async fn spawn_download(
        &self,
        op: Operation,
        module: &ModuleUnderTest,
        image: &Path,
    ) -> LifecycleResult<ProcessHandle> {
        let command = self.platform.download_command(&module.key, image);
        self.platform.spawn(&command).await.map_err(|e| {
            LifecycleError::process_control(op, &module.key, format!("failed to start download: {}", e))
        })
    }

    async fn startup_all(&self, subports: &[ModuleKey]) -> XcvrResult<()> {
        let mut first_error = None;
        for sub in subports {
            if let Err(e) = self.platform.startup(sub).await {
                warn!(port = %sub, error = %e, "Startup failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Polls until every port in `keys` is oper up, or `bound` runs out.
    async fn wait_link_up(&self, keys: &[ModuleKey], bound: Duration) -> bool {
        let deadline = Instant::now() + bound;
        loop {
            let mut all_up = true;
            for key in keys {
                if !matches!(self.platform.is_oper_up(key).await, Ok(true)) {
                    all_up = false;
                    break;
                }
            }
            if all_up {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(self.config.poll_interval()).await;
        }
    }

    async fn expect_admin_up(&self, key: &ModuleKey) -> Option<Violation> {
        let up = self.platform.is_admin_up(key).await.ok();
        expect_flag(Invariant::LinkDown, true, up)
    }

    fn violation(&self, op: Operation, key: &ModuleKey, violations: ViolationSet) -> LifecycleError {
        for v in violations.iter() {
            warn!(port = %key, %op, violation = %v, "Invariant violated");
        }
        LifecycleError::InvariantViolation {
            operation: op,
            module: key.clone(),
            violations,
        }
    }

    fn conclude(
        &self,
        session: LifecycleSession,
        violations: ViolationSet,
        after: Snapshot,
        output: Vec<String>,
    ) -> LifecycleResult<Outcome> {
        if !violations.is_empty() {
            return Err(self.violation(session.operation(), session.module(), violations));
        }
        let report = session.finish(after, output);
        info!(
            port = %report.module,
            op = %report.operation,
            state = %report.final_state,
            elapsed_s = report.elapsed.as_secs_f64(),
            "Operation completed"
        );
        Ok(Outcome::Completed(Box::new(report)))
    }
}

/// Version and bank rules for operations that must leave both banks alone.
/// Non-CMIS modules have no readable banks.
fn banks_untouched(identity: &ModuleIdentity) -> Expectations {
    if identity.is_cmis() {
        Expectations::banks_untouched()
    } else {
        Expectations::default()
    }
}

/// Combines an operation result with the result of restoring a scoped
/// setting. The operation's own error wins.
fn finish_guarded<T>(result: LifecycleResult<T>, restore: XcvrResult<()>) -> LifecycleResult<T> {
    match (result, restore) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(restore_err)) => {
            warn!(error = %restore_err, "Restore failed after operation error");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sonic_xcvr_common::XcvrError;

    #[test]
    fn test_skip_reason_display() {
        assert_eq!(SkipReason::NoDualBank.to_string(), "not dual bank");
        assert_eq!(
            SkipReason::NotCmis(XcvrFamily::Sff8636).to_string(),
            "not CMIS (SFF-8636)"
        );
        assert_eq!(
            SkipReason::NotMainSubport(2).to_string(),
            "not main (sub)port (subport 2)"
        );
        assert_eq!(
            SkipReason::WrongState {
                required: "staged",
                actual: LifecycleState::Idle
            }
            .to_string(),
            "requires staged state, module is idle"
        );
    }

    #[test]
    fn test_finish_guarded_prefers_operation_error() {
        let ok: LifecycleResult<u8> = finish_guarded(Ok(1), Ok(()));
        assert_eq!(ok.unwrap(), 1);

        let restore_failed = finish_guarded(Ok(1), Err(XcvrError::platform("dom", "stuck")));
        assert!(matches!(restore_failed, Err(LifecycleError::Platform(_))));

        let both: LifecycleResult<u8> = finish_guarded(
            Err(LifecycleError::InvalidRequest("bad".to_string())),
            Err(XcvrError::platform("dom", "stuck")),
        );
        assert!(matches!(both, Err(LifecycleError::InvalidRequest(_))));
    }

    #[test]
    fn test_outcome_accessors() {
        let skipped = Outcome::Skipped(SkipReason::NoImage);
        assert!(skipped.is_skipped());
        assert!(!skipped.is_completed());
        assert_eq!(skipped.skip_reason(), Some(&SkipReason::NoImage));
        assert!(skipped.report().is_none());
    }
}

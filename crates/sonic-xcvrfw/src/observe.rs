//! Before/after observations and the invariants checked between them.
//!
//! A [`Snapshot`] is taken immediately before an operation starts and again
//! once it has reached a terminal state. [`InvariantChecker::diff`] compares the
//! two against the [`Expectations`] of the operation and returns every
//! violated invariant with expected and observed values.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::bank::{LifecycleState, TransitionError, CORRUPTED_VERSION};
use crate::platform::{Bank, Counters, FirmwareOps, ModuleKey};

/// Placeholder used for values that could not be read.
pub const UNAVAILABLE: &str = "<unavailable>";

/// Observable module state at one point in time.
///
/// Individual reads may fail; the corresponding field is then `None` and any
/// rule depending on it is reported as violated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub active_version: Option<String>,
    pub inactive_version: Option<String>,
    pub committed_bank: Option<Bank>,
    pub flap_count: Option<u64>,
    pub hw_error_count: Option<u64>,
}

impl Snapshot {
    /// Reads firmware versions, committed bank and both counters.
    pub async fn capture<P>(platform: &P, module: &ModuleKey) -> Self
    where
        P: FirmwareOps + Counters + ?Sized,
    {
        let mut snapshot = Snapshot::default();

        match platform.read_firmware_info(module).await {
            Ok(info) => {
                snapshot.active_version = Some(info.active);
                snapshot.inactive_version = Some(info.inactive);
                snapshot.committed_bank = Some(info.committed);
            }
            Err(e) => warn!(port = %module, error = %e, "Failed to read firmware versions"),
        }

        match platform.read_link_flap_count(module).await {
            Ok(count) => snapshot.flap_count = Some(count),
            Err(e) => warn!(port = %module, error = %e, "Failed to read link flap count"),
        }

        match platform.read_hardware_error_count().await {
            Ok(count) => snapshot.hw_error_count = Some(count),
            Err(e) => warn!(port = %module, error = %e, "Failed to read hardware error count"),
        }

        snapshot
    }
}

/// Named invariant checked by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Invariant {
    ActiveVersion,
    InactiveVersion,
    CommittedBank,
    LinkFlapCount,
    HardwareErrorCount,
    CompletionMessage,
    DownloadTime,
    BaselineMismatch,
    LinkDown,
    LinkNotDown,
    LinkNotRecovered,
    LowPowerModeNotEngaged,
    LowPowerModeNotReleased,
    ModulePresent,
    /// Re-read EEPROM disagrees with the classification taken at attach.
    Identification,
    TerminalState,
}

impl Invariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Invariant::ActiveVersion => "active_version",
            Invariant::InactiveVersion => "inactive_version",
            Invariant::CommittedBank => "committed_bank",
            Invariant::LinkFlapCount => "link_flap_count",
            Invariant::HardwareErrorCount => "hw_error_count",
            Invariant::CompletionMessage => "completion_message",
            Invariant::DownloadTime => "download_time",
            Invariant::BaselineMismatch => "baseline_mismatch",
            Invariant::LinkDown => "link_down",
            Invariant::LinkNotDown => "link_not_down",
            Invariant::LinkNotRecovered => "link_not_recovered",
            Invariant::LowPowerModeNotEngaged => "lpmode_not_engaged",
            Invariant::LowPowerModeNotReleased => "lpmode_not_released",
            Invariant::ModulePresent => "module_present",
            Invariant::Identification => "identification",
            Invariant::TerminalState => "terminal_state",
        }
    }
}

impl fmt::Display for Invariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One violated invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub invariant: Invariant,
    pub expected: String,
    pub observed: String,
}

impl Violation {
    pub fn new(
        invariant: Invariant,
        expected: impl Into<String>,
        observed: impl Into<String>,
    ) -> Self {
        Self {
            invariant,
            expected: expected.into(),
            observed: observed.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected {}, observed {}",
            self.invariant, self.expected, self.observed
        )
    }
}

/// Violations found for one operation; empty iff every invariant held.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ViolationSet {
    violations: Vec<Violation>,
}

impl ViolationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, violation: Violation) {
        self.violations.push(violation);
    }

    /// Appends `violation` if present.
    pub fn check(&mut self, violation: Option<Violation>) {
        if let Some(v) = violation {
            self.push(v);
        }
    }

    pub fn extend(&mut self, other: ViolationSet) {
        self.violations.extend(other.violations);
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.violations.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Violation> {
        self.violations.iter()
    }

    /// Returns true if `invariant` is among the violations.
    pub fn contains(&self, invariant: Invariant) -> bool {
        self.violations.iter().any(|v| v.invariant == invariant)
    }

    /// Returns the first violation of `invariant`.
    pub fn get(&self, invariant: Invariant) -> Option<&Violation> {
        self.violations.iter().find(|v| v.invariant == invariant)
    }
}

impl fmt::Display for ViolationSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, v) in self.violations.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", v)?;
        }
        Ok(())
    }
}

impl IntoIterator for ViolationSet {
    type Item = Violation;
    type IntoIter = std::vec::IntoIter<Violation>;

    fn into_iter(self) -> Self::IntoIter {
        self.violations.into_iter()
    }
}

impl<'a> IntoIterator for &'a ViolationSet {
    type Item = &'a Violation;
    type IntoIter = std::slice::Iter<'a, Violation>;

    fn into_iter(self) -> Self::IntoIter {
        self.violations.iter()
    }
}

/// Expected relation between a version before and after an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum VersionRule {
    /// Not checked.
    Any,
    /// Equal to the version before.
    Unchanged,
    /// Equal to the version before, or the corruption sentinel.
    UnchangedOrCorrupted,
    /// The corruption sentinel.
    Corrupted,
    /// A specific version.
    Is(String),
    /// The inactive version before (bank swap).
    WasInactive,
    /// The active version before (bank swap).
    WasActive,
}

/// Expected relation between a counter before and after an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CounterRule {
    Ignore,
    NoIncrease,
}

/// Expected relation between the committed bank before and after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BankRule {
    Any,
    Unchanged,
    Changed,
}

/// Per-operation set of rules applied by [`InvariantChecker::diff`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Expectations {
    pub active: VersionRule,
    pub inactive: VersionRule,
    pub committed_bank: BankRule,
    pub flaps: CounterRule,
    pub hw_errors: CounterRule,
}

impl Default for Expectations {
    fn default() -> Self {
        Self {
            active: VersionRule::Any,
            inactive: VersionRule::Any,
            committed_bank: BankRule::Any,
            flaps: CounterRule::Ignore,
            hw_errors: CounterRule::Ignore,
        }
    }
}

impl Expectations {
    /// Download of a deliberately corrupted image.
    pub fn invalid_download() -> Self {
        Self {
            active: VersionRule::Unchanged,
            inactive: VersionRule::UnchangedOrCorrupted,
            flaps: CounterRule::NoIncrease,
            committed_bank: BankRule::Unchanged,
            ..Self::default()
        }
    }

    /// Successful download; `target` is the image version if known.
    pub fn valid_download(target: Option<&str>) -> Self {
        Self {
            active: VersionRule::Unchanged,
            inactive: target.map_or(VersionRule::Any, |v| VersionRule::Is(v.to_string())),
            flaps: CounterRule::NoIncrease,
            hw_errors: CounterRule::NoIncrease,
            committed_bank: BankRule::Unchanged,
            ..Self::default()
        }
    }

    /// Download terminated before completion.
    pub fn interrupted_download() -> Self {
        Self {
            active: VersionRule::Unchanged,
            inactive: VersionRule::Corrupted,
            flaps: CounterRule::NoIncrease,
            committed_bank: BankRule::Unchanged,
            ..Self::default()
        }
    }

    /// Download while the module is held in low-power mode.
    pub fn low_power_download(target: Option<&str>) -> Self {
        Self {
            active: VersionRule::Unchanged,
            inactive: target.map_or(VersionRule::Any, |v| VersionRule::Is(v.to_string())),
            flaps: CounterRule::NoIncrease,
            committed_bank: BankRule::Unchanged,
            ..Self::default()
        }
    }

    /// Switch to the inactive image. The ports are already shut down when
    /// the baseline is taken.
    pub fn run() -> Self {
        Self {
            active: VersionRule::WasInactive,
            inactive: VersionRule::WasActive,
            flaps: CounterRule::NoIncrease,
            hw_errors: CounterRule::NoIncrease,
            committed_bank: BankRule::Unchanged,
            ..Self::default()
        }
    }

    /// Commit of the running image.
    pub fn commit() -> Self {
        Self {
            committed_bank: BankRule::Changed,
            flaps: CounterRule::NoIncrease,
            hw_errors: CounterRule::NoIncrease,
            ..Self::default()
        }
    }

    /// Resets, port and power operations: no bank may move. The link drops,
    /// so flaps are not checked.
    pub fn banks_untouched() -> Self {
        Self {
            active: VersionRule::Unchanged,
            inactive: VersionRule::Unchanged,
            committed_bank: BankRule::Unchanged,
            ..Self::default()
        }
    }
}

/// Compares snapshots against an operation's expectations.
#[derive(Debug, Clone)]
pub struct InvariantChecker {
    expectations: Expectations,
}

impl InvariantChecker {
    pub fn new(expectations: Expectations) -> Self {
        Self { expectations }
    }

    pub fn expectations(&self) -> &Expectations {
        &self.expectations
    }

    /// Returns the violations between `before` and `after`.
    pub fn diff(&self, before: &Snapshot, after: &Snapshot) -> ViolationSet {
        let mut violations = ViolationSet::new();
        let exp = &self.expectations;

        violations.check(check_version(
            Invariant::ActiveVersion,
            &exp.active,
            before,
            after.active_version.as_deref(),
            before.active_version.as_deref(),
        ));
        violations.check(check_version(
            Invariant::InactiveVersion,
            &exp.inactive,
            before,
            after.inactive_version.as_deref(),
            before.inactive_version.as_deref(),
        ));
        violations.check(check_bank(
            exp.committed_bank,
            before.committed_bank,
            after.committed_bank,
        ));
        violations.check(check_counter(
            Invariant::LinkFlapCount,
            exp.flaps,
            before.flap_count,
            after.flap_count,
        ));
        violations.check(check_counter(
            Invariant::HardwareErrorCount,
            exp.hw_errors,
            before.hw_error_count,
            after.hw_error_count,
        ));

        violations
    }
}

fn check_version(
    invariant: Invariant,
    rule: &VersionRule,
    before: &Snapshot,
    after: Option<&str>,
    same_before: Option<&str>,
) -> Option<Violation> {
    let expected = match rule {
        VersionRule::Any => return None,
        VersionRule::Unchanged => same_before.map(str::to_string),
        VersionRule::UnchangedOrCorrupted => match same_before {
            Some(prev) if after == Some(prev) || after == Some(CORRUPTED_VERSION) => return None,
            Some(prev) => {
                return Some(Violation::new(
                    invariant,
                    format!("'{}' or '{}'", prev, CORRUPTED_VERSION),
                    display_opt(after),
                ))
            }
            None => None,
        },
        VersionRule::Corrupted => Some(CORRUPTED_VERSION.to_string()),
        VersionRule::Is(v) => Some(v.clone()),
        VersionRule::WasInactive => before.inactive_version.clone(),
        VersionRule::WasActive => before.active_version.clone(),
    };

    match expected {
        Some(e) if after == Some(e.as_str()) => None,
        Some(e) => Some(Violation::new(
            invariant,
            format!("'{}'", e),
            display_opt(after),
        )),
        // no baseline to compare against
        None => Some(Violation::new(
            invariant,
            format!("baseline {}", UNAVAILABLE),
            display_opt(after),
        )),
    }
}

fn check_bank(rule: BankRule, before: Option<Bank>, after: Option<Bank>) -> Option<Violation> {
    let ok = match (rule, before, after) {
        (BankRule::Any, _, _) => return None,
        (BankRule::Unchanged, Some(b), Some(a)) => a == b,
        (BankRule::Changed, Some(b), Some(a)) => a != b,
        _ => false,
    };
    if ok {
        return None;
    }
    let expected = match (rule, before) {
        (_, None) => format!("baseline {}", UNAVAILABLE),
        (BankRule::Changed, Some(b)) => format!("bank other than {}", b),
        (_, Some(b)) => b.to_string(),
    };
    Some(Violation::new(
        Invariant::CommittedBank,
        expected,
        display_bank(after),
    ))
}

fn check_counter(
    invariant: Invariant,
    rule: CounterRule,
    before: Option<u64>,
    after: Option<u64>,
) -> Option<Violation> {
    if rule == CounterRule::Ignore {
        return None;
    }
    match (before, after) {
        (Some(b), Some(a)) if a <= b => None,
        (Some(b), Some(a)) => Some(Violation::new(
            invariant,
            format!("{} (no increase)", b),
            format!("{} (+{})", a, a - b),
        )),
        (b, a) => Some(Violation::new(
            invariant,
            b.map_or_else(|| UNAVAILABLE.to_string(), |b| format!("{} (no increase)", b)),
            a.map_or_else(|| UNAVAILABLE.to_string(), |a| a.to_string()),
        )),
    }
}

fn display_opt(value: Option<&str>) -> String {
    value.map_or_else(|| UNAVAILABLE.to_string(), |v| format!("'{}'", v))
}

fn display_bank(bank: Option<Bank>) -> String {
    bank.map_or_else(|| UNAVAILABLE.to_string(), |b| b.to_string())
}

/// Checks the output of a valid download, run or commit for `marker`
/// (case-insensitive).
pub fn expect_success_message(lines: &[String], marker: &str) -> Option<Violation> {
    let marker = marker.to_lowercase();
    if lines.iter().any(|l| l.to_lowercase().contains(&marker)) {
        None
    } else {
        Some(Violation::new(
            Invariant::CompletionMessage,
            format!("output containing '{}'", marker),
            summarize_output(lines),
        ))
    }
}

/// A corrupted image must fail loudly or produce nothing at all.
pub fn expect_failure_message(lines: &[String], exit_code: Option<i32>) -> Option<Violation> {
    let failed_exit = matches!(exit_code, Some(code) if code != 0);
    let silent = lines.iter().all(|l| l.trim().is_empty());
    let says_fail = lines.iter().any(|l| l.to_lowercase().contains("fail"));
    if failed_exit || silent || says_fail {
        None
    } else {
        Some(Violation::new(
            Invariant::CompletionMessage,
            "no output or output containing 'fail'",
            summarize_output(lines),
        ))
    }
}

/// Download must complete strictly within `max`.
pub fn expect_download_time(elapsed: Duration, max: Duration) -> Option<Violation> {
    (elapsed >= max).then(|| {
        Violation::new(
            Invariant::DownloadTime,
            format!("< {}s", max.as_secs()),
            format!("{:.1}s", elapsed.as_secs_f64()),
        )
    })
}

/// Observed state of a boolean port attribute against what was expected.
pub fn expect_flag(invariant: Invariant, expected: bool, observed: Option<bool>) -> Option<Violation> {
    match observed {
        Some(v) if v == expected => None,
        other => Some(Violation::new(
            invariant,
            expected.to_string(),
            other.map_or_else(|| UNAVAILABLE.to_string(), |v| v.to_string()),
        )),
    }
}

/// Terminal state check: a transition the bank model refused means the
/// module ended somewhere other than `target`.
pub fn expect_transition(
    target: LifecycleState,
    transition: Result<(), TransitionError>,
) -> Option<Violation> {
    transition
        .err()
        .map(|e| Violation::new(Invariant::TerminalState, target.as_str(), e.to_string()))
}

/// Baseline versions must match the static configuration.
pub fn expect_baseline(
    field: &str,
    configured: Option<&str>,
    observed: Option<&str>,
    allow_corrupted: bool,
) -> Option<Violation> {
    let configured = configured?;
    match observed {
        Some(v) if v == configured => None,
        Some(v) if allow_corrupted && v == CORRUPTED_VERSION => None,
        other => Some(Violation::new(
            Invariant::BaselineMismatch,
            format!("{} '{}'", field, configured),
            display_opt(other),
        )),
    }
}

fn summarize_output(lines: &[String]) -> String {
    const MAX_LINES: usize = 5;
    if lines.is_empty() {
        return "no output".to_string();
    }
    let start = lines.len().saturating_sub(MAX_LINES);
    format!("'{}'", lines[start..].join(" | "))
}

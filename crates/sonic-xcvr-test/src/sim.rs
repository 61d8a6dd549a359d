//! Simulated transceiver platform.
//!
//! Implements every collaborator trait the lifecycle controller consumes.
//! Firmware downloads progress on tokio's clock, so tests running with
//! `start_paused = true` drive a 30-minute download in microseconds.
//!
//! Behaviour follows a CMIS module on a SONiC switch:
//! - starting a download erases the inactive bank (reported as `0.0.0`)
//! - a valid image lands in the inactive bank when the download completes
//! - `run` swaps the running bank, `commit` commits the running bank
//! - low-power mode and shutdown take the link down; each drop counts a flap

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use sonic_xcvr_common::shell::ExecResult;
use sonic_xcvr_common::{ProcessControl, ProcessHandle, XcvrError, XcvrResult};
use sonic_xcvrfw::{
    Bank, Counters, EepromReader, FirmwareInfo, FirmwareOps, ModuleControl, ModuleKey,
    PortControl, CORRUPTED_VERSION,
};

/// Program name of the simulated download command.
pub const SIM_DOWNLOAD_CMD: &str = "sim-fw-download";

/// How long an unregistered image takes to be rejected.
pub const DEFAULT_REJECT_TIME: Duration = Duration::from_secs(30);

/// What the module does with an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageBehavior {
    /// Completes after `duration`, leaving `version` in the inactive bank.
    Valid { version: String, duration: Duration },
    /// Rejected after `duration`; the inactive bank stays erased.
    Corrupted { duration: Duration },
}

impl ImageBehavior {
    pub fn valid(version: impl Into<String>, duration: Duration) -> Self {
        ImageBehavior::Valid {
            version: version.into(),
            duration,
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            ImageBehavior::Valid { duration, .. } | ImageBehavior::Corrupted { duration } => {
                *duration
            }
        }
    }
}

/// Misbehaviour to inject into a module.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Link flaps added when a download completes.
    pub flaps_per_download: u64,
    /// I2C errors logged when a download completes.
    pub hw_errors_per_download: u64,
    /// I2C errors logged by `run`.
    pub hw_errors_on_run: u64,
    /// A download that keeps running after being terminated.
    pub survives_terminate: bool,
    /// The download command cannot be started.
    pub spawn_fails: bool,
    /// DOM polling cannot be disabled.
    pub dom_stuck_enabled: bool,
    /// `lpmode on` is accepted but has no effect.
    pub lpmode_ignored: bool,
    /// The link never comes back up.
    pub link_stays_down: bool,
    /// `run` reports failure and leaves the banks alone.
    pub run_fails: bool,
    /// `commit` reports success but the committed bank does not move.
    pub commit_ignored: bool,
    /// A completed download leaves the interface admin down.
    pub admin_down_after_download: bool,
}

/// One simulated module and the port it is plugged into.
#[derive(Debug, Clone)]
pub struct SimModule {
    /// Lower page and page 00h; `None` makes every read fail.
    pub eeprom: Option<Vec<u8>>,
    pub present: bool,
    pub image_a: Option<String>,
    pub image_b: Option<String>,
    pub running: Bank,
    pub committed: Bank,
    pub flaps: u64,
    pub lpmode: bool,
    pub dom_polling: bool,
    pub admin_up: bool,
    pub oper_up: bool,
    pub subport: u8,
    /// Other interfaces of a breakout port.
    pub siblings: Vec<String>,
    pub payload_size: Option<u32>,
    /// False for switches that keep the link up through a module reset.
    pub reset_holds_link_down: bool,
    pub faults: Faults,
}

impl SimModule {
    /// A present, linked-up module running `active` from bank A with
    /// `inactive` in bank B.
    pub fn new(eeprom: Vec<u8>, active: &str, inactive: &str) -> Self {
        Self {
            eeprom: Some(eeprom),
            present: true,
            image_a: Some(active.to_string()),
            image_b: Some(inactive.to_string()),
            running: Bank::A,
            committed: Bank::A,
            flaps: 0,
            lpmode: false,
            dom_polling: true,
            admin_up: true,
            oper_up: true,
            subport: 0,
            siblings: Vec::new(),
            payload_size: Some(112),
            reset_holds_link_down: true,
            faults: Faults::default(),
        }
    }

    pub fn with_faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }

    pub fn with_subport(mut self, subport: u8) -> Self {
        self.subport = subport;
        self
    }

    pub fn with_siblings<I, S>(mut self, siblings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.siblings = siblings.into_iter().map(Into::into).collect();
        self
    }

    pub fn absent(mut self) -> Self {
        self.present = false;
        self.oper_up = false;
        self
    }

    pub fn active_version(&self) -> String {
        self.image(self.running).unwrap_or("N/A").to_string()
    }

    pub fn inactive_version(&self) -> String {
        self.image(self.running.other()).unwrap_or("N/A").to_string()
    }

    fn image(&self, bank: Bank) -> Option<&str> {
        match bank {
            Bank::A => self.image_a.as_deref(),
            Bank::B => self.image_b.as_deref(),
        }
    }

    fn set_inactive(&mut self, version: &str) {
        let slot = match self.running.other() {
            Bank::A => &mut self.image_a,
            Bank::B => &mut self.image_b,
        };
        *slot = Some(version.to_string());
    }

    fn link_down(&mut self) {
        if self.oper_up {
            self.oper_up = false;
            self.flaps += 1;
        }
    }

    fn link_up(&mut self) {
        if self.present && self.admin_up && !self.lpmode && !self.faults.link_stays_down {
            self.oper_up = true;
        }
    }

    fn info(&self) -> FirmwareInfo {
        FirmwareInfo {
            image_a: self.image_a.clone(),
            image_b: self.image_b.clone(),
            factory: None,
            running: self.running,
            committed: self.committed,
            active: self.active_version(),
            inactive: self.inactive_version(),
        }
    }
}

struct SimDownload {
    port: String,
    behavior: ImageBehavior,
    started: Instant,
    pending: Vec<String>,
    exit_code: Option<i32>,
    finished: bool,
    /// Terminated, but survives it.
    orphaned: bool,
    survives_terminate: bool,
}

#[derive(Default)]
struct SimState {
    modules: HashMap<String, SimModule>,
    images: HashMap<PathBuf, ImageBehavior>,
    downloads: HashMap<u64, SimDownload>,
    next_handle: u64,
    hw_errors: u64,
    commands: Vec<String>,
}

impl SimState {
    fn module(&mut self, port: &str) -> XcvrResult<&mut SimModule> {
        self.modules
            .get_mut(port)
            .ok_or_else(|| XcvrError::platform("sim", format!("unknown port {}", port)))
    }

    fn present(&mut self, port: &str) -> XcvrResult<&mut SimModule> {
        let module = self.module(port)?;
        if !module.present {
            return Err(XcvrError::PortNotPresent {
                port: port.to_string(),
            });
        }
        Ok(module)
    }

    /// Completes a download whose time is up.
    fn advance(&mut self, handle: ProcessHandle) -> XcvrResult<&mut SimDownload> {
        let SimState {
            downloads,
            modules,
            hw_errors,
            ..
        } = self;
        let download = downloads
            .get_mut(&handle.id())
            .ok_or_else(|| XcvrError::process(handle.to_string(), "unknown handle"))?;
        if download.finished
            || download.orphaned
            || Instant::now() < download.started + download.behavior.duration()
        {
            return Ok(download);
        }

        download.finished = true;
        let Some(module) = modules.get_mut(&download.port) else {
            return Ok(download);
        };
        match &download.behavior {
            ImageBehavior::Valid { version, .. } => {
                module.set_inactive(version);
                module.flaps += module.faults.flaps_per_download;
                *hw_errors += module.faults.hw_errors_per_download;
                if module.faults.admin_down_after_download {
                    module.admin_up = false;
                    module.link_down();
                }
                download
                    .pending
                    .push("Firmware download complete success".to_string());
                download.exit_code = Some(0);
            }
            ImageBehavior::Corrupted { .. } => {
                download
                    .pending
                    .push("CDB: image validation failed".to_string());
                download.pending.push("Firmware download failed!".to_string());
                download.exit_code = Some(1);
            }
        }
        debug!(port = %download.port, exit_code = ?download.exit_code, "Simulated download finished");
        Ok(download)
    }
}

/// A switch full of simulated modules.
pub struct SimPlatform {
    switch: String,
    state: Mutex<SimState>,
}

impl SimPlatform {
    pub fn new(switch: impl Into<String>) -> Self {
        Self {
            switch: switch.into(),
            state: Mutex::new(SimState::default()),
        }
    }

    /// Plugs `module` into `port`.
    pub fn with_module(self, port: impl Into<String>, module: SimModule) -> Self {
        self.state.lock().modules.insert(port.into(), module);
        self
    }

    /// Declares how the module treats the image at `path`. Unregistered
    /// images are rejected.
    pub fn register_image(&self, path: impl Into<PathBuf>, behavior: ImageBehavior) {
        self.state.lock().images.insert(path.into(), behavior);
    }

    pub fn key(&self, port: &str) -> ModuleKey {
        ModuleKey::new(self.switch.clone(), port)
    }

    /// Copy of a module's current state.
    pub fn module(&self, port: &str) -> Option<SimModule> {
        self.state.lock().modules.get(port).cloned()
    }

    /// Mutates a module in place, e.g. to inject a fault mid-test.
    pub fn update<F>(&self, port: &str, f: F)
    where
        F: FnOnce(&mut SimModule),
    {
        if let Some(module) = self.state.lock().modules.get_mut(port) {
            f(module);
        }
    }

    /// Adds I2C errors to the switch-wide tally.
    pub fn log_hw_errors(&self, count: u64) {
        self.state.lock().hw_errors += count;
    }

    /// Every command issued so far.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// Downloads spawned and not yet finished (including orphans).
    pub fn live_downloads(&self) -> usize {
        self.state
            .lock()
            .downloads
            .values()
            .filter(|d| !d.finished)
            .count()
    }

    fn record(&self, command: String) {
        debug!(command = %command, "Simulated command");
        self.state.lock().commands.push(command);
    }
}

#[async_trait]
impl EepromReader for SimPlatform {
    async fn read_eeprom(&self, module: &ModuleKey, offset: u16, len: usize) -> XcvrResult<Vec<u8>> {
        let mut state = self.state.lock();
        let sim = state.present(&module.port)?;
        let eeprom = sim
            .eeprom
            .as_ref()
            .ok_or_else(|| XcvrError::platform("read-eeprom", "I2C read failed"))?;
        let start = usize::from(offset);
        eeprom
            .get(start..start + len)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| XcvrError::platform("read-eeprom", format!("offset {} out of range", offset)))
    }
}

#[async_trait]
impl PortControl for SimPlatform {
    async fn is_present(&self, module: &ModuleKey) -> XcvrResult<bool> {
        Ok(self.state.lock().module(&module.port)?.present)
    }

    async fn is_admin_up(&self, module: &ModuleKey) -> XcvrResult<bool> {
        Ok(self.state.lock().module(&module.port)?.admin_up)
    }

    async fn is_oper_up(&self, module: &ModuleKey) -> XcvrResult<bool> {
        Ok(self.state.lock().module(&module.port)?.oper_up)
    }

    async fn shutdown(&self, module: &ModuleKey) -> XcvrResult<()> {
        {
            let mut state = self.state.lock();
            let sim = state.module(&module.port)?;
            sim.admin_up = false;
            sim.link_down();
        }
        self.record(format!("shutdown {}", module.port));
        Ok(())
    }

    async fn startup(&self, module: &ModuleKey) -> XcvrResult<()> {
        {
            let mut state = self.state.lock();
            let sim = state.module(&module.port)?;
            sim.admin_up = true;
            sim.link_up();
        }
        self.record(format!("startup {}", module.port));
        Ok(())
    }

    async fn subport_index(&self, module: &ModuleKey) -> XcvrResult<u8> {
        Ok(self.state.lock().module(&module.port)?.subport)
    }

    async fn subports(&self, module: &ModuleKey) -> XcvrResult<Vec<ModuleKey>> {
        let siblings = self.state.lock().module(&module.port)?.siblings.clone();
        let mut keys = vec![module.clone()];
        keys.extend(siblings.into_iter().map(|port| module.sibling(port)));
        Ok(keys)
    }
}

#[async_trait]
impl ModuleControl for SimPlatform {
    async fn reset_module(&self, module: &ModuleKey) -> XcvrResult<()> {
        {
            let mut state = self.state.lock();
            let sim = state.present(&module.port)?;
            if sim.reset_holds_link_down {
                sim.link_down();
            }
        }
        self.record(format!("reset {}", module.port));
        Ok(())
    }

    async fn set_lpmode(&self, module: &ModuleKey, enabled: bool) -> XcvrResult<()> {
        {
            let mut state = self.state.lock();
            let sim = state.present(&module.port)?;
            if !(enabled && sim.faults.lpmode_ignored) {
                sim.lpmode = enabled;
                if enabled {
                    sim.link_down();
                } else {
                    sim.link_up();
                }
            }
        }
        self.record(format!("lpmode {} {}", if enabled { "on" } else { "off" }, module.port));
        Ok(())
    }

    async fn lpmode_enabled(&self, module: &ModuleKey) -> XcvrResult<bool> {
        Ok(self.state.lock().present(&module.port)?.lpmode)
    }

    async fn set_dom_polling(&self, module: &ModuleKey, enabled: bool) -> XcvrResult<()> {
        {
            let mut state = self.state.lock();
            let sim = state.module(&module.port)?;
            sim.dom_polling = enabled || sim.faults.dom_stuck_enabled;
        }
        self.record(format!(
            "dom {} {}",
            module.port,
            if enabled { "enable" } else { "disable" }
        ));
        Ok(())
    }

    async fn dom_polling_enabled(&self, module: &ModuleKey) -> XcvrResult<bool> {
        Ok(self.state.lock().module(&module.port)?.dom_polling)
    }

    async fn start_cmd_payload_size(&self, module: &ModuleKey) -> XcvrResult<Option<u32>> {
        Ok(self.state.lock().present(&module.port)?.payload_size)
    }
}

#[async_trait]
impl FirmwareOps for SimPlatform {
    async fn read_firmware_info(&self, module: &ModuleKey) -> XcvrResult<FirmwareInfo> {
        Ok(self.state.lock().present(&module.port)?.info())
    }

    fn download_command(&self, module: &ModuleKey, image: &Path) -> String {
        format!("{} {} {}", SIM_DOWNLOAD_CMD, module.port, image.display())
    }

    async fn run_firmware(&self, module: &ModuleKey) -> XcvrResult<ExecResult> {
        self.record(format!("firmware run {}", module.port));
        let mut state = self.state.lock();
        let errors = {
            let sim = state.present(&module.port)?;
            if sim.faults.run_fails {
                return Ok(ExecResult {
                    exit_code: 1,
                    stdout: "Firmware run in mode=0 failed".to_string(),
                    stderr: String::new(),
                });
            }
            sim.running = sim.running.other();
            sim.faults.hw_errors_on_run
        };
        state.hw_errors += errors;
        Ok(ExecResult {
            exit_code: 0,
            stdout: "Firmware run in mode=0 success".to_string(),
            stderr: String::new(),
        })
    }

    async fn commit_firmware(&self, module: &ModuleKey) -> XcvrResult<ExecResult> {
        self.record(format!("firmware commit {}", module.port));
        let mut state = self.state.lock();
        let sim = state.present(&module.port)?;
        if !sim.faults.commit_ignored {
            sim.committed = sim.running;
        }
        Ok(ExecResult {
            exit_code: 0,
            stdout: "Firmware commit successful".to_string(),
            stderr: String::new(),
        })
    }
}

#[async_trait]
impl Counters for SimPlatform {
    async fn read_link_flap_count(&self, module: &ModuleKey) -> XcvrResult<u64> {
        Ok(self.state.lock().module(&module.port)?.flaps)
    }

    async fn read_hardware_error_count(&self) -> XcvrResult<u64> {
        Ok(self.state.lock().hw_errors)
    }
}

#[async_trait]
impl ProcessControl for SimPlatform {
    async fn spawn(&self, command: &str) -> XcvrResult<ProcessHandle> {
        self.record(command.to_string());
        let mut parts = command.splitn(3, ' ');
        let (Some(SIM_DOWNLOAD_CMD), Some(port), Some(path)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(XcvrError::process(command, "unknown command"));
        };

        let mut state = self.state.lock();
        let behavior = state
            .images
            .get(Path::new(path))
            .cloned()
            .unwrap_or(ImageBehavior::Corrupted {
                duration: DEFAULT_REJECT_TIME,
            });
        let sim = state.present(port)?;
        if sim.faults.spawn_fails {
            return Err(XcvrError::process(command, "fork failed"));
        }
        sim.set_inactive(CORRUPTED_VERSION);
        let survives_terminate = sim.faults.survives_terminate;

        state.next_handle += 1;
        let id = state.next_handle;
        state.downloads.insert(
            id,
            SimDownload {
                port: port.to_string(),
                behavior,
                started: Instant::now(),
                pending: vec![format!("Downloading {} to {}", path, port)],
                exit_code: None,
                finished: false,
                orphaned: false,
                survives_terminate,
            },
        );
        Ok(ProcessHandle::new(id))
    }

    async fn is_running(&self, handle: ProcessHandle) -> XcvrResult<bool> {
        Ok(!self.state.lock().advance(handle)?.finished)
    }

    async fn exit_code(&self, handle: ProcessHandle) -> XcvrResult<Option<i32>> {
        Ok(self.state.lock().advance(handle)?.exit_code)
    }

    async fn read_output(&self, handle: ProcessHandle) -> XcvrResult<Vec<String>> {
        Ok(std::mem::take(&mut self.state.lock().advance(handle)?.pending))
    }

    async fn terminate(&self, handle: ProcessHandle) -> XcvrResult<()> {
        let mut state = self.state.lock();
        let download = state.advance(handle)?;
        if download.finished {
            return Ok(());
        }
        if download.survives_terminate {
            download.orphaned = true;
        } else {
            download.finished = true;
            download.exit_code = Some(143);
            download.pending.push("Terminated".to_string());
        }
        Ok(())
    }

    async fn release(&self, handle: ProcessHandle) -> XcvrResult<()> {
        let mut state = self.state.lock();
        let orphaned = match state.downloads.get(&handle.id()) {
            Some(download) => download.orphaned,
            None => return Err(XcvrError::process(handle.to_string(), "unknown handle")),
        };
        // an orphan outlives its handle
        if !orphaned {
            state.downloads.remove(&handle.id());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::eeprom;
    use pretty_assertions::assert_eq;

    fn platform() -> SimPlatform {
        SimPlatform::new("sw1").with_module(
            "Ethernet0",
            SimModule::new(eeprom::cmis_optical(), "1.0.0", "0.9.0"),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_valid_download_lands_in_inactive_bank() {
        let sim = platform();
        sim.register_image("/fw/good.bin", ImageBehavior::valid("1.1.0", Duration::from_secs(120)));
        let key = sim.key("Ethernet0");

        let handle = sim
            .spawn(&sim.download_command(&key, Path::new("/fw/good.bin")))
            .await
            .unwrap();
        assert!(sim.is_running(handle).await.unwrap());
        assert_eq!(sim.module("Ethernet0").unwrap().inactive_version(), CORRUPTED_VERSION);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!sim.is_running(handle).await.unwrap());
        assert_eq!(sim.exit_code(handle).await.unwrap(), Some(0));
        let output = sim.read_output(handle).await.unwrap();
        assert_eq!(output.last().unwrap(), "Firmware download complete success");
        assert!(sim.read_output(handle).await.unwrap().is_empty());
        sim.release(handle).await.unwrap();

        let info = sim.read_firmware_info(&key).await.unwrap();
        assert_eq!(info.active, "1.0.0");
        assert_eq!(info.inactive, "1.1.0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_and_survivor() {
        let sim = platform();
        let key = sim.key("Ethernet0");
        let handle = sim
            .spawn(&sim.download_command(&key, Path::new("/fw/unknown.bin")))
            .await
            .unwrap();
        sim.terminate(handle).await.unwrap();
        assert!(!sim.is_running(handle).await.unwrap());
        assert_eq!(sim.exit_code(handle).await.unwrap(), Some(143));

        sim.update("Ethernet0", |m| m.faults.survives_terminate = true);
        let handle = sim
            .spawn(&sim.download_command(&key, Path::new("/fw/unknown.bin")))
            .await
            .unwrap();
        sim.terminate(handle).await.unwrap();
        tokio::time::sleep(DEFAULT_REJECT_TIME * 2).await;
        assert!(sim.is_running(handle).await.unwrap());
        sim.release(handle).await.unwrap();
        assert_eq!(sim.live_downloads(), 1);
    }

    #[tokio::test]
    async fn test_run_and_commit_move_banks() {
        let sim = platform();
        let key = sim.key("Ethernet0");
        sim.run_firmware(&key).await.unwrap();
        let info = sim.read_firmware_info(&key).await.unwrap();
        assert_eq!((info.active.as_str(), info.inactive.as_str()), ("0.9.0", "1.0.0"));
        assert_eq!(info.committed, Bank::A);

        let out = sim.commit_firmware(&key).await.unwrap();
        assert!(out.success());
        assert_eq!(sim.read_firmware_info(&key).await.unwrap().committed, Bank::B);
    }

    #[tokio::test]
    async fn test_absent_module_is_not_present_error() {
        let sim = platform().with_module(
            "Ethernet8",
            SimModule::new(eeprom::cmis_optical(), "1.0.0", "0.9.0").absent(),
        );
        let key = sim.key("Ethernet8");
        assert!(!sim.is_present(&key).await.unwrap());
        match sim.read_firmware_info(&key).await {
            Err(XcvrError::PortNotPresent { port }) => assert_eq!(port, "Ethernet8"),
            other => panic!("expected PortNotPresent, got {:?}", other),
        }
        assert!(matches!(
            sim.set_lpmode(&key, true).await,
            Err(XcvrError::PortNotPresent { .. })
        ));
    }

    #[tokio::test]
    async fn test_link_drops_count_as_flaps() {
        let sim = platform();
        let key = sim.key("Ethernet0");
        sim.set_lpmode(&key, true).await.unwrap();
        assert!(!sim.is_oper_up(&key).await.unwrap());
        sim.set_lpmode(&key, false).await.unwrap();
        sim.shutdown(&key).await.unwrap();
        sim.startup(&key).await.unwrap();
        assert!(sim.is_oper_up(&key).await.unwrap());
        assert_eq!(sim.read_link_flap_count(&key).await.unwrap(), 2);
    }
}

//! Collaborator interfaces consumed by the lifecycle controller.
//!
//! The controller never talks to hardware directly. Everything it observes or
//! drives goes through these traits, implemented for a real switch by
//! [`crate::SfputilPlatform`] and by the simulated platform in the test crate.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use sonic_xcvr_common::shell::ExecResult;
use sonic_xcvr_common::{ProcessControl, XcvrResult};

/// Identifies a module under test: the switch and the port it is plugged into.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleKey {
    /// Switch (host) name.
    pub switch: String,
    /// Port alias, e.g. `Ethernet0`.
    pub port: String,
}

impl ModuleKey {
    /// Creates a new module key.
    pub fn new(switch: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            switch: switch.into(),
            port: port.into(),
        }
    }

    /// Returns a key for another port on the same switch.
    pub fn sibling(&self, port: impl Into<String>) -> Self {
        Self::new(self.switch.clone(), port)
    }
}

impl fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.switch, self.port)
    }
}

/// One of the two firmware storage banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Bank {
    A,
    B,
}

impl Bank {
    /// Returns the other bank.
    pub const fn other(&self) -> Bank {
        match self {
            Bank::A => Bank::B,
            Bank::B => Bank::A,
        }
    }
}

impl fmt::Display for Bank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bank::A => write!(f, "A"),
            Bank::B => write!(f, "B"),
        }
    }
}

impl FromStr for Bank {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "A" | "a" => Ok(Bank::A),
            "B" | "b" => Ok(Bank::B),
            other => Err(format!("invalid bank '{}'", other)),
        }
    }
}

/// Firmware state as reported by the module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareInfo {
    /// Version stored in bank A, `None` if empty or not reported.
    pub image_a: Option<String>,
    /// Version stored in bank B.
    pub image_b: Option<String>,
    /// Factory image version.
    pub factory: Option<String>,
    /// Bank the module is currently running from.
    pub running: Bank,
    /// Bank the module boots from.
    pub committed: Bank,
    /// Version of the running image.
    pub active: String,
    /// Version of the other bank's image.
    pub inactive: String,
}

impl FirmwareInfo {
    /// Returns the version stored in `bank`.
    pub fn image(&self, bank: Bank) -> Option<&str> {
        match bank {
            Bank::A => self.image_a.as_deref(),
            Bank::B => self.image_b.as_deref(),
        }
    }
}

/// Raw register access.
#[async_trait]
pub trait EepromReader: Send + Sync {
    /// Reads `len` bytes at `offset` from the module's EEPROM (page 00h / A0h).
    async fn read_eeprom(&self, module: &ModuleKey, offset: u16, len: usize)
        -> XcvrResult<Vec<u8>>;
}

/// Interface (port) level control and status.
#[async_trait]
pub trait PortControl: Send + Sync {
    /// Returns true if a transceiver is plugged in.
    async fn is_present(&self, module: &ModuleKey) -> XcvrResult<bool>;

    /// Returns true if the interface is administratively up.
    async fn is_admin_up(&self, module: &ModuleKey) -> XcvrResult<bool>;

    /// Returns true if the link is operationally up.
    async fn is_oper_up(&self, module: &ModuleKey) -> XcvrResult<bool>;

    /// Administratively shuts the interface down.
    async fn shutdown(&self, module: &ModuleKey) -> XcvrResult<()>;

    /// Administratively brings the interface up.
    async fn startup(&self, module: &ModuleKey) -> XcvrResult<()>;

    /// Breakout subport index: 0 for no breakout, 1 for the first subport.
    async fn subport_index(&self, module: &ModuleKey) -> XcvrResult<u8>;

    /// All interfaces sharing the physical port, including `module` itself.
    async fn subports(&self, module: &ModuleKey) -> XcvrResult<Vec<ModuleKey>>;
}

/// Module level control.
#[async_trait]
pub trait ModuleControl: Send + Sync {
    /// Issues a hardware reset of the module.
    async fn reset_module(&self, module: &ModuleKey) -> XcvrResult<()>;

    /// Enables or disables low-power mode.
    async fn set_lpmode(&self, module: &ModuleKey, enabled: bool) -> XcvrResult<()>;

    /// Returns true if low-power mode is reported on.
    async fn lpmode_enabled(&self, module: &ModuleKey) -> XcvrResult<bool>;

    /// Enables or disables DOM polling for the port.
    async fn set_dom_polling(&self, module: &ModuleKey, enabled: bool) -> XcvrResult<()>;

    /// Returns true if DOM polling is enabled for the port.
    async fn dom_polling_enabled(&self, module: &ModuleKey) -> XcvrResult<bool>;

    /// CDB `StartCmdPayloadSize`: image header bytes not downloaded to the module.
    async fn start_cmd_payload_size(&self, module: &ModuleKey) -> XcvrResult<Option<u32>>;
}

/// Firmware management.
#[async_trait]
pub trait FirmwareOps: Send + Sync {
    /// Reads the full firmware state.
    async fn read_firmware_info(&self, module: &ModuleKey) -> XcvrResult<FirmwareInfo>;

    /// Reads `(active, inactive)` versions.
    async fn read_firmware_versions(&self, module: &ModuleKey) -> XcvrResult<(String, String)> {
        let info = self.read_firmware_info(module).await?;
        Ok((info.active, info.inactive))
    }

    /// Reads the committed bank and the version stored in it.
    async fn read_committed_bank(&self, module: &ModuleKey) -> XcvrResult<(Bank, Option<String>)> {
        let info = self.read_firmware_info(module).await?;
        let version = info.image(info.committed).map(str::to_string);
        Ok((info.committed, version))
    }

    /// Builds the command that downloads `image` to the inactive bank.
    fn download_command(&self, module: &ModuleKey, image: &Path) -> String;

    /// Switches the module to the inactive image.
    async fn run_firmware(&self, module: &ModuleKey) -> XcvrResult<ExecResult>;

    /// Commits the running image.
    async fn commit_firmware(&self, module: &ModuleKey) -> XcvrResult<ExecResult>;
}

/// Stability counters.
#[async_trait]
pub trait Counters: Send + Sync {
    /// Link flap count of the interface.
    async fn read_link_flap_count(&self, module: &ModuleKey) -> XcvrResult<u64>;

    /// Switch-wide tally of I2C-class hardware error events.
    async fn read_hardware_error_count(&self) -> XcvrResult<u64>;
}

/// Everything the lifecycle controller needs from a switch.
pub trait Platform:
    EepromReader + PortControl + ModuleControl + FirmwareOps + Counters + ProcessControl
{
}

impl<T> Platform for T where
    T: EepromReader + PortControl + ModuleControl + FirmwareOps + Counters + ProcessControl
{
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_key_display() {
        let key = ModuleKey::new("sonic-sw1", "Ethernet8");
        assert_eq!(key.to_string(), "sonic-sw1/Ethernet8");
        assert_eq!(key.sibling("Ethernet10").port, "Ethernet10");
        assert_eq!(key.sibling("Ethernet10").switch, "sonic-sw1");
    }

    #[test]
    fn test_bank_parse_and_other() {
        assert_eq!("A".parse::<Bank>(), Ok(Bank::A));
        assert_eq!(" B ".parse::<Bank>(), Ok(Bank::B));
        assert!("C".parse::<Bank>().is_err());
        assert_eq!(Bank::A.other(), Bank::B);
        assert_eq!(Bank::B.other(), Bank::A);
    }

    #[test]
    fn test_firmware_info_image() {
        let info = FirmwareInfo {
            image_a: Some("1.0.0".to_string()),
            image_b: None,
            factory: None,
            running: Bank::A,
            committed: Bank::A,
            active: "1.0.0".to_string(),
            inactive: "N/A".to_string(),
        };
        assert_eq!(info.image(Bank::A), Some("1.0.0"));
        assert_eq!(info.image(Bank::B), None);
    }
}

//! Static transceiver configuration and lifecycle tunables.
//!
//! Loads the per-switch, per-port description of the installed modules
//! (`transceiver_static_info.yaml`) plus an optional `lifecycle` section with
//! every timing constant the controller uses.
//!
//! ```yaml
//! topology:
//!   sonic-sw1:
//!     Ethernet0:
//!       active_firmware: "1.2.3"
//!       inactive_firmware: "1.2.0"
//!       dual_bank_support: true
//!       firmware_valid_image: /tmp/fw/module_1_3_0.bin
//!       firmware_valid_image_ver: "1.3.0"
//!       start_cmd_payload_size: 112
//! lifecycle:
//!   kill_delay_secs: 20
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use sonic_xcvr_common::{XcvrError, XcvrResult};

use crate::classifier::ActiveCablePolicy;
use crate::identity::ModuleIdentity;
use crate::platform::ModuleKey;

/// Default location of the static description.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/sonic/transceiver_static_info.yaml";

const PORT_PREFIX: &str = "Ethernet";

/// What is known in advance about one installed module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleStaticConfig {
    /// Active version before the test run.
    #[serde(default, deserialize_with = "version_string")]
    pub active_firmware: Option<String>,

    /// Inactive version before the test run.
    #[serde(default, deserialize_with = "version_string")]
    pub inactive_firmware: Option<String>,

    #[serde(default)]
    pub dual_bank_support: bool,

    /// Image to download.
    #[serde(default)]
    pub firmware_valid_image: Option<PathBuf>,

    /// Version contained in `firmware_valid_image`, if known.
    #[serde(default, deserialize_with = "version_string")]
    pub firmware_valid_image_ver: Option<String>,

    /// CDB `StartCmdPayloadSize` of the module. Read from the module when
    /// absent.
    #[serde(default)]
    pub start_cmd_payload_size: Option<u32>,
}

/// YAML versions may be written unquoted (`1.2`), which parses as a number.
fn version_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<serde_yaml::Value>::deserialize(deserializer)? {
        None | Some(serde_yaml::Value::Null) => Ok(None),
        Some(serde_yaml::Value::String(s)) => Ok(Some(s)),
        Some(serde_yaml::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(D::Error::custom(format!(
            "expected a version string, found {:?}",
            other
        ))),
    }
}

/// Timing and policy knobs for the lifecycle controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Download process poll cadence in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// A valid download must finish within this many seconds
    #[serde(default = "default_max_download_secs")]
    pub max_download_secs: u64,

    /// Process wait bound for coherent modules
    #[serde(default = "default_coherent_wait_secs")]
    pub coherent_wait_secs: u64,

    /// Process wait bound for other optical modules
    #[serde(default = "default_optical_wait_secs")]
    pub optical_wait_secs: u64,

    /// Process wait bound for electrical (direct attach) modules
    #[serde(default = "default_electrical_wait_secs")]
    pub electrical_wait_secs: u64,

    /// Delay before a download is killed by KillStaging
    #[serde(default = "default_kill_delay_secs")]
    pub kill_delay_secs: u64,

    /// Wait after terminating a download before checking it is gone
    #[serde(default = "default_kill_settle_ms")]
    pub kill_settle_ms: u64,

    #[serde(default = "default_shutdown_settle_secs")]
    pub shutdown_settle_secs: u64,

    /// Also the bound for the link to recover after startup
    #[serde(default = "default_startup_settle_secs")]
    pub startup_settle_secs: u64,

    #[serde(default = "default_reset_settle_secs")]
    pub reset_settle_secs: u64,

    #[serde(default = "default_lpmode_settle_secs")]
    pub lpmode_settle_secs: u64,

    /// Bound for the link to come up in port diagnostics
    #[serde(default = "default_link_up_secs")]
    pub link_up_secs: u64,

    /// Same, for coherent modules
    #[serde(default = "default_coherent_link_up_secs")]
    pub coherent_link_up_secs: u64,

    /// Shutdown/startup cycles of the link stress check
    #[serde(default = "default_link_stress_cycles")]
    pub link_stress_cycles: u32,

    /// Shortest reference download usable by the abort sweep
    #[serde(default = "default_min_reference_download_secs")]
    pub min_reference_download_secs: u64,

    /// Interrupt points of the abort sweep, as fractions of the reference
    #[serde(default = "default_abort_fractions")]
    pub abort_fractions: Vec<f64>,

    /// How CMIS "active cable" modules are classified
    #[serde(default)]
    pub active_cable_policy: ActiveCablePolicy,

    /// Switches whose module reset does not take the link down
    #[serde(default = "default_reset_keeps_link_up")]
    pub reset_keeps_link_up: Vec<String>,
}

// Default functions
fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_download_secs() -> u64 {
    1800
}

fn default_coherent_wait_secs() -> u64 {
    3600
}

fn default_optical_wait_secs() -> u64 {
    1800
}

fn default_electrical_wait_secs() -> u64 {
    900
}

fn default_kill_delay_secs() -> u64 {
    20
}

fn default_kill_settle_ms() -> u64 {
    500
}

fn default_shutdown_settle_secs() -> u64 {
    3
}

fn default_startup_settle_secs() -> u64 {
    20
}

fn default_reset_settle_secs() -> u64 {
    5
}

fn default_lpmode_settle_secs() -> u64 {
    3
}

fn default_link_up_secs() -> u64 {
    60
}

fn default_coherent_link_up_secs() -> u64 {
    180
}

fn default_link_stress_cycles() -> u32 {
    100
}

fn default_min_reference_download_secs() -> u64 {
    100
}

fn default_abort_fractions() -> Vec<f64> {
    vec![0.2, 0.4, 0.6, 0.8, 0.98]
}

fn default_reset_keeps_link_up() -> Vec<String> {
    vec!["Arista-7050CX3-32S-C32".to_string()]
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_download_secs: default_max_download_secs(),
            coherent_wait_secs: default_coherent_wait_secs(),
            optical_wait_secs: default_optical_wait_secs(),
            electrical_wait_secs: default_electrical_wait_secs(),
            kill_delay_secs: default_kill_delay_secs(),
            kill_settle_ms: default_kill_settle_ms(),
            shutdown_settle_secs: default_shutdown_settle_secs(),
            startup_settle_secs: default_startup_settle_secs(),
            reset_settle_secs: default_reset_settle_secs(),
            lpmode_settle_secs: default_lpmode_settle_secs(),
            link_up_secs: default_link_up_secs(),
            coherent_link_up_secs: default_coherent_link_up_secs(),
            link_stress_cycles: default_link_stress_cycles(),
            min_reference_download_secs: default_min_reference_download_secs(),
            abort_fractions: default_abort_fractions(),
            active_cable_policy: ActiveCablePolicy::default(),
            reset_keeps_link_up: default_reset_keeps_link_up(),
        }
    }
}

impl LifecycleConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_download_time(&self) -> Duration {
        Duration::from_secs(self.max_download_secs)
    }

    /// How long to wait for a download process on this kind of module.
    pub fn wait_bound(&self, identity: &ModuleIdentity) -> Duration {
        let secs = if identity.is_coherent {
            self.coherent_wait_secs
        } else if identity.is_optical {
            self.optical_wait_secs
        } else {
            self.electrical_wait_secs
        };
        Duration::from_secs(secs)
    }

    pub fn kill_delay(&self) -> Duration {
        Duration::from_secs(self.kill_delay_secs)
    }

    pub fn kill_settle(&self) -> Duration {
        Duration::from_millis(self.kill_settle_ms)
    }

    pub fn shutdown_settle(&self) -> Duration {
        Duration::from_secs(self.shutdown_settle_secs)
    }

    pub fn startup_settle(&self) -> Duration {
        Duration::from_secs(self.startup_settle_secs)
    }

    pub fn reset_settle(&self) -> Duration {
        Duration::from_secs(self.reset_settle_secs)
    }

    pub fn lpmode_settle(&self) -> Duration {
        Duration::from_secs(self.lpmode_settle_secs)
    }

    /// How long port diagnostics wait for the link on this kind of module.
    pub fn link_up_bound(&self, identity: &ModuleIdentity) -> Duration {
        if identity.is_coherent {
            Duration::from_secs(self.coherent_link_up_secs)
        } else {
            Duration::from_secs(self.link_up_secs)
        }
    }

    pub fn min_reference_download(&self) -> Duration {
        Duration::from_secs(self.min_reference_download_secs)
    }

    /// Returns true if a module reset is expected to take the link down.
    pub fn reset_holds_link_down(&self, switch: &str) -> bool {
        !self.reset_keeps_link_up.iter().any(|s| s == switch)
    }

    /// Validate configuration
    pub fn validate(&self) -> XcvrResult<()> {
        if self.poll_interval_ms == 0 {
            return Err(XcvrError::invalid_config(
                "lifecycle.poll_interval_ms",
                "must be > 0",
            ));
        }

        for (field, value) in [
            ("lifecycle.max_download_secs", self.max_download_secs),
            ("lifecycle.coherent_wait_secs", self.coherent_wait_secs),
            ("lifecycle.optical_wait_secs", self.optical_wait_secs),
            ("lifecycle.electrical_wait_secs", self.electrical_wait_secs),
            ("lifecycle.link_up_secs", self.link_up_secs),
            ("lifecycle.coherent_link_up_secs", self.coherent_link_up_secs),
        ] {
            if value == 0 {
                return Err(XcvrError::invalid_config(field, "must be > 0"));
            }
        }

        if let Some(f) = self
            .abort_fractions
            .iter()
            .find(|f| !(**f > 0.0 && **f <= 1.0))
        {
            return Err(XcvrError::invalid_config(
                "lifecycle.abort_fractions",
                format!("{} is outside (0, 1]", f),
            ));
        }

        Ok(())
    }
}

/// The whole static description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticConfig {
    /// switch name -> port alias -> module description
    #[serde(default)]
    pub topology: BTreeMap<String, BTreeMap<String, ModuleStaticConfig>>,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

impl StaticConfig {
    /// Parses and validates a YAML document.
    pub fn from_yaml_str(content: &str) -> XcvrResult<Self> {
        let config: StaticConfig = serde_yaml::from_str(content)
            .map_err(|e| XcvrError::invalid_config("yaml", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a YAML file.
    pub fn load(path: impl AsRef<Path>) -> XcvrResult<Self> {
        let path = path.as_ref();
        let content =
            fs::read_to_string(path).map_err(|e| XcvrError::io(path.display().to_string(), e))?;
        Self::from_yaml_str(&content)
    }

    /// Loads from [`DEFAULT_CONFIG_PATH`].
    pub fn load_default() -> XcvrResult<Self> {
        Self::load(DEFAULT_CONFIG_PATH)
    }

    /// Validate configuration
    pub fn validate(&self) -> XcvrResult<()> {
        if self.topology.is_empty() {
            return Err(XcvrError::invalid_config(
                "topology",
                "at least one switch is required",
            ));
        }

        for (switch, ports) in &self.topology {
            if switch.len() <= 3 {
                return Err(XcvrError::invalid_config(
                    format!("topology.{}", switch),
                    "switch name must be longer than 3 characters",
                ));
            }
            if ports.is_empty() {
                return Err(XcvrError::invalid_config(
                    format!("topology.{}", switch),
                    "at least one port is required",
                ));
            }
            for port in ports.keys() {
                if !port.starts_with(PORT_PREFIX) || port.len() <= PORT_PREFIX.len() {
                    return Err(XcvrError::invalid_config(
                        format!("topology.{}.{}", switch, port),
                        "port name must be Ethernet<N>",
                    ));
                }
            }
        }

        self.lifecycle.validate()
    }

    /// Returns the description of one module.
    pub fn module(&self, key: &ModuleKey) -> Option<&ModuleStaticConfig> {
        self.topology.get(&key.switch)?.get(&key.port)
    }

    /// Returns the configured switch names.
    pub fn switches(&self) -> impl Iterator<Item = &str> {
        self.topology.keys().map(String::as_str)
    }

    /// Ports of `switch`, ordered by their numeric suffix.
    pub fn ports(&self, switch: &str) -> Vec<&str> {
        let mut ports: Vec<&str> = self
            .topology
            .get(switch)
            .map(|p| p.keys().map(String::as_str).collect())
            .unwrap_or_default();
        ports.sort_by_key(|p| port_number(p));
        ports
    }

    /// Every configured module, switch by switch in port order.
    pub fn modules(&self) -> Vec<ModuleKey> {
        self.switches()
            .flat_map(|switch| {
                self.ports(switch)
                    .into_iter()
                    .map(move |port| ModuleKey::new(switch, port))
            })
            .collect()
    }
}

fn port_number(port: &str) -> u32 {
    port.strip_prefix(PORT_PREFIX)
        .and_then(|n| n.parse().ok())
        .unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const SAMPLE: &str = r#"
topology:
  sonic-sw1:
    Ethernet8:
      active_firmware: "1.2.3"
      inactive_firmware: 1.2
      dual_bank_support: true
      firmware_valid_image: /tmp/fw/img.bin
      firmware_valid_image_ver: "1.3.0"
      start_cmd_payload_size: 112
    Ethernet0:
      active_firmware: "2.0.0"
      dual_bank_support: false
    Ethernet16:
      active_firmware: "2.0.0"
lifecycle:
  kill_delay_secs: 5
  abort_fractions: [0.5]
"#;

    #[test]
    fn test_default_lifecycle_config() {
        let config = LifecycleConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.max_download_time(), Duration::from_secs(1800));
        assert_eq!(config.kill_delay(), Duration::from_secs(20));
        assert_eq!(config.kill_settle(), Duration::from_millis(500));
        assert_eq!(config.shutdown_settle(), Duration::from_secs(3));
        assert_eq!(config.startup_settle(), Duration::from_secs(20));
        assert_eq!(config.reset_settle(), Duration::from_secs(5));
        assert_eq!(config.lpmode_settle(), Duration::from_secs(3));
        assert_eq!(config.min_reference_download(), Duration::from_secs(100));
        assert_eq!(config.abort_fractions, vec![0.2, 0.4, 0.6, 0.8, 0.98]);
        assert_eq!(config.active_cable_policy, ActiveCablePolicy::Optical);
        assert_eq!(config.link_stress_cycles, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_sample() {
        let config = StaticConfig::from_yaml_str(SAMPLE).unwrap();
        let module = config
            .module(&ModuleKey::new("sonic-sw1", "Ethernet8"))
            .unwrap();
        assert_eq!(module.active_firmware.as_deref(), Some("1.2.3"));
        assert_eq!(module.inactive_firmware.as_deref(), Some("1.2"));
        assert!(module.dual_bank_support);
        assert_eq!(
            module.firmware_valid_image.as_deref(),
            Some(Path::new("/tmp/fw/img.bin"))
        );
        assert_eq!(module.firmware_valid_image_ver.as_deref(), Some("1.3.0"));
        assert_eq!(module.start_cmd_payload_size, Some(112));

        let other = config
            .module(&ModuleKey::new("sonic-sw1", "Ethernet0"))
            .unwrap();
        assert_eq!(other.inactive_firmware, None);
        assert_eq!(other.firmware_valid_image, None);
        assert_eq!(other.start_cmd_payload_size, None);

        // unspecified values use defaults
        assert_eq!(config.lifecycle.kill_delay(), Duration::from_secs(5));
        assert_eq!(config.lifecycle.poll_interval_ms, 1000);
        assert_eq!(config.lifecycle.abort_fractions, vec![0.5]);
    }

    #[test]
    fn test_ports_sorted_numerically() {
        let config = StaticConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(
            config.ports("sonic-sw1"),
            vec!["Ethernet0", "Ethernet8", "Ethernet16"]
        );
        assert_eq!(config.modules().len(), 3);
        assert!(config.ports("nope").is_empty());
    }

    #[test]
    fn test_validation_failures() {
        let empty = StaticConfig::from_yaml_str("topology: {}\n");
        assert!(matches!(empty, Err(XcvrError::InvalidConfig { .. })));

        let short_switch = "topology:\n  sw1:\n    Ethernet0: {}\n";
        assert!(StaticConfig::from_yaml_str(short_switch).is_err());

        let no_ports = "topology:\n  sonic-sw1: {}\n";
        assert!(StaticConfig::from_yaml_str(no_ports).is_err());

        let bad_port = "topology:\n  sonic-sw1:\n    Eth0: {}\n";
        let err = StaticConfig::from_yaml_str(bad_port).unwrap_err();
        assert!(err.to_string().contains("topology.sonic-sw1.Eth0"));

        let bare_prefix = "topology:\n  sonic-sw1:\n    Ethernet: {}\n";
        assert!(StaticConfig::from_yaml_str(bare_prefix).is_err());

        let bad_fraction =
            "topology:\n  sonic-sw1:\n    Ethernet0: {}\nlifecycle:\n  abort_fractions: [1.5]\n";
        assert!(StaticConfig::from_yaml_str(bad_fraction).is_err());
    }

    #[test]
    fn test_wait_bound_by_module_kind() {
        let config = LifecycleConfig::default();
        let mut identity = ModuleIdentity::indeterminate();
        assert_eq!(config.wait_bound(&identity), Duration::from_secs(900));
        identity.is_optical = true;
        assert_eq!(config.wait_bound(&identity), Duration::from_secs(1800));
        identity.is_coherent = true;
        assert_eq!(config.wait_bound(&identity), Duration::from_secs(3600));
    }

    #[test]
    fn test_link_up_bound() {
        let config = LifecycleConfig::default();
        let mut identity = ModuleIdentity::indeterminate();
        identity.is_optical = true;
        assert_eq!(config.link_up_bound(&identity), Duration::from_secs(60));
        identity.is_coherent = true;
        assert_eq!(config.link_up_bound(&identity), Duration::from_secs(180));
    }

    #[test]
    fn test_reset_exempt_switch() {
        let config = LifecycleConfig::default();
        assert!(!config.reset_holds_link_down("Arista-7050CX3-32S-C32"));
        assert!(config.reset_holds_link_down("sonic-sw1"));
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = StaticConfig::load(file.path()).unwrap();
        assert_eq!(config.switches().collect::<Vec<_>>(), vec!["sonic-sw1"]);

        let missing = StaticConfig::load("/nonexistent/transceiver_static_info.yaml");
        assert!(matches!(missing, Err(XcvrError::Io { .. })));
    }
}

//! Switch-side collaborator built on the SONiC command line tools.
//!
//! Implements every platform trait by shelling out to `sfputil`,
//! `sonic-db-cli`, `config`, `show` and `dmesg` on the switch the crate runs
//! on. Download processes are handled by a [`GroupProcessControl`].

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, instrument};

use sonic_xcvr_common::shell::{
    self, shellquote, ExecResult, CONFIG_CMD, DMESG_CMD, GREP_CMD, SFPUTIL_CMD, SHOW_CMD,
    SONIC_DB_CLI_CMD,
};
use sonic_xcvr_common::{
    GroupProcessControl, ProcessControl, ProcessHandle, XcvrError, XcvrResult,
};

use crate::platform::{
    Bank, Counters, EepromReader, FirmwareInfo, FirmwareOps, ModuleControl, ModuleKey,
    PortControl,
};

/// Output marker of a module that does not implement the firmware commands.
const NOT_IMPLEMENTED: &str = "not implemented";

/// Platform backed by the SONiC CLI of the local switch.
pub struct SfputilPlatform {
    namespace: String,
    /// Front panel ports, in switch order; used to find breakout siblings.
    ports: Vec<String>,
    /// `StartCmdPayloadSize` per port, where known.
    payload_sizes: HashMap<String, u32>,
    procs: GroupProcessControl,
}

impl SfputilPlatform {
    /// Creates a platform for the default namespace.
    pub fn new(ports: Vec<String>) -> Self {
        Self {
            namespace: String::new(),
            ports,
            payload_sizes: HashMap::new(),
            procs: GroupProcessControl::new(),
        }
    }

    /// Targets an ASIC namespace on multi-ASIC switches.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Records the CDB `StartCmdPayloadSize` of a port's module. A size in
    /// the static module description takes precedence.
    pub fn with_payload_size(mut self, port: impl Into<String>, size: u32) -> Self {
        self.payload_sizes.insert(port.into(), size);
        self
    }

    fn db_hget(&self, db: &str, key: &str, field: &str) -> String {
        format!(
            "{} -n {} {} hget {} {}",
            SONIC_DB_CLI_CMD,
            shellquote(&self.namespace),
            db,
            shellquote(key),
            shellquote(field)
        )
    }

    async fn port_field(&self, port: &str, field: &str) -> XcvrResult<String> {
        let cmd = self.db_hget("CONFIG_DB", &format!("PORT|{}", port), field);
        let out = shell::exec_checked(&cmd).await?;
        Ok(out.lines().next().unwrap_or("").trim().to_string())
    }

    fn config_interface(&self, args: &str) -> String {
        if self.namespace.is_empty() {
            format!("{} interface {}", CONFIG_CMD, args)
        } else {
            format!(
                "{} interface -n {} {}",
                CONFIG_CMD,
                shellquote(&self.namespace),
                args
            )
        }
    }

    async fn interface_status(&self, module: &ModuleKey) -> XcvrResult<(bool, bool)> {
        let cmd = format!(
            "{} interfaces description {}",
            SHOW_CMD,
            shellquote(&module.port)
        );
        let out = shell::exec_checked(&cmd).await?;
        parse_interface_description(&out, &module.port)
            .ok_or_else(|| XcvrError::unexpected_output("interfaces description", &module.port, out))
    }

    async fn physical_index(&self, port: &str) -> XcvrResult<Option<String>> {
        let index = self.port_field(port, "index").await?;
        Ok((!index.is_empty()).then_some(index))
    }
}

#[async_trait]
impl EepromReader for SfputilPlatform {
    async fn read_eeprom(&self, module: &ModuleKey, offset: u16, len: usize) -> XcvrResult<Vec<u8>> {
        let cmd = format!(
            "{} read-eeprom -p {} -n 0 -o {} -s {}",
            SFPUTIL_CMD,
            shellquote(&module.port),
            offset,
            len
        );
        let result = shell::exec(&cmd).await?;
        if !result.success() {
            return Err(XcvrError::EepromRead {
                port: module.port.clone(),
                offset,
                len,
                message: result.combined_output(),
            });
        }
        let bytes = parse_hexdump(&result.stdout);
        if bytes.len() < len {
            return Err(XcvrError::EepromRead {
                port: module.port.clone(),
                offset,
                len,
                message: format!("short read: {} bytes", bytes.len()),
            });
        }
        Ok(bytes[..len].to_vec())
    }
}

#[async_trait]
impl PortControl for SfputilPlatform {
    async fn is_present(&self, module: &ModuleKey) -> XcvrResult<bool> {
        let cmd = format!("{} show presence -p {}", SFPUTIL_CMD, shellquote(&module.port));
        let out = shell::exec_checked(&cmd).await?;
        Ok(parse_table_row(&out, &module.port).is_some_and(|cols| cols.first() == Some(&"Present")))
    }

    async fn is_admin_up(&self, module: &ModuleKey) -> XcvrResult<bool> {
        Ok(self.interface_status(module).await?.1)
    }

    async fn is_oper_up(&self, module: &ModuleKey) -> XcvrResult<bool> {
        Ok(self.interface_status(module).await?.0)
    }

    #[instrument(skip(self, module), fields(port = %module))]
    async fn shutdown(&self, module: &ModuleKey) -> XcvrResult<()> {
        let cmd = self.config_interface(&format!("shutdown {}", shellquote(&module.port)));
        shell::exec_checked(&cmd).await.map(|_| ())
    }

    #[instrument(skip(self, module), fields(port = %module))]
    async fn startup(&self, module: &ModuleKey) -> XcvrResult<()> {
        let cmd = self.config_interface(&format!("startup {}", shellquote(&module.port)));
        shell::exec_checked(&cmd).await.map(|_| ())
    }

    async fn subport_index(&self, module: &ModuleKey) -> XcvrResult<u8> {
        let value = self.port_field(&module.port, "subport").await?;
        if value.is_empty() {
            return Ok(0);
        }
        value
            .parse()
            .map_err(|_| XcvrError::unexpected_output("subport", &module.port, value))
    }

    async fn subports(&self, module: &ModuleKey) -> XcvrResult<Vec<ModuleKey>> {
        let Some(index) = self.physical_index(&module.port).await? else {
            return Ok(vec![module.clone()]);
        };
        let mut subports = Vec::new();
        for port in &self.ports {
            if self.physical_index(port).await?.as_deref() == Some(index.as_str()) {
                subports.push(module.sibling(port.clone()));
            }
        }
        if subports.is_empty() {
            subports.push(module.clone());
        }
        debug!(port = %module, count = subports.len(), "Resolved subports");
        Ok(subports)
    }
}

#[async_trait]
impl ModuleControl for SfputilPlatform {
    #[instrument(skip(self, module), fields(port = %module))]
    async fn reset_module(&self, module: &ModuleKey) -> XcvrResult<()> {
        let cmd = format!("{} reset {}", SFPUTIL_CMD, shellquote(&module.port));
        shell::exec_checked(&cmd).await.map(|_| ())
    }

    async fn set_lpmode(&self, module: &ModuleKey, enabled: bool) -> XcvrResult<()> {
        let mode = if enabled { "on" } else { "off" };
        let cmd = format!("{} lpmode {} {}", SFPUTIL_CMD, mode, shellquote(&module.port));
        shell::exec_checked(&cmd).await.map(|_| ())
    }

    async fn lpmode_enabled(&self, module: &ModuleKey) -> XcvrResult<bool> {
        let cmd = format!("{} show lpmode -p {}", SFPUTIL_CMD, shellquote(&module.port));
        let out = shell::exec_checked(&cmd).await?;
        parse_table_row(&out, &module.port)
            .and_then(|cols| cols.first().map(|c| c.eq_ignore_ascii_case("on")))
            .ok_or_else(|| XcvrError::unexpected_output("lpmode", &module.port, out))
    }

    async fn set_dom_polling(&self, module: &ModuleKey, enabled: bool) -> XcvrResult<()> {
        let action = if enabled { "enable" } else { "disable" };
        let cmd = format!(
            "{} interface -n {} transceiver dom {} {}",
            CONFIG_CMD,
            shellquote(&self.namespace),
            shellquote(&module.port),
            action
        );
        shell::exec_checked(&cmd).await.map(|_| ())
    }

    async fn dom_polling_enabled(&self, module: &ModuleKey) -> XcvrResult<bool> {
        let value = self.port_field(&module.port, "dom_polling").await?;
        // unset means the default, which is enabled
        Ok(!value.to_lowercase().contains("disabled"))
    }

    async fn start_cmd_payload_size(&self, module: &ModuleKey) -> XcvrResult<Option<u32>> {
        Ok(self.payload_sizes.get(&module.port).copied())
    }
}

#[async_trait]
impl FirmwareOps for SfputilPlatform {
    async fn read_firmware_info(&self, module: &ModuleKey) -> XcvrResult<FirmwareInfo> {
        let cmd = format!("{} show fwversion {}", SFPUTIL_CMD, shellquote(&module.port));
        let out = shell::exec_checked(&cmd).await?;
        parse_fwversion(&out)
            .ok_or_else(|| XcvrError::unexpected_output("fwversion", &module.port, out))
    }

    fn download_command(&self, module: &ModuleKey, image: &Path) -> String {
        format!(
            "{} firmware download {} {}",
            SFPUTIL_CMD,
            shellquote(&module.port),
            shellquote(&image.display().to_string())
        )
    }

    #[instrument(skip(self, module), fields(port = %module))]
    async fn run_firmware(&self, module: &ModuleKey) -> XcvrResult<ExecResult> {
        let cmd = format!("{} firmware run {}", SFPUTIL_CMD, shellquote(&module.port));
        shell::exec(&cmd).await
    }

    #[instrument(skip(self, module), fields(port = %module))]
    async fn commit_firmware(&self, module: &ModuleKey) -> XcvrResult<ExecResult> {
        let cmd = format!("{} firmware commit {}", SFPUTIL_CMD, shellquote(&module.port));
        shell::exec(&cmd).await
    }
}

#[async_trait]
impl Counters for SfputilPlatform {
    async fn read_link_flap_count(&self, module: &ModuleKey) -> XcvrResult<u64> {
        let cmd = self.db_hget("APPL_DB", &format!("PORT_TABLE:{}", module.port), "flap_count");
        let out = shell::exec_checked(&cmd).await?;
        match out.split_whitespace().last() {
            // never flapped
            None => Ok(0),
            Some(n) => n
                .parse()
                .map_err(|_| XcvrError::unexpected_output("flap_count", &module.port, out.clone())),
        }
    }

    async fn read_hardware_error_count(&self) -> XcvrResult<u64> {
        let cmd = format!(
            "{} | {} -iE \"error|fail|warning\" | {} optoe",
            DMESG_CMD, GREP_CMD, GREP_CMD
        );
        let lines = shell::exec_grep(&cmd).await?;
        Ok(lines.len() as u64)
    }
}

#[async_trait]
impl ProcessControl for SfputilPlatform {
    async fn spawn(&self, command: &str) -> XcvrResult<ProcessHandle> {
        self.procs.spawn(command).await
    }

    async fn is_running(&self, handle: ProcessHandle) -> XcvrResult<bool> {
        self.procs.is_running(handle).await
    }

    async fn exit_code(&self, handle: ProcessHandle) -> XcvrResult<Option<i32>> {
        self.procs.exit_code(handle).await
    }

    async fn read_output(&self, handle: ProcessHandle) -> XcvrResult<Vec<String>> {
        self.procs.read_output(handle).await
    }

    async fn terminate(&self, handle: ProcessHandle) -> XcvrResult<()> {
        self.procs.terminate(handle).await
    }

    async fn release(&self, handle: ProcessHandle) -> XcvrResult<()> {
        self.procs.release(handle).await
    }
}

/// Parses `sfputil show fwversion`:
///
/// ```text
/// Image A Version: 0.5.0
/// Image B Version: N/A
/// Factory Image Version: 0.0.0
/// Running Image: A
/// Committed Image: A
/// Active Firmware: 0.5.0
/// Inactive Firmware: 9.3.0
/// ```
pub fn parse_fwversion(output: &str) -> Option<FirmwareInfo> {
    if output.to_lowercase().contains(NOT_IMPLEMENTED) {
        return None;
    }
    let fields: HashMap<String, String> = output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_string()))
        .collect();

    let version = |key: &str| {
        fields
            .get(key)
            .filter(|v| !v.is_empty() && v.as_str() != "N/A")
            .cloned()
    };

    Some(FirmwareInfo {
        image_a: version("image a version"),
        image_b: version("image b version"),
        factory: version("factory image version"),
        running: fields.get("running image")?.parse::<Bank>().ok()?,
        committed: fields.get("committed image")?.parse::<Bank>().ok()?,
        active: fields.get("active firmware")?.clone(),
        inactive: fields.get("inactive firmware")?.clone(),
    })
}

/// Parses an `sfputil read-eeprom` hex dump into bytes.
///
/// ```text
///         00000000 18 40 00                                         |.@.|
/// ```
pub fn parse_hexdump(output: &str) -> Vec<u8> {
    let mut bytes = Vec::new();
    for line in output.lines() {
        for token in line.split_whitespace().skip(1) {
            if token.starts_with('|') {
                break;
            }
            if token.len() != 2 {
                continue;
            }
            if let Ok(b) = u8::from_str_radix(token, 16) {
                bytes.push(b);
            }
        }
    }
    bytes
}

/// Returns `(oper_up, admin_up)` from `show interfaces description`.
fn parse_interface_description(output: &str, port: &str) -> Option<(bool, bool)> {
    let cols = parse_table_row(output, port)?;
    let oper = cols.first()?.eq_ignore_ascii_case("up");
    let admin = cols.get(1)?.eq_ignore_ascii_case("up");
    Some((oper, admin))
}

/// Finds the table row starting with `port` and returns its other columns.
fn parse_table_row<'a>(output: &'a str, port: &str) -> Option<Vec<&'a str>> {
    output.lines().find_map(|line| {
        let mut cols = line.split_whitespace();
        (cols.next() == Some(port)).then(|| cols.collect())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const FWVERSION: &str = "Image A Version: 0.5.0
Image B Version: N/A
Factory Image Version: 0.0.0
Running Image: A
Committed Image: B
Active Firmware: 0.5.0
Inactive Firmware: 9.3.0";

    #[test]
    fn test_parse_fwversion() {
        let info = parse_fwversion(FWVERSION).unwrap();
        assert_eq!(
            info,
            FirmwareInfo {
                image_a: Some("0.5.0".to_string()),
                image_b: None,
                factory: Some("0.0.0".to_string()),
                running: Bank::A,
                committed: Bank::B,
                active: "0.5.0".to_string(),
                inactive: "9.3.0".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_fwversion_not_implemented() {
        assert_eq!(parse_fwversion("Error: Function not implemented"), None);
        assert_eq!(parse_fwversion("Image A Version: 1.0.0"), None);
    }

    #[test]
    fn test_parse_hexdump() {
        let out = "        00000000 18 40 03                                         |.@.|";
        assert_eq!(parse_hexdump(out), vec![0x18, 0x40, 0x03]);
        let multi = "        00000050 01 02 |..|\n        00000052 3e |>|";
        assert_eq!(parse_hexdump(multi), vec![0x01, 0x02, 0x3e]);
        assert!(parse_hexdump("").is_empty());
    }

    #[test]
    fn test_parse_interface_description() {
        let out = "  Interface    Oper    Admin    Alias    Description
-----------  ------  -------  -------  -------------
 Ethernet96      up       up    etp12";
        assert_eq!(parse_interface_description(out, "Ethernet96"), Some((true, true)));

        let arista = "Interface    Oper    Admin         Alias    Description
-----------  ------  -------  ------------  -------------
Ethernet96    down     down  Ethernet25/1";
        assert_eq!(parse_interface_description(arista, "Ethernet96"), Some((false, false)));
        assert_eq!(parse_interface_description(arista, "Ethernet0"), None);
    }

    #[test]
    fn test_parse_presence_and_lpmode_rows() {
        let presence = "Port         Presence
-----------  -----------
Ethernet0    Present";
        assert_eq!(parse_table_row(presence, "Ethernet0"), Some(vec!["Present"]));

        let lpmode = "Port         Low-power Mode
-----------  ----------------
Ethernet8    On";
        assert_eq!(parse_table_row(lpmode, "Ethernet8"), Some(vec!["On"]));
    }

    #[test]
    fn test_download_command_quotes_arguments() {
        let platform = SfputilPlatform::new(vec!["Ethernet0".to_string()]);
        let cmd = platform.download_command(
            &ModuleKey::new("sonic-sw1", "Ethernet0"),
            Path::new("/tmp/fw dir/img.bin"),
        );
        assert_eq!(
            cmd,
            "sudo /usr/local/bin/sfputil firmware download \"Ethernet0\" \"/tmp/fw dir/img.bin\""
        );
    }

    #[test]
    fn test_namespace_commands() {
        let platform = SfputilPlatform::new(Vec::new()).with_namespace("asic0");
        assert_eq!(
            platform.config_interface("shutdown \"Ethernet0\""),
            "sudo /usr/local/bin/config interface -n \"asic0\" shutdown \"Ethernet0\""
        );
        assert_eq!(
            platform.db_hget("APPL_DB", "PORT_TABLE:Ethernet0", "flap_count"),
            "/usr/local/bin/sonic-db-cli -n \"asic0\" APPL_DB hget \"PORT_TABLE:Ethernet0\" \"flap_count\""
        );
    }

    #[tokio::test]
    async fn test_payload_size_lookup() {
        let platform = SfputilPlatform::new(Vec::new()).with_payload_size("Ethernet0", 112);
        let key = ModuleKey::new("sonic-sw1", "Ethernet0");
        assert_eq!(platform.start_cmd_payload_size(&key).await.unwrap(), Some(112));
        let other = key.sibling("Ethernet8");
        assert_eq!(platform.start_cmd_payload_size(&other).await.unwrap(), None);
    }
}

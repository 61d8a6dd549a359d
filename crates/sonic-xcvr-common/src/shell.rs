//! One-shot command execution for transceiver tooling.
//!
//! Platform queries (`sfputil`, `sonic-db-cli`, `config`, `dmesg`) run
//! through `/bin/sh -c`. Every interpolated argument goes through
//! [`shellquote`].
//!
//! # Example
//!
//! ```ignore
//! use sonic_xcvr_common::shell::{self, SFPUTIL_CMD, shellquote};
//!
//! let cmd = format!("{} show fwversion {}", SFPUTIL_CMD, shellquote("Ethernet0"));
//! let stdout = shell::exec_checked(&cmd).await?;
//! ```

use std::process::{Output, Stdio};

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, trace, warn};

use crate::error::{XcvrError, XcvrResult};

/// Transceiver utility (EEPROM, firmware, reset, LPMode).
pub const SFPUTIL_CMD: &str = "sudo /usr/local/bin/sfputil";

/// Redis database CLI used for APPL_DB / CONFIG_DB lookups.
pub const SONIC_DB_CLI_CMD: &str = "/usr/local/bin/sonic-db-cli";

/// SONiC configuration CLI.
pub const CONFIG_CMD: &str = "sudo /usr/local/bin/config";

/// SONiC show CLI.
pub const SHOW_CMD: &str = "/usr/local/bin/show";

/// Kernel ring buffer.
pub const DMESG_CMD: &str = "sudo /bin/dmesg";

pub const GREP_CMD: &str = "/bin/grep";

/// `$`, `` ` ``, `"`, `\` and newline keep their meaning inside double quotes.
static DQUOTE_SPECIAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[$`"\\\n]"#).expect("valid shell escape pattern"));

/// Double-quotes `s` for `/bin/sh`, escaping everything the shell would
/// still expand.
///
/// ```
/// use sonic_xcvr_common::shell::shellquote;
///
/// assert_eq!(shellquote("Ethernet0"), "\"Ethernet0\"");
/// assert_eq!(shellquote("fw$1.bin"), "\"fw\\$1.bin\"");
/// ```
pub fn shellquote(s: &str) -> String {
    format!("\"{}\"", DQUOTE_SPECIAL.replace_all(s, r"\$0"))
}

/// Exit code and trimmed output of a finished command.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// `-1` if the command was killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    fn from_output(output: &Output) -> Self {
        let text = |bytes: &[u8]| String::from_utf8_lossy(bytes).trim().to_string();
        Self {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: text(&output.stdout),
            stderr: text(&output.stderr),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout and stderr joined by a newline, skipping an empty side.
    pub fn combined_output(&self) -> String {
        [self.stdout.as_str(), self.stderr.as_str()]
            .iter()
            .filter(|s| !s.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Non-blank stdout lines.
    pub fn lines(&self) -> Vec<&str> {
        self.stdout.lines().filter(|l| !l.trim().is_empty()).collect()
    }

    fn into_failure(self, cmd: &str) -> XcvrError {
        XcvrError::ShellCommandFailed {
            command: cmd.to_string(),
            exit_code: self.exit_code,
            output: self.combined_output(),
        }
    }
}

/// Runs `cmd` to completion.
///
/// Only a spawn failure is an error; a non-zero exit is reported in the
/// result.
pub async fn exec(cmd: &str) -> XcvrResult<ExecResult> {
    debug!(command = %cmd, "Executing shell command");

    let output = Command::new("/bin/sh")
        .args(["-c", cmd])
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| XcvrError::ShellExec {
            command: cmd.to_string(),
            source,
        })?;
    let result = ExecResult::from_output(&output);

    if result.success() {
        trace!(command = %cmd, "Command succeeded");
    } else {
        warn!(
            command = %cmd,
            exit_code = result.exit_code,
            stderr = %result.stderr,
            "Command failed"
        );
    }
    Ok(result)
}

/// Runs `cmd` and returns its stdout; a non-zero exit is an error.
pub async fn exec_checked(cmd: &str) -> XcvrResult<String> {
    let result = exec(cmd).await?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(result.into_failure(cmd))
    }
}

/// Runs a pipeline ending in `grep` and returns the matching lines.
///
/// Exit 1 means nothing matched and yields an empty list.
pub async fn exec_grep(cmd: &str) -> XcvrResult<Vec<String>> {
    let result = exec(cmd).await?;
    match result.exit_code {
        0 | 1 => Ok(result.lines().into_iter().map(str::to_string).collect()),
        _ => Err(result.into_failure(cmd)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shellquote_plain_arguments() {
        assert_eq!(shellquote("Ethernet0"), "\"Ethernet0\"");
        assert_eq!(shellquote("/tmp/fw.bin"), "\"/tmp/fw.bin\"");
        assert_eq!(shellquote(""), "\"\"");
    }

    #[test]
    fn test_shellquote_escapes_expansions() {
        assert_eq!(shellquote("fw_$(reboot).bin"), "\"fw_\\$(reboot).bin\"");
        assert_eq!(shellquote("`id`"), "\"\\`id\\`\"");
        assert_eq!(shellquote("a \"b\""), "\"a \\\"b\\\"\"");
        assert_eq!(shellquote("c:\\fw"), "\"c:\\\\fw\"");
    }

    #[test]
    fn test_exec_result_output() {
        let result = ExecResult {
            exit_code: 1,
            stdout: "Firmware download failed!".to_string(),
            stderr: "CDB: status 0x46".to_string(),
        };
        assert!(!result.success());
        assert_eq!(
            result.combined_output(),
            "Firmware download failed!\nCDB: status 0x46"
        );

        let quiet = ExecResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: "warning".to_string(),
        };
        assert_eq!(quiet.combined_output(), "warning");
    }

    #[test]
    fn test_exec_result_lines_skip_blank() {
        let result = ExecResult {
            exit_code: 0,
            stdout: "Image A Version: 1.0.0\n\n  \nImage B Version: 0.9.0".to_string(),
            stderr: String::new(),
        };
        assert_eq!(
            result.lines(),
            vec!["Image A Version: 1.0.0", "Image B Version: 0.9.0"]
        );
    }

    #[tokio::test]
    async fn test_exec_captures_stdout() {
        let result = exec("printf '  Ethernet0  Present\\n'").await.unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, "Ethernet0  Present");
    }

    #[tokio::test]
    async fn test_exec_checked_reports_exit_code() {
        match exec_checked("echo busy >&2; exit 3").await {
            Err(XcvrError::ShellCommandFailed {
                exit_code, output, ..
            }) => {
                assert_eq!(exit_code, 3);
                assert_eq!(output, "busy");
            }
            other => panic!("Expected ShellCommandFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exec_grep() {
        let none = exec_grep("printf 'a\\nb\\n' | grep zzz").await.unwrap();
        assert!(none.is_empty());

        let hits = exec_grep("printf 'optoe error\\nok\\noptoe fail\\n' | grep optoe")
            .await
            .unwrap();
        assert_eq!(hits, vec!["optoe error", "optoe fail"]);

        assert!(exec_grep("exit 2").await.is_err());
    }
}

//! Error types for transceiver platform operations.
//!
//! Shared by the shell, process and platform layers; lifecycle errors wrap
//! these.

use std::io;
use thiserror::Error;

/// Result type alias for transceiver platform operations.
pub type XcvrResult<T> = Result<T, XcvrError>;

/// Errors that can occur while talking to the switch platform.
#[derive(Debug, Error)]
pub enum XcvrError {
    /// Failed to execute a shell command (spawn error).
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        command: String,
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        command: String,
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// EEPROM register read failed.
    #[error("EEPROM read failed on {port} at offset {offset} (len {len}): {message}")]
    EepromRead {
        /// The port alias.
        port: String,
        /// Byte offset of the read.
        offset: u16,
        /// Requested length.
        len: usize,
        message: String,
    },

    /// Platform query returned output that could not be interpreted.
    #[error("Unexpected output from {query} on {port}: {output}")]
    UnexpectedOutput {
        /// The query that was issued (e.g., "fwversion", "flap_count").
        query: String,
        /// The port alias.
        port: String,
        /// Raw output.
        output: String,
    },

    /// Long-running process control failed.
    #[error("Process control failed for '{command}': {message}")]
    Process {
        command: String,
        message: String,
    },

    /// Unknown process handle.
    #[error("Unknown process handle {0}")]
    UnknownHandle(u64),

    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        field: String,
        message: String,
    },

    /// Port/interface not found or not present.
    #[error("Port '{port}' not found or not present")]
    PortNotPresent {
        /// The port alias.
        port: String,
    },

    /// Filesystem error (image or config files).
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Generic platform failure.
    #[error("Platform error: {operation}: {message}")]
    Platform {
        operation: String,
        message: String,
    },
}

impl XcvrError {
    /// Creates a generic platform error.
    pub fn platform(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Platform {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates an unexpected output error.
    pub fn unexpected_output(
        query: impl Into<String>,
        port: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self::UnexpectedOutput {
            query: query.into(),
            port: port.into(),
            output: output.into(),
        }
    }

    /// Creates a process control error.
    pub fn process(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Process {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Creates an IO error bound to a path.
    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = XcvrError::PortNotPresent {
            port: "Ethernet0".to_string(),
        };
        assert_eq!(err.to_string(), "Port 'Ethernet0' not found or not present");
    }

    #[test]
    fn test_platform_error() {
        let err = XcvrError::platform("hget", "Connection refused");
        assert_eq!(err.to_string(), "Platform error: hget: Connection refused");
    }

    #[test]
    fn test_eeprom_read_error() {
        let err = XcvrError::EepromRead {
            port: "Ethernet8".to_string(),
            offset: 87,
            len: 1,
            message: "i2c timeout".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "EEPROM read failed on Ethernet8 at offset 87 (len 1): i2c timeout"
        );
    }

    #[test]
    fn test_shell_command_failed() {
        let err = XcvrError::ShellCommandFailed {
            command: "sfputil firmware run Ethernet0".to_string(),
            exit_code: 2,
            output: "module not present".to_string(),
        };
        assert!(err.to_string().contains("sfputil firmware run"));
        assert!(err.to_string().contains("exit code 2"));
    }

    #[test]
    fn test_unknown_handle() {
        assert_eq!(
            XcvrError::UnknownHandle(7).to_string(),
            "Unknown process handle 7"
        );
    }
}

//! Common infrastructure for SONiC transceiver tooling.
//!
//! - [`shell`]: Shell command execution with proper quoting
//! - [`process`]: Pollable, killable long-running operations in their own
//!   process group (firmware downloads)
//! - [`error`]: Error types for platform operations
//!
//! # Example
//!
//! ```ignore
//! use sonic_xcvr_common::{
//!     process::{GroupProcessControl, ProcessControl},
//!     shell::{SFPUTIL_CMD, shellquote},
//! };
//!
//! let ctl = GroupProcessControl::new();
//! let cmd = format!("{} firmware download {} {}",
//!     SFPUTIL_CMD, shellquote("Ethernet0"), shellquote("/tmp/fw.bin"));
//! let handle = ctl.spawn(&cmd).await?;
//! while ctl.is_running(handle).await? {
//!     for line in ctl.read_output(handle).await? {
//!         println!("{line}");
//!     }
//!     tokio::time::sleep(std::time::Duration::from_secs(1)).await;
//! }
//! ctl.release(handle).await?;
//! ```

pub mod error;
pub mod process;
pub mod shell;

// Re-export commonly used items at crate root
pub use error::{XcvrError, XcvrResult};
pub use process::{GroupProcessControl, ProcessControl, ProcessHandle};

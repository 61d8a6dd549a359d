//! Transceiver classification and CMIS firmware lifecycle control.
//!
//! # Architecture
//!
//! - [`classifier`] / [`identity`]: pure protocol classification from EEPROM
//!   bytes, captured once per module as a [`ModuleIdentity`]
//! - [`bank`]: the two-bank firmware model and its legal transitions
//! - [`controller`]: drives stage/activate/commit/abort/reset operations
//!   through the [`platform`] traits and checks [`observe`] invariants around
//!   every one of them, plus port diagnostics (presence, versions, LPMode,
//!   reset, link cycling, remote reseat) that must leave the banks alone
//! - [`sfputil`]: the [`Platform`] implementation for a SONiC switch
//! - [`config`]: static per-module description and timing constants
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sonic_xcvrfw::{
//!     DownloadTimingHistory, FirmwareLifecycleController, SfputilPlatform, StaticConfig,
//! };
//!
//! let config = StaticConfig::load_default()?;
//! let platform = Arc::new(SfputilPlatform::new(vec!["Ethernet0".to_string()]));
//! let controller = FirmwareLifecycleController::from_static(platform, &config);
//! let mut history = DownloadTimingHistory::new();
//!
//! for mut module in controller.attach_switch(&config, "sonic-sw1").await {
//!     controller.stage_firmware(&mut module, true, &mut history).await?;
//!     controller.activate_staged(&mut module).await?;
//!     controller.commit_running(&mut module).await?;
//! }
//! ```

pub mod bank;
pub mod classifier;
pub mod config;
pub mod controller;
pub mod error;
pub mod guard;
pub mod history;
pub mod identity;
pub mod image;
pub mod observe;
pub mod platform;
pub mod session;
pub mod sfputil;

pub use bank::{FirmwareBankState, LifecycleState, TransitionError, CORRUPTED_VERSION};
pub use classifier::{ActiveCablePolicy, XcvrFamily};
pub use config::{LifecycleConfig, ModuleStaticConfig, StaticConfig};
pub use controller::{
    FirmwareLifecycleController, ModuleUnderTest, Outcome, SkipReason, COMMIT_SUCCESS,
    DOWNLOAD_SUCCESS, RUN_SUCCESS,
};
pub use error::{LifecycleError, LifecycleResult};
pub use guard::{ModuleSetting, ScopedSetting};
pub use history::DownloadTimingHistory;
pub use identity::ModuleIdentity;
pub use observe::{Invariant, Snapshot, Violation, ViolationSet};
pub use platform::{
    Bank, Counters, EepromReader, FirmwareInfo, FirmwareOps, ModuleControl, ModuleKey, Platform,
    PortControl,
};
pub use session::{LifecycleSession, Operation, OperationReport};
pub use sfputil::SfputilPlatform;

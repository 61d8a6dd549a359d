//! Scoped module settings.
//!
//! Firmware operations run with DOM polling suspended, and the low-power
//! download runs with LPMode engaged. A [`ScopedSetting`] applies the setting
//! on acquisition and restores it on [`ScopedSetting::release`]. If the guard
//! is dropped without being released (early return, `?`, panic), the restore
//! is spawned on the current runtime.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, warn};

use sonic_xcvr_common::{XcvrError, XcvrResult};

use crate::platform::{ModuleControl, ModuleKey};

/// A module setting that can be held for the duration of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleSetting {
    DomPolling,
    LowPowerMode,
}

impl ModuleSetting {
    async fn write<P>(self, platform: &P, module: &ModuleKey, on: bool) -> XcvrResult<()>
    where
        P: ModuleControl + ?Sized,
    {
        match self {
            ModuleSetting::DomPolling => platform.set_dom_polling(module, on).await,
            ModuleSetting::LowPowerMode => platform.set_lpmode(module, on).await,
        }
    }

    async fn read<P>(self, platform: &P, module: &ModuleKey) -> XcvrResult<bool>
    where
        P: ModuleControl + ?Sized,
    {
        match self {
            ModuleSetting::DomPolling => platform.dom_polling_enabled(module).await,
            ModuleSetting::LowPowerMode => platform.lpmode_enabled(module).await,
        }
    }
}

impl fmt::Display for ModuleSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleSetting::DomPolling => write!(f, "dom_polling"),
            ModuleSetting::LowPowerMode => write!(f, "lpmode"),
        }
    }
}

/// A setting held until released or dropped.
pub struct ScopedSetting<P: ModuleControl + ?Sized + 'static> {
    platform: Arc<P>,
    module: ModuleKey,
    setting: ModuleSetting,
    restore_to: bool,
    armed: bool,
}

impl<P: ModuleControl + ?Sized + 'static> ScopedSetting<P> {
    /// Sets `setting` to `value`; it is restored to `!value` later.
    pub async fn apply(
        platform: Arc<P>,
        module: &ModuleKey,
        setting: ModuleSetting,
        value: bool,
    ) -> XcvrResult<Self> {
        setting.write(&*platform, module, value).await?;
        debug!(port = %module, %setting, value, "Setting applied");
        Ok(Self {
            platform,
            module: module.clone(),
            setting,
            restore_to: !value,
            armed: true,
        })
    }

    /// Disables DOM polling and verifies it is reported off.
    pub async fn suspend_dom_polling(platform: Arc<P>, module: &ModuleKey) -> XcvrResult<Self> {
        let guard = Self::apply(platform, module, ModuleSetting::DomPolling, false).await?;
        if guard.current().await? {
            // dropping the guard re-enables polling
            return Err(XcvrError::platform(
                "dom_polling",
                format!("failed to disable DOM polling on {}", module),
            ));
        }
        Ok(guard)
    }

    /// Engages low-power mode.
    pub async fn low_power_mode(platform: Arc<P>, module: &ModuleKey) -> XcvrResult<Self> {
        Self::apply(platform, module, ModuleSetting::LowPowerMode, true).await
    }

    pub fn setting(&self) -> ModuleSetting {
        self.setting
    }

    /// Reads the setting back from the module.
    pub async fn current(&self) -> XcvrResult<bool> {
        self.setting.read(&*self.platform, &self.module).await
    }

    /// Restores the setting and, for DOM polling, verifies it took effect.
    pub async fn release(mut self) -> XcvrResult<()> {
        self.armed = false;
        self.setting
            .write(&*self.platform, &self.module, self.restore_to)
            .await?;
        if self.setting == ModuleSetting::DomPolling && !self.current().await? {
            return Err(XcvrError::platform(
                "dom_polling",
                format!("failed to re-enable DOM polling on {}", self.module),
            ));
        }
        debug!(port = %self.module, setting = %self.setting, "Setting restored");
        Ok(())
    }
}

impl<P: ModuleControl + ?Sized + 'static> Drop for ScopedSetting<P> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(
            port = %self.module,
            setting = %self.setting,
            "Guard dropped without release, restoring in background"
        );
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            error!(port = %self.module, setting = %self.setting, "No runtime to restore setting");
            return;
        };
        let platform = Arc::clone(&self.platform);
        let module = self.module.clone();
        let setting = self.setting;
        let restore_to = self.restore_to;
        handle.spawn(async move {
            if let Err(e) = setting.write(&*platform, &module, restore_to).await {
                error!(port = %module, %setting, error = %e, "Failed to restore setting");
            }
        });
    }
}

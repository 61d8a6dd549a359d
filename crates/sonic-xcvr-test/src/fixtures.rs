//! Test fixtures for firmware lifecycle scenarios
//!
//! Provides EEPROM images for common module types, static module
//! descriptions, and a [`TestBench`] that wires a simulated switch to a
//! lifecycle controller with a real image file on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use sonic_xcvrfw::{
    DownloadTimingHistory, FirmwareLifecycleController, LifecycleConfig, ModuleKey,
    ModuleStaticConfig, ModuleUnderTest,
};

use crate::sim::{ImageBehavior, SimModule, SimPlatform};

/// Switch name used by the fixtures.
pub const TEST_SWITCH: &str = "sonic-sw1";

/// Versions installed on a fresh fixture module.
pub const ACTIVE_VERSION: &str = "1.0.0";
pub const INACTIVE_VERSION: &str = "0.9.0";

/// Version contained in the fixture image.
pub const IMAGE_VERSION: &str = "1.1.0";

/// How long the fixture image takes to download.
pub const IMAGE_DOWNLOAD_TIME: Duration = Duration::from_secs(150);

/// EEPROM images (lower page + page 00h).
pub mod eeprom {
    use sonic_xcvrfw::classifier::{
        CMIS_APP1_MEDIA_TYPE_OFFSET, CMIS_MEDIA_ACTIVE_CABLE, CMIS_MEDIA_PASSIVE_COPPER,
        CMIS_MEDIA_SMF, CMIS_MEDIA_TYPE_OFFSET, MEDIA_400ZR_DWDM, SFF8472_COMPLIANCE_OFFSET,
        SFF8636_40GBASE_CR4, SFF8636_COMPLIANCE_OFFSET,
    };

    pub const EEPROM_SIZE: usize = 256;

    /// 400GBASE-DR4 host interface media code; not coherent.
    const MEDIA_400G_DR4: u8 = 0x1c;

    /// An all-zero image with `bytes` written at their offsets.
    pub fn with_bytes(bytes: &[(u16, u8)]) -> Vec<u8> {
        let mut image = vec![0u8; EEPROM_SIZE];
        for (offset, value) in bytes {
            image[usize::from(*offset)] = *value;
        }
        image
    }

    /// QSFP-DD, single mode fiber.
    pub fn cmis_optical() -> Vec<u8> {
        with_bytes(&[
            (0, 0x18),
            (1, 0x50),
            (CMIS_MEDIA_TYPE_OFFSET, CMIS_MEDIA_SMF),
            (CMIS_APP1_MEDIA_TYPE_OFFSET, MEDIA_400G_DR4),
        ])
    }

    /// OSFP 400ZR.
    pub fn cmis_coherent() -> Vec<u8> {
        with_bytes(&[
            (0, 0x19),
            (1, 0x50),
            (CMIS_MEDIA_TYPE_OFFSET, CMIS_MEDIA_SMF),
            (CMIS_APP1_MEDIA_TYPE_OFFSET, MEDIA_400ZR_DWDM),
        ])
    }

    /// QSFP-DD passive copper cable.
    pub fn cmis_dac() -> Vec<u8> {
        with_bytes(&[
            (0, 0x18),
            (1, 0x50),
            (CMIS_MEDIA_TYPE_OFFSET, CMIS_MEDIA_PASSIVE_COPPER),
        ])
    }

    /// QSFP-DD active cable.
    pub fn cmis_active_cable() -> Vec<u8> {
        with_bytes(&[
            (0, 0x18),
            (1, 0x50),
            (CMIS_MEDIA_TYPE_OFFSET, CMIS_MEDIA_ACTIVE_CABLE),
        ])
    }

    /// QSFP28 optical.
    pub fn sff8636_optical() -> Vec<u8> {
        with_bytes(&[(0, 0x11), (1, 0x07), (SFF8636_COMPLIANCE_OFFSET, 0x00)])
    }

    /// QSFP+ 40GBASE-CR4.
    pub fn sff8636_dac() -> Vec<u8> {
        with_bytes(&[
            (0, 0x0d),
            (1, 0x03),
            (SFF8636_COMPLIANCE_OFFSET, SFF8636_40GBASE_CR4),
        ])
    }

    /// SFP+ optical.
    pub fn sff8472_optical() -> Vec<u8> {
        with_bytes(&[(0, 0x03), (1, 0x04), (SFF8472_COMPLIANCE_OFFSET, 0x00)])
    }

    /// An identifier no classifier knows.
    pub fn unknown() -> Vec<u8> {
        with_bytes(&[(0, 0x7f)])
    }
}

/// Static description of a dual-bank module with the fixture image.
pub fn module_config(image: &Path) -> ModuleStaticConfig {
    ModuleStaticConfig {
        active_firmware: Some(ACTIVE_VERSION.to_string()),
        inactive_firmware: Some(INACTIVE_VERSION.to_string()),
        dual_bank_support: true,
        firmware_valid_image: Some(image.to_path_buf()),
        firmware_valid_image_ver: Some(IMAGE_VERSION.to_string()),
        start_cmd_payload_size: None,
    }
}

/// A fresh module running [`ACTIVE_VERSION`] with [`INACTIVE_VERSION`] staged.
pub fn sim_module(eeprom: Vec<u8>) -> SimModule {
    SimModule::new(eeprom, ACTIVE_VERSION, INACTIVE_VERSION)
}

/// A simulated switch, its controller and an image on disk.
pub struct TestBench {
    pub sim: Arc<SimPlatform>,
    pub controller: FirmwareLifecycleController<SimPlatform>,
    pub history: DownloadTimingHistory,
    image: PathBuf,
    _dir: TempDir,
}

impl TestBench {
    /// Builds a bench with default lifecycle settings.
    pub fn new(modules: Vec<(&str, SimModule)>) -> std::io::Result<Self> {
        Self::with_config(modules, LifecycleConfig::default())
    }

    pub fn with_config(
        modules: Vec<(&str, SimModule)>,
        config: LifecycleConfig,
    ) -> std::io::Result<Self> {
        let dir = tempfile::tempdir()?;
        let image = dir.path().join("module_fw_1_1_0.bin");
        let content: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&image, content)?;

        let mut sim = SimPlatform::new(TEST_SWITCH);
        for (port, module) in modules {
            sim = sim.with_module(port, module);
        }
        sim.register_image(&image, ImageBehavior::valid(IMAGE_VERSION, IMAGE_DOWNLOAD_TIME));

        let sim = Arc::new(sim);
        let controller = FirmwareLifecycleController::new(Arc::clone(&sim), config);
        Ok(Self {
            sim,
            controller,
            history: DownloadTimingHistory::new(),
            image,
            _dir: dir,
        })
    }

    /// Path of the valid image.
    pub fn image(&self) -> &Path {
        &self.image
    }

    pub fn key(&self, port: &str) -> ModuleKey {
        self.sim.key(port)
    }

    /// Attaches `port` with the default module description.
    pub async fn attach(&self, port: &str) -> ModuleUnderTest {
        self.attach_with(port, module_config(&self.image)).await
    }

    pub async fn attach_with(&self, port: &str, config: ModuleStaticConfig) -> ModuleUnderTest {
        self.controller.attach(self.key(port), config).await
    }
}

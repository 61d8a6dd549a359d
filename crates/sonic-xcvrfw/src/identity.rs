//! Per-module identity, derived once per test run.

use serde::Serialize;
use tracing::{debug, info};

use crate::classifier::{
    self, ActiveCablePolicy, XcvrFamily, CMIS_APP1_MEDIA_TYPE_OFFSET, ID_OFFSET, REV_OFFSET,
};
use crate::platform::{EepromReader, ModuleKey};

/// Immutable classification of a plugged module.
///
/// Built once by [`ModuleIdentity::probe`] and passed by reference to every
/// consumer, so repeated queries never re-read the EEPROM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleIdentity {
    /// EEPROM byte 0, `None` if the read failed.
    pub id_byte: Option<u8>,
    /// EEPROM byte 1.
    pub rev_byte: Option<u8>,
    /// Management interface family.
    pub family: XcvrFamily,
    /// Family-specific compliance byte.
    pub spec_compliance: Option<u8>,
    /// CMIS default application media type (byte 87).
    pub app_media_type: Option<u8>,
    pub is_optical: bool,
    pub is_coherent: bool,
    pub supports_lpmode: bool,
}

impl ModuleIdentity {
    /// Classifies already-read bytes.
    pub fn from_bytes(
        id_byte: Option<u8>,
        rev_byte: Option<u8>,
        compliance_raw: Option<u8>,
        app_media_type: Option<u8>,
        policy: ActiveCablePolicy,
    ) -> Self {
        let family = classifier::classify_partial(id_byte, rev_byte);
        let spec_compliance = classifier::spec_compliance(family, compliance_raw);
        let app_media_type = if family == XcvrFamily::Cmis {
            app_media_type
        } else {
            None
        };
        Self {
            id_byte,
            rev_byte,
            family,
            spec_compliance,
            app_media_type,
            is_optical: classifier::is_optical(family, spec_compliance, policy),
            is_coherent: classifier::is_coherent(family, app_media_type),
            supports_lpmode: classifier::supports_lpmode(family, spec_compliance, policy),
        }
    }

    /// Identity of a module whose EEPROM could not be read at all.
    pub fn indeterminate() -> Self {
        Self::from_bytes(None, None, None, None, ActiveCablePolicy::default())
    }

    /// Reads the identifying bytes and classifies the module.
    ///
    /// Read failures degrade to an undetermined classification; this never
    /// returns an error.
    pub async fn probe<R>(reader: &R, module: &ModuleKey, policy: ActiveCablePolicy) -> Self
    where
        R: EepromReader + ?Sized,
    {
        let id_byte = read_byte(reader, module, ID_OFFSET).await;
        let rev_byte = read_byte(reader, module, REV_OFFSET).await;
        let family = classifier::classify_partial(id_byte, rev_byte);

        let compliance_raw = match classifier::spec_compliance_offset(family) {
            Some(offset) => read_byte(reader, module, offset).await,
            None => None,
        };
        let app_media_type = if family == XcvrFamily::Cmis {
            read_byte(reader, module, CMIS_APP1_MEDIA_TYPE_OFFSET).await
        } else {
            None
        };

        let identity =
            Self::from_bytes(id_byte, rev_byte, compliance_raw, app_media_type, policy);
        info!(
            port = %module,
            family = %identity.family,
            optical = identity.is_optical,
            coherent = identity.is_coherent,
            "Classified transceiver"
        );
        identity
    }

    /// Returns true if the module exposes the CMIS firmware lifecycle.
    pub fn is_cmis(&self) -> bool {
        self.family == XcvrFamily::Cmis
    }

    /// Returns true if the classification could not be determined.
    pub fn is_indeterminate(&self) -> bool {
        self.family == XcvrFamily::Unknown
    }
}

async fn read_byte<R>(reader: &R, module: &ModuleKey, offset: u16) -> Option<u8>
where
    R: EepromReader + ?Sized,
{
    match reader.read_eeprom(module, offset, 1).await {
        Ok(bytes) => bytes.first().copied(),
        Err(e) => {
            debug!(port = %module, offset = offset, error = %e, "EEPROM read failed");
            None
        }
    }
}

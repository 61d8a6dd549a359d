//! Transceiver protocol classification from raw EEPROM bytes.
//!
//! Identifier values follow SFF-8024; compliance bit semantics follow
//! CMIS 5.x page 00h, SFF-8636/8436 page 00h and SFF-8472 A0h. Coherent
//! detection follows OIF C-CMIS.
//!
//! All functions are pure and total. Absent bytes never raise an error; they
//! degrade to [`XcvrFamily::Unknown`] or `false`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// EEPROM offset of the identifier byte.
pub const ID_OFFSET: u16 = 0;

/// EEPROM offset of the revision compliance byte.
pub const REV_OFFSET: u16 = 1;

/// CMIS page 00h media type byte.
pub const CMIS_MEDIA_TYPE_OFFSET: u16 = 85;

/// CMIS media type of default application 1.
pub const CMIS_APP1_MEDIA_TYPE_OFFSET: u16 = 87;

/// SFF-8636 / SFF-8436 page 00h specification compliance byte.
pub const SFF8636_COMPLIANCE_OFFSET: u16 = 131;

/// SFF-8472 A0h transceiver compliance byte (cable technology in bits 3:2).
pub const SFF8472_COMPLIANCE_OFFSET: u16 = 8;

/// QSFP-DD, OSFP, QSFP+ (CMIS), SFP-DD, SFP+ (CMIS).
pub const CMIS_IDS: [u8; 5] = [0x18, 0x19, 0x1e, 0x1f, 0x20];

/// QSFP28.
pub const SFF8636_ID: u8 = 0x11;

/// QSFP+, shared between SFF-8436 and SFF-8636.
pub const QSFP_PLUS_ID: u8 = 0x0d;

/// SFP / SFP+ / SFP28.
pub const SFF8472_ID: u8 = 0x03;

/// First QSFP+ revision byte that denotes SFF-8636.
pub const SFF8636_MIN_REV: u8 = 3;

/// CMIS media type: multimode fiber.
pub const CMIS_MEDIA_MMF: u8 = 1;

/// CMIS media type: single mode fiber.
pub const CMIS_MEDIA_SMF: u8 = 2;

/// CMIS media type: passive copper.
pub const CMIS_MEDIA_PASSIVE_COPPER: u8 = 3;

/// CMIS media type: active cable (optical or copper).
pub const CMIS_MEDIA_ACTIVE_CABLE: u8 = 4;

/// CMIS media type: BASE-T.
pub const CMIS_MEDIA_BASE_T: u8 = 5;

/// SFF-8472 cable technology bits (passive / active cable).
pub const SFF8472_CABLE_MASK: u8 = 0x0c;

/// SFF-8636 40GBASE-CR4 compliance bit.
pub const SFF8636_40GBASE_CR4: u8 = 0x08;

/// C-CMIS 400ZR, DWDM amplified.
pub const MEDIA_400ZR_DWDM: u8 = 0x3e;

/// C-CMIS 400ZR, single wavelength unamplified.
pub const MEDIA_400ZR_SINGLE: u8 = 0x3f;

/// Management interface family of a transceiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum XcvrFamily {
    Cmis,
    Sff8636,
    Sff8436,
    Sff8472,
    Unknown,
}

impl XcvrFamily {
    /// Returns the family name as used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            XcvrFamily::Cmis => "CMIS",
            XcvrFamily::Sff8636 => "SFF-8636",
            XcvrFamily::Sff8436 => "SFF-8436",
            XcvrFamily::Sff8472 => "SFF-8472",
            XcvrFamily::Unknown => "unknown",
        }
    }
}

impl fmt::Display for XcvrFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How CMIS "active cable" media is classified.
///
/// Active cables can be optical (AOC) or copper (ACC); byte 85 does not
/// tell them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveCablePolicy {
    /// Treat active cables as optical.
    #[default]
    Optical,
    /// Treat active cables as electrical.
    Electrical,
}

/// Derives the family from the identifier and revision bytes.
pub fn classify(id: u8, rev: u8) -> XcvrFamily {
    match id {
        id if CMIS_IDS.contains(&id) => XcvrFamily::Cmis,
        SFF8636_ID => XcvrFamily::Sff8636,
        QSFP_PLUS_ID if rev >= SFF8636_MIN_REV => XcvrFamily::Sff8636,
        QSFP_PLUS_ID => XcvrFamily::Sff8436,
        SFF8472_ID => XcvrFamily::Sff8472,
        _ => XcvrFamily::Unknown,
    }
}

/// Like [`classify`], for bytes that may have failed to read.
///
/// The revision only matters for the shared QSFP+ identifier; if it is
/// missing there the family is undetermined.
pub fn classify_partial(id: Option<u8>, rev: Option<u8>) -> XcvrFamily {
    match (id, rev) {
        (None, _) => XcvrFamily::Unknown,
        (Some(QSFP_PLUS_ID), None) => XcvrFamily::Unknown,
        (Some(id), rev) => classify(id, rev.unwrap_or(0)),
    }
}

/// EEPROM offset of the specification compliance byte for `family`.
pub fn spec_compliance_offset(family: XcvrFamily) -> Option<u16> {
    match family {
        XcvrFamily::Cmis => Some(CMIS_MEDIA_TYPE_OFFSET),
        XcvrFamily::Sff8636 | XcvrFamily::Sff8436 => Some(SFF8636_COMPLIANCE_OFFSET),
        XcvrFamily::Sff8472 => Some(SFF8472_COMPLIANCE_OFFSET),
        XcvrFamily::Unknown => None,
    }
}

/// Interprets a raw compliance byte for `family`.
///
/// Returns `None` for an unknown family: "undetermined", not zero.
pub fn spec_compliance(family: XcvrFamily, raw: Option<u8>) -> Option<u8> {
    spec_compliance_offset(family).and(raw)
}

/// Returns true if the module is optical.
pub fn is_optical(family: XcvrFamily, compliance: Option<u8>, policy: ActiveCablePolicy) -> bool {
    let Some(compliance) = compliance else {
        return false;
    };
    match family {
        XcvrFamily::Cmis => match compliance {
            CMIS_MEDIA_MMF | CMIS_MEDIA_SMF => true,
            CMIS_MEDIA_ACTIVE_CABLE => policy == ActiveCablePolicy::Optical,
            _ => false,
        },
        XcvrFamily::Sff8472 => compliance & SFF8472_CABLE_MASK == 0,
        // 8436 and 8636 share the compliance layout.
        XcvrFamily::Sff8636 | XcvrFamily::Sff8436 => compliance & SFF8636_40GBASE_CR4 == 0,
        XcvrFamily::Unknown => false,
    }
}

/// Returns true for CMIS modules whose default application is 400ZR.
pub fn is_coherent(family: XcvrFamily, app_media_type: Option<u8>) -> bool {
    family == XcvrFamily::Cmis
        && matches!(app_media_type, Some(MEDIA_400ZR_DWDM) | Some(MEDIA_400ZR_SINGLE))
}

/// Returns true if the module supports low-power mode.
///
/// Modelled as identical to optical character.
pub fn supports_lpmode(
    family: XcvrFamily,
    compliance: Option<u8>,
    policy: ActiveCablePolicy,
) -> bool {
    is_optical(family, compliance, policy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_cmis_ids() {
        for id in CMIS_IDS {
            assert_eq!(classify(id, 0), XcvrFamily::Cmis);
            assert_eq!(classify(id, 0xff), XcvrFamily::Cmis);
        }
    }

    #[test]
    fn test_classify_qsfp_plus_boundary() {
        assert_eq!(classify(0x0d, 0), XcvrFamily::Sff8436);
        assert_eq!(classify(0x0d, 2), XcvrFamily::Sff8436);
        assert_eq!(classify(0x0d, 3), XcvrFamily::Sff8636);
        assert_eq!(classify(0x0d, 8), XcvrFamily::Sff8636);
    }

    #[test]
    fn test_classify_others() {
        assert_eq!(classify(0x11, 0), XcvrFamily::Sff8636);
        assert_eq!(classify(0x03, 0), XcvrFamily::Sff8472);
        assert_eq!(classify(0x00, 0), XcvrFamily::Unknown);
        assert_eq!(classify(0x0c, 5), XcvrFamily::Unknown);
        assert_eq!(classify(0xff, 0xff), XcvrFamily::Unknown);
    }

    #[test]
    fn test_classify_partial() {
        assert_eq!(classify_partial(None, Some(3)), XcvrFamily::Unknown);
        assert_eq!(classify_partial(Some(0x0d), None), XcvrFamily::Unknown);
        assert_eq!(classify_partial(Some(0x18), None), XcvrFamily::Cmis);
        assert_eq!(classify_partial(Some(0x0d), Some(3)), XcvrFamily::Sff8636);
    }

    #[test]
    fn test_spec_compliance_offsets() {
        assert_eq!(spec_compliance_offset(XcvrFamily::Cmis), Some(85));
        assert_eq!(spec_compliance_offset(XcvrFamily::Sff8636), Some(131));
        assert_eq!(spec_compliance_offset(XcvrFamily::Sff8436), Some(131));
        assert_eq!(spec_compliance_offset(XcvrFamily::Sff8472), Some(8));
        assert_eq!(spec_compliance_offset(XcvrFamily::Unknown), None);
    }

    #[test]
    fn test_spec_compliance_unknown_is_absent_not_zero() {
        assert_eq!(spec_compliance(XcvrFamily::Unknown, Some(0)), None);
        assert_eq!(spec_compliance(XcvrFamily::Cmis, Some(0)), Some(0));
        assert_eq!(spec_compliance(XcvrFamily::Cmis, None), None);
    }

    #[test]
    fn test_is_optical_cmis() {
        let p = ActiveCablePolicy::Optical;
        assert!(is_optical(XcvrFamily::Cmis, Some(1), p));
        assert!(is_optical(XcvrFamily::Cmis, Some(2), p));
        assert!(!is_optical(XcvrFamily::Cmis, Some(3), p));
        assert!(is_optical(XcvrFamily::Cmis, Some(4), p));
        assert!(!is_optical(XcvrFamily::Cmis, Some(5), p));
        assert!(!is_optical(XcvrFamily::Cmis, Some(0), p));
    }

    #[test]
    fn test_is_optical_active_cable_policy() {
        assert!(!is_optical(
            XcvrFamily::Cmis,
            Some(CMIS_MEDIA_ACTIVE_CABLE),
            ActiveCablePolicy::Electrical
        ));
    }

    #[test]
    fn test_is_optical_sff() {
        let p = ActiveCablePolicy::default();
        assert!(is_optical(XcvrFamily::Sff8472, Some(0b0000), p));
        assert!(!is_optical(XcvrFamily::Sff8472, Some(0b0100), p));
        assert!(!is_optical(XcvrFamily::Sff8472, Some(0b1000), p));
        assert!(is_optical(XcvrFamily::Sff8472, Some(0b0011), p));
        assert!(!is_optical(XcvrFamily::Sff8636, Some(0x08), p));
        assert!(is_optical(XcvrFamily::Sff8636, Some(0x00), p));
        assert!(!is_optical(XcvrFamily::Sff8436, Some(0x0c), p));
        assert!(is_optical(XcvrFamily::Sff8436, Some(0x04), p));
    }

    #[test]
    fn test_is_optical_conservative_defaults() {
        let p = ActiveCablePolicy::default();
        assert!(!is_optical(XcvrFamily::Unknown, Some(1), p));
        assert!(!is_optical(XcvrFamily::Cmis, None, p));
        assert!(!is_optical(XcvrFamily::Sff8472, None, p));
    }

    #[test]
    fn test_is_coherent() {
        assert!(is_coherent(XcvrFamily::Cmis, Some(0x3e)));
        assert!(is_coherent(XcvrFamily::Cmis, Some(0x3f)));
        assert!(!is_coherent(XcvrFamily::Cmis, Some(0x3d)));
        assert!(!is_coherent(XcvrFamily::Cmis, None));
        assert!(!is_coherent(XcvrFamily::Sff8636, Some(0x3e)));
    }

    #[test]
    fn test_supports_lpmode_tracks_optical() {
        let p = ActiveCablePolicy::default();
        assert!(supports_lpmode(XcvrFamily::Cmis, Some(1), p));
        assert!(!supports_lpmode(XcvrFamily::Cmis, Some(3), p));
    }
}

//! Preparation of deliberately corrupted firmware images.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use sonic_xcvr_common::{XcvrError, XcvrResult};

/// Prefix of the corrupted copy's file name.
pub const INVALID_IMAGE_PREFIX: &str = "inval_";

/// Offset past the image header of the byte that gets flipped.
pub const CORRUPT_OFFSET_PAST_HEADER: u64 = 200;

/// Path of the corrupted copy of `valid`: same directory, prefixed name.
pub fn invalid_image_path(valid: &Path) -> XcvrResult<PathBuf> {
    let name = valid.file_name().ok_or_else(|| {
        XcvrError::invalid_config("firmware_valid_image", format!("{} has no file name", valid.display()))
    })?;
    let mut invalid_name = std::ffi::OsString::from(INVALID_IMAGE_PREFIX);
    invalid_name.push(name);
    Ok(valid.with_file_name(invalid_name))
}

/// Creates (or reuses) a copy of `valid` with the byte at
/// `header_size + 200` inverted, so that the module accepts the header but
/// rejects the payload.
///
/// `header_size` is the module's CDB `StartCmdPayloadSize`; it is only
/// needed when the copy does not exist yet.
pub async fn prepare_invalid_image(valid: &Path, header_size: Option<u32>) -> XcvrResult<PathBuf> {
    let invalid = invalid_image_path(valid)?;
    if tokio::fs::try_exists(&invalid).await.unwrap_or(false) {
        debug!(path = %invalid.display(), "Reusing invalid image");
        return Ok(invalid);
    }
    let header_size = header_size.ok_or_else(|| {
        XcvrError::platform(
            "StartCmdPayloadSize",
            format!("unknown, cannot corrupt {}", valid.display()),
        )
    })?;

    let mut bytes = tokio::fs::read(valid)
        .await
        .map_err(|e| XcvrError::io(valid.display().to_string(), e))?;

    let offset = u64::from(header_size) + CORRUPT_OFFSET_PAST_HEADER;
    let index = usize::try_from(offset)
        .ok()
        .filter(|i| *i < bytes.len())
        .ok_or_else(|| {
            XcvrError::invalid_config(
                "firmware_valid_image",
                format!(
                    "{} is {} bytes, cannot corrupt offset {}",
                    valid.display(),
                    bytes.len(),
                    offset
                ),
            )
        })?;
    bytes[index] ^= 0xff;

    tokio::fs::write(&invalid, &bytes)
        .await
        .map_err(|e| XcvrError::io(invalid.display().to_string(), e))?;
    info!(path = %invalid.display(), offset, "Created invalid image");
    Ok(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_invalid_image_path() {
        let path = invalid_image_path(Path::new("/tmp/fw/module.bin")).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/fw/inval_module.bin"));
        assert!(invalid_image_path(Path::new("/")).is_err());
    }

    #[tokio::test]
    async fn test_prepare_flips_one_byte() {
        let dir = tempfile::tempdir().unwrap();
        let valid = dir.path().join("fw.bin");
        let original: Vec<u8> = (0..=255u8).cycle().take(1024).collect();
        tokio::fs::write(&valid, &original).await.unwrap();

        let invalid = prepare_invalid_image(&valid, Some(112)).await.unwrap();
        assert_eq!(invalid, dir.path().join("inval_fw.bin"));

        let corrupted = tokio::fs::read(&invalid).await.unwrap();
        assert_eq!(corrupted.len(), original.len());
        let diffs: Vec<usize> = (0..original.len())
            .filter(|i| original[*i] != corrupted[*i])
            .collect();
        assert_eq!(diffs, vec![312]);
        assert_eq!(corrupted[312], original[312] ^ 0xff);
    }

    #[tokio::test]
    async fn test_existing_invalid_image_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let valid = dir.path().join("fw.bin");
        tokio::fs::write(&valid, vec![0u8; 1024]).await.unwrap();
        let marker = dir.path().join("inval_fw.bin");
        tokio::fs::write(&marker, b"previous").await.unwrap();

        let invalid = prepare_invalid_image(&valid, None).await.unwrap();
        assert_eq!(tokio::fs::read(&invalid).await.unwrap(), b"previous".to_vec());
    }

    #[tokio::test]
    async fn test_image_too_short() {
        let dir = tempfile::tempdir().unwrap();
        let valid = dir.path().join("fw.bin");
        tokio::fs::write(&valid, vec![0u8; 100]).await.unwrap();
        let err = prepare_invalid_image(&valid, Some(0)).await.unwrap_err();
        assert!(matches!(err, XcvrError::InvalidConfig { .. }));
        let err = prepare_invalid_image(&valid, None).await.unwrap_err();
        assert!(matches!(err, XcvrError::Platform { .. }));
    }

    #[tokio::test]
    async fn test_missing_valid_image() {
        let dir = tempfile::tempdir().unwrap();
        let err = prepare_invalid_image(&dir.path().join("absent.bin"), Some(0))
            .await
            .unwrap_err();
        assert!(matches!(err, XcvrError::Io { .. }));
    }
}

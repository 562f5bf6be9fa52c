//! Content-addressed media storage.
//!
//! Photos land at `<media_root>/<source_id>/<sha256-hex>.<ext>`. Identical
//! bytes always map to the same file, so re-downloading is harmless.

use std::path::{Path, PathBuf};

use medwh_core::MediaAsset;
use sha2::{Digest, Sha256};

use crate::error::CollectorError;

/// File extension for a `Content-Type`, defaulting to `jpg`.
#[must_use]
pub fn extension_for(content_type: Option<&str>) -> &'static str {
    let mime = content_type
        .and_then(|ct| ct.split(';').next())
        .map(str::trim)
        .unwrap_or_default();
    match mime {
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "jpg",
    }
}

/// Writes `bytes` into the source's media directory and returns the asset
/// describing it.
///
/// The file is written to a temporary sibling and renamed into place, so a
/// reader never sees a partial image. An existing file with the same name is
/// left untouched.
///
/// # Errors
///
/// Returns [`CollectorError::Io`] if the directory cannot be created or the
/// file cannot be written.
pub async fn store_media(
    media_root: &Path,
    source_id: &str,
    message_id: i64,
    bytes: &[u8],
    content_type: Option<&str>,
) -> Result<MediaAsset, CollectorError> {
    let content_sha256 = format!("{:x}", Sha256::digest(bytes));
    let dir = media_root.join(source_id);
    let path = dir.join(format!("{content_sha256}.{}", extension_for(content_type)));

    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| CollectorError::io(&dir, e))?;

    if !tokio::fs::try_exists(&path)
        .await
        .map_err(|e| CollectorError::io(&path, e))?
    {
        let tmp = temp_sibling(&path, message_id);
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| CollectorError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| CollectorError::io(&path, e))?;
    }

    Ok(MediaAsset {
        message_id,
        source_id: source_id.to_string(),
        media_reference: path.display().to_string(),
        content_sha256,
        byte_size: i64::try_from(bytes.len()).unwrap_or(i64::MAX),
    })
}

fn temp_sibling(path: &Path, message_id: i64) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{message_id}.part"));
    path.with_file_name(name)
}

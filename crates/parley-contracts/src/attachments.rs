use std::path::Path;

use anyhow::Context;

use crate::conversation::ImageData;
use crate::error::ChatError;

pub const MAX_ATTACHMENT_BYTES: u64 = 10 * 1024 * 1024;

pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())?;
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "heic" => Some("image/heic"),
        "heif" => Some("image/heif"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

/// Checks type and size before any bytes are read.
pub fn validate_attachment(path: &Path, size: u64, limit: u64) -> Result<&'static str, ChatError> {
    let Some(mime) = mime_for_path(path) else {
        let ext = path
            .extension()
            .and_then(|value| value.to_str())
            .unwrap_or("none")
            .to_string();
        return Err(ChatError::UnsupportedAttachment(ext));
    };
    if size > limit {
        return Err(ChatError::AttachmentTooLarge { size, limit });
    }
    Ok(mime)
}

/// Image type from the file header. HEIC and HEIF share the ISO-BMFF
/// `ftyp` box and are told apart by brand.
pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        return Some("image/png");
    }
    if bytes.starts_with(&[0xff, 0xd8, 0xff]) {
        return Some("image/jpeg");
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return Some("image/gif");
    }
    if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
        return match &bytes[8..12] {
            b"heic" | b"heix" | b"hevc" | b"hevx" | b"heim" | b"heis" => Some("image/heic"),
            b"mif1" | b"msf1" => Some("image/heif"),
            _ => None,
        };
    }
    None
}

/// Reads an image from disk into an inline payload. The extension and size
/// are checked first, then the header; a mismatched extension is corrected
/// to the sniffed type. Validation failures surface as [`ChatError`] inside
/// the returned `anyhow::Error`.
pub fn load_attachment(path: &Path, limit: u64) -> anyhow::Result<ImageData> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("cannot read attachment {}", path.display()))?;
    validate_attachment(path, meta.len(), limit)?;
    let bytes =
        std::fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    let Some(mime) = sniff_mime(&bytes) else {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("attachment");
        let detail = format!("{name} (contents are not an image)");
        return Err(ChatError::UnsupportedAttachment(detail).into());
    };
    Ok(ImageData::from_bytes(mime, &bytes))
}

//! Upload and parameter validation for composite requests.

use serde::Serialize;
use std::ops::RangeInclusive;
use thiserror::Error;

use crate::compositor::has_pdf_header;
use crate::strategy::Strategy;

/// Accepted raster resolutions.
pub const DPI_RANGE: RangeInclusive<u32> = 72..=1200;

pub const MAX_LAYER_NAME_CHARS: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    Missing(&'static str),

    #[error("field '{0}' is empty")]
    Empty(&'static str),

    #[error("field '{field}' exceeds the {limit_mb} MB limit")]
    TooLarge { field: &'static str, limit_mb: usize },

    #[error("template is not a PDF")]
    NotPdf,

    #[error("artwork must be a PNG, JPEG, GIF, TIFF or WebP image")]
    UnsupportedImage,

    #[error("dpi must be a whole number between {} and {}, got '{0}'", DPI_RANGE.start(), DPI_RANGE.end())]
    InvalidDpi(String),

    #[error("invalid layer name: {0}")]
    InvalidLayerName(&'static str),

    #[error("{0}")]
    UnknownStrategy(String),
}

impl ValidationError {
    /// Whether the problem is the kind of file rather than the request shape.
    pub fn is_media_type(&self) -> bool {
        matches!(self, ValidationError::NotPdf | ValidationError::UnsupportedImage)
    }
}

/// Artwork formats ImageMagick is expected to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Png,
    Jpeg,
    Gif,
    Tiff,
    Webp,
}

impl ImageKind {
    pub fn extension(self) -> &'static str {
        match self {
            ImageKind::Png => "png",
            ImageKind::Jpeg => "jpg",
            ImageKind::Gif => "gif",
            ImageKind::Tiff => "tif",
            ImageKind::Webp => "webp",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            ImageKind::Png => "image/png",
            ImageKind::Jpeg => "image/jpeg",
            ImageKind::Gif => "image/gif",
            ImageKind::Tiff => "image/tiff",
            ImageKind::Webp => "image/webp",
        }
    }
}

/// Identifies the artwork format from its magic bytes.
pub fn detect_image(bytes: &[u8]) -> Option<ImageKind> {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some(ImageKind::Png);
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some(ImageKind::Jpeg);
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return Some(ImageKind::Gif);
    }
    if bytes.starts_with(b"II*\0") || bytes.starts_with(b"MM\0*") {
        return Some(ImageKind::Tiff);
    }
    if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some(ImageKind::Webp);
    }
    None
}

/// Checks an uploaded file is present, non-empty and within the limit.
pub fn check_upload(field: &'static str, bytes: Option<&[u8]>, limit_bytes: usize) -> Result<(), ValidationError> {
    let bytes = bytes.ok_or(ValidationError::Missing(field))?;
    if bytes.is_empty() {
        return Err(ValidationError::Empty(field));
    }
    if bytes.len() > limit_bytes {
        return Err(ValidationError::TooLarge {
            field,
            limit_mb: limit_bytes / (1024 * 1024),
        });
    }
    Ok(())
}

pub fn check_template(bytes: &[u8]) -> Result<(), ValidationError> {
    if has_pdf_header(bytes) {
        Ok(())
    } else {
        Err(ValidationError::NotPdf)
    }
}

pub fn check_artwork(bytes: &[u8]) -> Result<ImageKind, ValidationError> {
    detect_image(bytes).ok_or(ValidationError::UnsupportedImage)
}

/// Parses the optional `dpi` field.
pub fn parse_dpi(raw: Option<&str>, default: u32) -> Result<u32, ValidationError> {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return Ok(default);
    };
    raw.parse::<u32>()
        .ok()
        .filter(|dpi| DPI_RANGE.contains(dpi))
        .ok_or_else(|| ValidationError::InvalidDpi(raw.to_string()))
}

/// Trims the optional `layer_name` field, falling back to `default`.
pub fn normalize_layer_name(raw: Option<&str>, default: &str) -> Result<String, ValidationError> {
    let Some(raw) = raw else {
        return Ok(default.to_string());
    };
    let name = raw.trim();
    if name.is_empty() {
        return Err(ValidationError::InvalidLayerName("must not be blank"));
    }
    if name.chars().count() > MAX_LAYER_NAME_CHARS {
        return Err(ValidationError::InvalidLayerName("longer than 128 characters"));
    }
    if name.chars().any(char::is_control) {
        return Err(ValidationError::InvalidLayerName("contains control characters"));
    }
    Ok(name.to_string())
}

/// Parses the optional `strategy` field.
pub fn parse_strategy(raw: Option<&str>) -> Result<Option<Strategy>, ValidationError> {
    match raw.map(str::trim).filter(|r| !r.is_empty()) {
        None => Ok(None),
        Some(name) => name
            .parse()
            .map(Some)
            .map_err(|e: crate::strategy::UnknownStrategy| ValidationError::UnknownStrategy(e.to_string())),
    }
}

/// Keeps a client-supplied file name printable and path-free for records.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ') {
                c
            } else {
                '_'
            }
        })
        .take(100)
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

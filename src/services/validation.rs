use image::{ImageFormat, ImageReader};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Formats accepted for body photos, tattoo designs and generated results.
const ACCEPTED_FORMATS: &[ImageFormat] = &[ImageFormat::Png, ImageFormat::Jpeg, ImageFormat::WebP];

/// Upper bound on either side of an accepted image.
const MAX_DIMENSION: u32 = 8192;

/// Size limits applied to uploaded images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLimits {
    pub max_bytes: usize,
}

impl Default for ImageLimits {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Metadata sniffed from an image without decoding its pixels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: String,
    pub content_type: String,
    pub width: u32,
    pub height: u32,
    pub size_bytes: usize,
}

impl ImageInfo {
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// Check that `data` is a readable image of an accepted format and size.
///
/// `field` names the input in error messages (`body_image`, `tattoo_image`,
/// `result`).
pub fn inspect_image(
    field: &str,
    data: &[u8],
    limits: ImageLimits,
) -> Result<ImageInfo, ValidationError> {
    // ── Size ─────────────────────────────────────────────────────────
    if data.is_empty() {
        return Err(ValidationError::Empty(field.to_string()));
    }
    if data.len() > limits.max_bytes {
        return Err(ValidationError::TooLarge {
            field: field.to_string(),
            size: data.len(),
            max: limits.max_bytes,
        });
    }

    // ── Format sniffing ──────────────────────────────────────────────
    let format = image::guess_format(data)
        .map_err(|_| ValidationError::NotAnImage(field.to_string()))?;
    if !ACCEPTED_FORMATS.contains(&format) {
        return Err(ValidationError::UnsupportedFormat {
            field: field.to_string(),
            format: format!("{format:?}"),
        });
    }

    // ── Header decode ────────────────────────────────────────────────
    let (width, height) = ImageReader::with_format(Cursor::new(data), format)
        .into_dimensions()
        .map_err(|e| ValidationError::Corrupt {
            field: field.to_string(),
            reason: e.to_string(),
        })?;
    if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(ValidationError::BadDimensions {
            field: field.to_string(),
            width,
            height,
        });
    }

    Ok(ImageInfo {
        format: format!("{format:?}").to_uppercase(),
        content_type: format.to_mime_type().to_string(),
        width,
        height,
        size_bytes: data.len(),
    })
}

/// Re-encode an accepted image as PNG. PNG input is returned as is.
pub fn ensure_png(field: &str, data: Vec<u8>) -> Result<Vec<u8>, ValidationError> {
    if matches!(image::guess_format(&data), Ok(ImageFormat::Png)) {
        return Ok(data);
    }

    let corrupt = |e: image::ImageError| ValidationError::Corrupt {
        field: field.to_string(),
        reason: e.to_string(),
    };
    let decoded = image::load_from_memory(&data).map_err(corrupt)?;
    let mut out = Cursor::new(Vec::with_capacity(data.len()));
    decoded.write_to(&mut out, ImageFormat::Png).map_err(corrupt)?;
    Ok(out.into_inner())
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("{0} is empty")]
    Empty(String),

    #[error("{field} is {size} bytes, limit is {max}")]
    TooLarge { field: String, size: usize, max: usize },

    #[error("{0} is not a recognizable image")]
    NotAnImage(String),

    #[error("{field} has unsupported format {format} (accepted: PNG, JPEG, WebP)")]
    UnsupportedFormat { field: String, format: String },

    #[error("{field} could not be decoded: {reason}")]
    Corrupt { field: String, reason: String },

    #[error("{field} has unsupported dimensions {width}x{height}")]
    BadDimensions { field: String, width: u32, height: u32 },

    #[error("invalid options: {0}")]
    Options(String),
}

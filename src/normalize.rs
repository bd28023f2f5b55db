//! Image normalisation: any supported input becomes a JPEG under a byte budget.
//!
//! The first encode is at full quality. While the result is over budget, both
//! dimensions shrink by `shrink_factor` (floored to whole pixels) and the image
//! is re-encoded at `reduced_quality`. The loop is capped by `max_passes` and
//! also stops when the dimensions cannot shrink any further, so it always
//! terminates.
//!
//! The encoded form is mirrored to `<scratch_dir>/<uuid>.jpg` for the lifetime
//! of the [`ImageAsset`]; the file goes away on [`ImageAsset::cleanup`] or drop.

use std::fs;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, GenericImageView, ImageEncoder, ImageFormat};
use tempfile::TempPath;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::NormalizeError;

/// Input formats accepted from sources.
pub const ACCEPTED_FORMATS: &[ImageFormat] = &[ImageFormat::Jpeg, ImageFormat::Png, ImageFormat::WebP];

pub const OUTPUT_MIME: &str = "image/jpeg";

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizeSettings {
    pub max_bytes: u64,
    pub initial_quality: u8,
    pub reduced_quality: u8,
    pub shrink_factor: f64,
    pub max_passes: u32,
    pub scratch_dir: PathBuf,
}

impl Default for NormalizeSettings {
    fn default() -> Self {
        Self {
            max_bytes: 1_000_000,
            initial_quality: 100,
            reduced_quality: 75,
            shrink_factor: 0.9,
            max_passes: 32,
            scratch_dir: PathBuf::from("./jobs"),
        }
    }
}

/// Checks the magic bytes against [`ACCEPTED_FORMATS`].
pub fn validate_format(bytes: &[u8]) -> Result<ImageFormat, NormalizeError> {
    let format = image::guess_format(bytes).map_err(|_| NormalizeError::UnsupportedFormat {
        format: "unknown".to_string(),
    })?;
    if !ACCEPTED_FORMATS.contains(&format) {
        return Err(NormalizeError::UnsupportedFormat {
            format: format!("{format:?}").to_lowercase(),
        });
    }
    Ok(format)
}

/// One shrink step. Floors, so the result is never larger than the input.
pub fn shrink_dimensions(width: u32, height: u32, factor: f64) -> (u32, u32) {
    let scale = |v: u32| (v as f64 * factor).floor() as u32;
    (scale(width).min(width), scale(height).min(height))
}

/// Validates, decodes, encodes and fits `raw` to the budget.
pub fn normalize(raw: Vec<u8>, settings: &NormalizeSettings) -> Result<ImageAsset, NormalizeError> {
    validate_format(&raw)?;
    let mut asset = ImageAsset::from_raw(raw, settings)?;
    asset.fit_to_budget(settings)?;
    info!(
        id = %asset.id(),
        width = asset.width(),
        height = asset.height(),
        size = asset.size_bytes(),
        passes = asset.passes(),
        "Image normalised"
    );
    Ok(asset)
}

/// A fetched image and its canonical encoded form.
pub struct ImageAsset {
    id: Uuid,
    raw: Vec<u8>,
    encoded: Vec<u8>,
    width: u32,
    height: u32,
    passes: u32,
    scratch: TempPath,
}

impl std::fmt::Debug for ImageAsset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageAsset")
            .field("id", &self.id)
            .field("raw_len", &self.raw.len())
            .field("encoded_len", &self.encoded.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("passes", &self.passes)
            .field("scratch", &self.scratch.display())
            .finish()
    }
}

impl ImageAsset {
    /// Decodes `raw` and encodes it once at `initial_quality`. No size limit is applied yet.
    pub fn from_raw(raw: Vec<u8>, settings: &NormalizeSettings) -> Result<Self, NormalizeError> {
        let decoded = image::load_from_memory(&raw).map_err(NormalizeError::InvalidImage)?;
        let (width, height) = decoded.dimensions();
        let encoded = encode_jpeg(&decoded, settings.initial_quality)?;

        let id = Uuid::new_v4();
        fs::create_dir_all(&settings.scratch_dir).map_err(|source| NormalizeError::Scratch {
            path: settings.scratch_dir.clone(),
            source,
        })?;
        let path = settings.scratch_dir.join(format!("{id}.jpg"));
        write_scratch(&path, &encoded)?;

        debug!(%id, width, height, size = encoded.len(), "Encoded image at full quality");
        Ok(Self {
            id,
            raw,
            encoded,
            width,
            height,
            passes: 0,
            scratch: TempPath::from_path(path),
        })
    }

    /// Shrinks and re-encodes in place until the encoded size is within `settings.max_bytes`.
    pub fn fit_to_budget(&mut self, settings: &NormalizeSettings) -> Result<(), NormalizeError> {
        if self.size_bytes() <= settings.max_bytes {
            return Ok(());
        }

        let source = image::load_from_memory(&self.raw).map_err(NormalizeError::InvalidImage)?;
        while self.size_bytes() > settings.max_bytes {
            let unreachable = NormalizeError::BudgetUnreachable {
                passes: self.passes,
                size: self.size_bytes(),
                budget: settings.max_bytes,
            };
            if self.passes >= settings.max_passes {
                return Err(unreachable);
            }
            let (width, height) = shrink_dimensions(self.width, self.height, settings.shrink_factor);
            if width == 0 || height == 0 || (width, height) == (self.width, self.height) {
                return Err(unreachable);
            }

            let resized = source.resize_exact(width, height, FilterType::Lanczos3);
            self.encoded = encode_jpeg(&resized, settings.reduced_quality)?;
            self.width = width;
            self.height = height;
            self.passes += 1;
            debug!(
                id = %self.id,
                pass = self.passes,
                width,
                height,
                size = self.encoded.len(),
                budget = settings.max_bytes,
                "Shrunk image"
            );
        }

        write_scratch(&self.scratch, &self.encoded)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Bytes exactly as fetched.
    pub fn raw_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn size_bytes(&self) -> u64 {
        self.encoded.len() as u64
    }

    /// Number of shrink passes applied.
    pub fn passes(&self) -> u32 {
        self.passes
    }

    pub fn path(&self) -> &Path {
        &self.scratch
    }

    pub fn file_name(&self) -> String {
        format!("{}.jpg", self.id)
    }

    pub fn mime_type(&self) -> &'static str {
        OUTPUT_MIME
    }

    /// Releases the scratch file. Dropping the asset does the same, silently.
    pub fn cleanup(self) -> Result<(), NormalizeError> {
        let path = self.scratch.to_path_buf();
        self.scratch
            .close()
            .map_err(|source| NormalizeError::Scratch { path, source })
    }
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, NormalizeError> {
    let rgb = image.to_rgb8();
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100))
        .write_image(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
        .map_err(NormalizeError::Encode)?;
    Ok(buf)
}

fn write_scratch(path: &Path, bytes: &[u8]) -> Result<(), NormalizeError> {
    fs::write(path, bytes).map_err(|source| NormalizeError::Scratch {
        path: path.to_path_buf(),
        source,
    })
}

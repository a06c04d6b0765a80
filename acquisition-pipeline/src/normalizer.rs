use bytes::Bytes;
use common::utils::config::{Bounds, CollectionConfig, QualitySearch};
use image::{codecs::jpeg::JpegEncoder, imageops::FilterType, DynamicImage, RgbImage};
use thiserror::Error;
use tracing::trace;

/// File extension of every normalized image.
pub const OUTPUT_EXTENSION: &str = "jpg";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizeSpec {
    pub target_width: u32,
    pub target_height: u32,
    pub quality_band: Bounds<u8>,
    pub max_byte_size: usize,
    pub quality_search: QualitySearch,
}

impl NormalizeSpec {
    pub fn from_config(config: &CollectionConfig) -> Self {
        Self {
            target_width: config.target_width,
            target_height: config.target_height,
            quality_band: config.quality_band,
            max_byte_size: config.max_byte_size,
            quality_search: config.quality_search,
        }
    }

    fn validate(&self) -> Result<(), NormalizeError> {
        if self.target_width == 0 || self.target_height == 0 {
            return Err(NormalizeError::InvalidSpec(
                "target dimensions must be non-zero".into(),
            ));
        }
        let band = self.quality_band;
        if band.min == 0 || band.max > 100 || band.min >= band.max {
            return Err(NormalizeError::InvalidSpec(format!(
                "quality band {}..{} is invalid",
                band.min, band.max
            )));
        }
        if self.max_byte_size == 0 {
            return Err(NormalizeError::InvalidSpec(
                "byte ceiling must be non-zero".into(),
            ));
        }
        if matches!(self.quality_search, QualitySearch::Linear { step: 0 }) {
            return Err(NormalizeError::InvalidSpec(
                "linear quality step must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub quality: u8,
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("Unreadable image: {0}")]
    UnreadableImage(String),
    #[error("Image exceeds {max_byte_size} bytes even at quality {}", .best_effort.quality)]
    SizeFloorExceeded {
        max_byte_size: usize,
        best_effort: NormalizedImage,
    },
    #[error("Invalid normalization spec: {0}")]
    InvalidSpec(String),
    #[error("Encoding failed: {0}")]
    Encoding(String),
    #[error("Normalization task failed: {0}")]
    Task(String),
}

/// Runs [`normalize`] on the blocking thread pool.
#[derive(Debug, Clone)]
pub struct Normalizer {
    spec: NormalizeSpec,
}

impl Normalizer {
    pub fn new(spec: NormalizeSpec) -> Self {
        Self { spec }
    }

    pub async fn normalize(&self, raw: Bytes) -> Result<NormalizedImage, NormalizeError> {
        let spec = self.spec.clone();
        tokio::task::spawn_blocking(move || normalize(&raw, &spec))
            .await
            .map_err(|err| NormalizeError::Task(err.to_string()))?
    }
}

/// Decodes `raw`, cover-resizes and center-crops it to the target dimensions,
/// then re-encodes it as JPEG at the highest quality in the band that fits the
/// byte ceiling.
pub fn normalize(raw: &[u8], spec: &NormalizeSpec) -> Result<NormalizedImage, NormalizeError> {
    spec.validate()?;

    let decoded = image::load_from_memory(raw)
        .map_err(|err| NormalizeError::UnreadableImage(err.to_string()))?;
    if decoded.width() == 0 || decoded.height() == 0 {
        return Err(NormalizeError::UnreadableImage(
            "image has zero dimensions".into(),
        ));
    }

    let framed = cover_and_crop(&decoded, spec.target_width, spec.target_height);
    let rgb = framed.to_rgb8();

    match spec.quality_search {
        QualitySearch::Binary => binary_quality_search(&rgb, spec),
        QualitySearch::Linear { step } => linear_quality_search(&rgb, spec, step),
    }
}

fn cover_and_crop(image: &DynamicImage, target_width: u32, target_height: u32) -> DynamicImage {
    let (x, y, width, height) =
        cover_crop_rect(image.width(), image.height(), target_width, target_height);
    image
        .crop_imm(x, y, width, height)
        .resize_exact(target_width, target_height, FilterType::Lanczos3)
}

/// Source-space rectangle `(x, y, width, height)` that a cover resize to the
/// target box would keep after center cropping. Cropping first keeps the
/// intermediate buffer no larger than the source.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn cover_crop_rect(
    source_width: u32,
    source_height: u32,
    target_width: u32,
    target_height: u32,
) -> (u32, u32, u32, u32) {
    let scale_x = f64::from(target_width) / f64::from(source_width);
    let scale_y = f64::from(target_height) / f64::from(source_height);
    let scale = scale_x.max(scale_y);

    let width = ((f64::from(target_width) / scale).round() as u32).clamp(1, source_width);
    let height = ((f64::from(target_height) / scale).round() as u32).clamp(1, source_height);

    let x = source_width.saturating_sub(width) / 2;
    let y = source_height.saturating_sub(height) / 2;
    (x, y, width, height)
}

fn encode_jpeg(rgb: &RgbImage, quality: u8) -> Result<Vec<u8>, NormalizeError> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality)
        .encode_image(rgb)
        .map_err(|err| NormalizeError::Encoding(err.to_string()))?;
    trace!(quality, bytes = buffer.len(), "encoded jpeg");
    Ok(buffer)
}

fn finish(rgb: &RgbImage, bytes: Vec<u8>, quality: u8) -> NormalizedImage {
    NormalizedImage {
        bytes,
        width: rgb.width(),
        height: rgb.height(),
        quality,
    }
}

/// Highest quality whose output fits, assuming size grows with quality.
fn binary_quality_search(rgb: &RgbImage, spec: &NormalizeSpec) -> Result<NormalizedImage, NormalizeError> {
    let Bounds { min, max } = spec.quality_band;

    let at_max = encode_jpeg(rgb, max)?;
    if at_max.len() <= spec.max_byte_size {
        return Ok(finish(rgb, at_max, max));
    }

    let at_min = encode_jpeg(rgb, min)?;
    if at_min.len() > spec.max_byte_size {
        return Err(NormalizeError::SizeFloorExceeded {
            max_byte_size: spec.max_byte_size,
            best_effort: finish(rgb, at_min, min),
        });
    }

    // `low` always fits, `high` never does.
    let (mut low, mut high) = (min, max);
    let mut best = at_min;
    while high.saturating_sub(low) > 1 {
        let mid = low.saturating_add(high.saturating_sub(low) / 2);
        let encoded = encode_jpeg(rgb, mid)?;
        if encoded.len() <= spec.max_byte_size {
            low = mid;
            best = encoded;
        } else {
            high = mid;
        }
    }

    Ok(finish(rgb, best, low))
}

/// Steps down from the band max by `step`, finishing with the band min.
fn linear_quality_search(
    rgb: &RgbImage,
    spec: &NormalizeSpec,
    step: u8,
) -> Result<NormalizedImage, NormalizeError> {
    let Bounds { min, max } = spec.quality_band;
    let mut quality = max;

    loop {
        let encoded = encode_jpeg(rgb, quality)?;
        if encoded.len() <= spec.max_byte_size {
            return Ok(finish(rgb, encoded, quality));
        }
        if quality <= min {
            return Err(NormalizeError::SizeFloorExceeded {
                max_byte_size: spec.max_byte_size,
                best_effort: finish(rgb, encoded, quality),
            });
        }
        quality = quality.saturating_sub(step).max(min);
    }
}

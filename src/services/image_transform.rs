//! Decode, bound and re-encode a single image.
//!
//! Everything here is synchronous and CPU-bound; callers on the async runtime
//! should go through `spawn_blocking`.

use crate::config::{OptimizerConfig, OutputFormat};
use image::{
    DynamicImage, ExtendedColorType, ImageEncoder, ImageFormat,
    codecs::jpeg::JpegEncoder,
    imageops::FilterType,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("failed to encode {format} derivative: {reason}")]
    Encode { format: OutputFormat, reason: String },
}

#[derive(Debug, Clone, Copy)]
pub struct TransformSettings {
    pub max_width: u32,
    pub max_height: u32,
    pub format: OutputFormat,
    /// Lossy WebP quality, 0 to 100.
    pub webp_quality: f32,
    pub jpeg_quality: u8,
}

impl From<&OptimizerConfig> for TransformSettings {
    fn from(cfg: &OptimizerConfig) -> Self {
        Self {
            max_width: cfg.max_width,
            max_height: cfg.max_height,
            format: cfg.output_format,
            webp_quality: cfg.webp_quality,
            jpeg_quality: cfg.jpeg_quality,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl std::fmt::Display for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone)]
pub struct TransformedImage {
    pub bytes: Vec<u8>,
    pub source: Dimensions,
    pub output: Dimensions,
    pub source_format: Option<ImageFormat>,
    pub resized: bool,
}

/// Dimensions that fit inside `max_width` x `max_height` with a uniform scale.
///
/// Images already inside the bounds are returned unchanged; nothing is ever
/// enlarged.
pub fn target_dimensions(width: u32, height: u32, max_width: u32, max_height: u32) -> Dimensions {
    if width <= max_width && height <= max_height {
        return Dimensions { width, height };
    }
    let ratio = f64::min(
        max_width as f64 / width as f64,
        max_height as f64 / height as f64,
    );
    let scale = |value: u32| ((value as f64 * ratio).round() as u32).clamp(1, value);
    Dimensions {
        width: scale(width),
        height: scale(height),
    }
}

/// Decode `data`, shrink it to the configured bounds if needed and re-encode
/// it in the target format. Re-encoding always happens, which also drops any
/// embedded metadata.
pub fn transform(data: &[u8], settings: &TransformSettings) -> Result<TransformedImage, TransformError> {
    let source_format = image::guess_format(data).ok();
    let img = image::load_from_memory(data).map_err(TransformError::Decode)?;
    let source = Dimensions {
        width: img.width(),
        height: img.height(),
    };
    let output = target_dimensions(
        source.width,
        source.height,
        settings.max_width,
        settings.max_height,
    );

    let resized = output != source;
    let img = if resized {
        img.resize_exact(output.width, output.height, FilterType::Lanczos3)
    } else {
        img
    };

    let bytes = encode(&img, settings).map_err(|reason| TransformError::Encode {
        format: settings.format,
        reason,
    })?;

    Ok(TransformedImage {
        bytes,
        source,
        output,
        source_format,
        resized,
    })
}

fn encode(img: &DynamicImage, settings: &TransformSettings) -> Result<Vec<u8>, String> {
    let (width, height) = (img.width(), img.height());
    match settings.format {
        OutputFormat::Webp => {
            let memory = if img.color().has_alpha() {
                let rgba = img.to_rgba8();
                webp::Encoder::from_rgba(rgba.as_raw(), width, height)
                    .encode_simple(false, settings.webp_quality)
            } else {
                let rgb = img.to_rgb8();
                webp::Encoder::from_rgb(rgb.as_raw(), width, height)
                    .encode_simple(false, settings.webp_quality)
            }
            .map_err(|err| format!("{:?}", err))?;
            Ok(memory.to_vec())
        }
        OutputFormat::Jpeg => {
            let mut buf = Vec::new();
            let rgb = img.to_rgb8();
            JpegEncoder::new_with_quality(&mut buf, settings.jpeg_quality)
                .write_image(rgb.as_raw(), width, height, ExtendedColorType::Rgb8)
                .map_err(|err| err.to_string())?;
            Ok(buf)
        }
    }
}

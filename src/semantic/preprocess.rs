//! Image decoding and normalization ahead of inference.
//!
//! Rejects payloads that are empty, over the size ceiling, not a known
//! raster format, or that fail to decode. Accepted images are converted to
//! RGB8 and scaled so the shortest side matches the encoder's input size.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, RgbImage};

use crate::semantic::embeddings::EmbeddingError;

/// Formats the decoder accepts. Anything else is rejected up front.
const SUPPORTED_FORMATS: &[ImageFormat] = &[
    ImageFormat::Png,
    ImageFormat::Jpeg,
    ImageFormat::Gif,
    ImageFormat::WebP,
    ImageFormat::Bmp,
];

/// A decoded image ready for an encoder.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub rgb: RgbImage,
    /// Dimensions before scaling (width, height)
    pub original_dimensions: (u32, u32),
}

/// Decode `bytes` and scale it for an encoder expecting `input_size` pixels
/// on the shortest side. Images already at or below that size are kept as is.
pub fn prepare_image(
    bytes: &[u8],
    max_bytes: usize,
    input_size: u32,
) -> Result<PreparedImage, EmbeddingError> {
    if bytes.is_empty() {
        return Err(EmbeddingError::InvalidImage("empty payload".to_string()));
    }

    if bytes.len() > max_bytes {
        return Err(EmbeddingError::InvalidImage(format!(
            "image is {} bytes, limit is {}",
            bytes.len(),
            max_bytes
        )));
    }

    let format = image::guess_format(bytes)
        .map_err(|_| EmbeddingError::InvalidImage("unrecognized image format".to_string()))?;
    if !SUPPORTED_FORMATS.contains(&format) {
        return Err(EmbeddingError::InvalidImage(format!(
            "unsupported image format {format:?}"
        )));
    }

    let img = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| EmbeddingError::InvalidImage(format!("failed to decode image: {e}")))?;

    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return Err(EmbeddingError::InvalidImage("image has no pixels".to_string()));
    }

    Ok(PreparedImage {
        rgb: scale_to_input(img, input_size).to_rgb8(),
        original_dimensions: (width, height),
    })
}

fn scale_to_input(img: DynamicImage, input_size: u32) -> DynamicImage {
    let (width, height) = img.dimensions();
    let shortest = width.min(height);
    if input_size == 0 || shortest <= input_size {
        return img;
    }

    let scale = input_size as f64 / shortest as f64;
    let new_w = ((width as f64) * scale).round().max(1.0) as u32;
    let new_h = ((height as f64) * scale).round().max(1.0) as u32;
    img.resize_exact(new_w, new_h, FilterType::Triangle)
}

//! Image utility functions

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};

use crate::error::{Error, Result};

/// Decode image from bytes (JPEG, PNG, etc.)
pub fn decode_image(data: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(data).map_err(|e| Error::Decode(e.to_string()))
}

/// Encode image to JPEG bytes
pub fn encode_jpeg(image: &DynamicImage, quality: u8) -> anyhow::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
    image.to_rgb8().write_with_encoder(encoder)?;
    Ok(buffer)
}

/// Encode image to PNG bytes
pub fn encode_png(image: &DynamicImage) -> anyhow::Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

//! Image preprocessing for the classification model

use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::Array4;

use crate::error::{Error, Result};
use crate::utils::image::decode_image;

use super::tensor::{ElementType, Tensor, TensorSpec};

/// Standard input size for MobileNetV1 224
pub const CLASSIFIER_INPUT_SIZE: (u32, u32) = (224, 224);

/// Decode `data` and pack it into a tensor matching `target` exactly
///
/// Images are converted to RGB and resized with bilinear filtering to
/// the target's spatial size. Aspect ratio is not preserved. Only uint8
/// targets are supported; values are packed raw, without normalization.
pub fn prepare(data: &[u8], target: &TensorSpec) -> Result<Tensor> {
    let (width, height) = target
        .image_size()
        .ok_or_else(|| Error::shape_mismatch(&target.shape, "[1, height, width, 3]"))?;

    if target.element_type != ElementType::UInt8 {
        return Err(Error::UnsupportedElementType(target.element_type));
    }

    let image = decode_image(data)?;
    let resized = image.resize_exact(width, height, FilterType::Triangle);

    let array = image_to_nhwc_u8(&resized)?;
    let tensor = Tensor::from_u8(array.shape().to_vec(), array.into_raw_vec_and_offset().0)?;

    target.check(&tensor)?;
    Ok(tensor)
}

/// Convert image to NHWC tensor with raw 0-255 values
fn image_to_nhwc_u8(image: &DynamicImage) -> Result<Array4<u8>> {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    let shape = (1, height as usize, width as usize, 3);

    // to_rgb8 already yields row-major HWC bytes
    let raw = rgb.into_raw();
    let len = raw.len();
    Array4::from_shape_vec(shape, raw).map_err(|_| Error::shape_mismatch(shape, len))
}

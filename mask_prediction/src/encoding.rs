use image::{GrayImage, ImageError, ImageFormat, Luma};
use ndarray::Array2;
use std::io::Cursor;

/// Scales probabilities to 0..=255. Values are truncated, out-of-range values
/// saturate and NaN maps to 0.
pub fn mask_to_image(mask: &Array2<f32>) -> GrayImage {
    let (height, width) = mask.dim();
    GrayImage::from_fn(width as u32, height as u32, |x, y| {
        Luma([(mask[[y as usize, x as usize]] * 255.0) as u8])
    })
}

pub fn mask_to_png(mask: &Array2<f32>) -> Result<Vec<u8>, ImageError> {
    let mut buffer = Cursor::new(Vec::new());
    mask_to_image(mask).write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

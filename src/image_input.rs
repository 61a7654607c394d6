//! Turning a drawn digit saved as an image into the 784 raw pixels the recognizer expects.

use crate::error::Result;
use crate::IMAGE_SIDE;
use image::imageops::FilterType;
use image::DynamicImage;
use std::path::Path;

/// Scale to 28x28 and convert to inverted grayscale: dark ink on a light canvas becomes
/// bright strokes on black, like the MNIST digits. Values are in `[0, 255]`.
pub fn raw_pixels_from_image(img: &DynamicImage) -> Vec<f32> {
    let side = IMAGE_SIDE as u32;
    let resized = img.resize_exact(side, side, FilterType::Lanczos3).to_rgb8();
    resized
        .pixels()
        .map(|p| {
            let [r, g, b] = p.0;
            255.0 - (r as f32 + g as f32 + b as f32) / 3.0
        })
        .collect()
}

pub fn load_raw_pixels<P: AsRef<Path>>(path: P) -> Result<Vec<f32>> {
    let img = image::open(path)?;
    Ok(raw_pixels_from_image(&img))
}

use crate::error::{Error, Result};
use crate::IMAGE_PIXELS;

/// Mean/range feature scaling: every pixel `p` becomes `(p - mean) / (max - min)`.
///
/// Used for both the training set and single-image inference. A flat image has no range
/// and is rejected with [`Error::DegenerateImage`].
pub fn normalize(raw_pixels: &[f32]) -> Result<Vec<f32>> {
    if raw_pixels.len() != IMAGE_PIXELS {
        return Err(Error::InvalidVectorLength {
            expected: IMAGE_PIXELS,
            actual: raw_pixels.len(),
        });
    }

    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    let mut sum = 0.0f64;
    for (index, &value) in raw_pixels.iter().enumerate() {
        if !value.is_finite() || !(0.0..=255.0).contains(&value) {
            return Err(Error::InvalidPixel { index, value });
        }
        min = min.min(value);
        max = max.max(value);
        sum += f64::from(value);
    }

    if max == min {
        return Err(Error::DegenerateImage { value: min });
    }

    let mean = sum / raw_pixels.len() as f64;
    let range = f64::from(max - min);
    Ok(raw_pixels
        .iter()
        .map(|&p| ((f64::from(p) - mean) / range) as f32)
        .collect())
}

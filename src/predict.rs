use crate::error::{Error, Result};
use crate::model::Network;
use crate::{IMAGE_PIXELS, IMAGE_SIDE};
use ndarray::prelude::*;
use std::sync::Arc;

/// Index of the largest value. Ties go to the lowest index; NaN never wins.
pub fn argmax<'a, I>(values: I) -> usize
where
    I: IntoIterator<Item = &'a f32>,
{
    let mut best = (0, f32::NEG_INFINITY);
    for (i, &v) in values.into_iter().enumerate() {
        if v > best.1 {
            best = (i, v);
        }
    }
    best.0
}

/// Classifies one normalized feature vector with a shared, read-only network.
#[derive(Debug, Clone)]
pub struct Predictor {
    network: Arc<Network>,
}

impl Predictor {
    pub fn new(network: Arc<Network>) -> Self {
        Predictor { network }
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Softmax output for the ten digit classes.
    pub fn probabilities(&self, features: &[f32]) -> Result<Vec<f32>> {
        if features.len() != IMAGE_PIXELS {
            return Err(Error::InvalidVectorLength {
                expected: IMAGE_PIXELS,
                actual: features.len(),
            });
        }
        let input = Array4::from_shape_vec((1, 1, IMAGE_SIDE, IMAGE_SIDE), features.to_vec())
            .map_err(|_| Error::InvalidVectorLength {
                expected: IMAGE_PIXELS,
                actual: features.len(),
            })?;
        Ok(self.network.predict_proba(input).row(0).to_vec())
    }

    pub fn predict(&self, features: &[f32]) -> Result<u8> {
        let probs = self.probabilities(features)?;
        Ok(argmax(&probs) as u8)
    }
}

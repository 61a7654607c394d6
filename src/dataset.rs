use crate::error::{Error, Result};
use crate::normalize::normalize;
use crate::{IMAGE_PIXELS, IMAGE_SIDE, NUM_CLASSES};
use ndarray::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// A 28x28 grayscale image with its (optional) digit label.
///
/// The normalized features are computed once, at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledImage {
    label: Option<u8>,
    raw_pixels: Vec<f32>,
    features: Vec<f32>,
}

impl LabeledImage {
    pub fn new(label: Option<u8>, raw_pixels: Vec<f32>) -> Result<Self> {
        if let Some(l) = label {
            if usize::from(l) >= NUM_CLASSES {
                return Err(Error::LabelOutOfRange { label: l });
            }
        }
        let features = normalize(&raw_pixels)?;
        Ok(LabeledImage {
            label,
            raw_pixels,
            features,
        })
    }

    pub fn unlabeled(raw_pixels: Vec<f32>) -> Result<Self> {
        Self::new(None, raw_pixels)
    }

    pub fn label(&self) -> Option<u8> {
        self.label
    }

    pub fn raw_pixels(&self) -> &[f32] {
        &self.raw_pixels
    }

    pub fn features(&self) -> &[f32] {
        &self.features
    }
}

/// An ordered set of labeled images.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    samples: Vec<LabeledImage>,
    labels: Vec<u8>,
}

impl Dataset {
    /// Every sample must carry a label.
    pub fn new(samples: Vec<LabeledImage>) -> Result<Self> {
        let labels = samples
            .iter()
            .enumerate()
            .map(|(index, s)| s.label().ok_or(Error::MissingLabel { index }))
            .collect::<Result<Vec<u8>>>()?;
        Ok(Dataset { samples, labels })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[LabeledImage] {
        &self.samples
    }

    pub fn labels(&self) -> &[u8] {
        &self.labels
    }

    /// Stack the features of `indices` into a `(batch, 1, 28, 28)` tensor.
    pub fn batch(&self, indices: &[usize]) -> (Array4<f32>, Vec<u8>) {
        let mut pixels = Vec::with_capacity(indices.len() * IMAGE_PIXELS);
        let mut labels = Vec::with_capacity(indices.len());
        for &idx in indices {
            pixels.extend_from_slice(self.samples[idx].features());
            labels.push(self.labels[idx]);
        }
        let input = Array4::from_shape_vec((indices.len(), 1, IMAGE_SIDE, IMAGE_SIDE), pixels)
            .expect("every sample holds 28x28 features");
        (input, labels)
    }
}

/// Seeded source of the per-epoch mini-batch order.
///
/// Each call to [`BatchSampler::next_epoch`] reshuffles the sample indices and splits them
/// into batches; the last batch may be smaller.
pub struct BatchSampler {
    order: Vec<usize>,
    batch_size: usize,
    rng: StdRng,
}

impl BatchSampler {
    pub fn new(dataset_len: usize, batch_size: usize, seed: u64) -> Self {
        assert!(batch_size > 0, "batch size must be positive");
        BatchSampler {
            order: (0..dataset_len).collect(),
            batch_size,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }

    pub fn next_epoch(&mut self) -> Vec<Vec<usize>> {
        self.order.shuffle(&mut self.rng);
        self.order
            .chunks(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(label: u8) -> LabeledImage {
        let raw = (0..IMAGE_PIXELS)
            .map(|i| ((i * (label as usize + 1)) % 256) as f32)
            .collect();
        LabeledImage::new(Some(label), raw).unwrap()
    }

    #[test]
    fn labeled_image_derives_features_once() {
        let img = image(3);
        assert_eq!(img.label(), Some(3));
        assert_eq!(img.raw_pixels().len(), IMAGE_PIXELS);
        assert_eq!(img.features(), normalize(img.raw_pixels()).unwrap().as_slice());
    }

    #[test]
    fn dataset_rejects_unlabeled_samples() {
        let unlabeled = LabeledImage::unlabeled(image(1).raw_pixels().to_vec()).unwrap();
        assert!(matches!(
            Dataset::new(vec![image(0), unlabeled]),
            Err(Error::MissingLabel { index: 1 })
        ));
    }

    #[test]
    fn labels_outside_zero_to_nine_are_rejected() {
        let raw = image(2).raw_pixels().to_vec();
        assert!(matches!(
            LabeledImage::new(Some(10), raw),
            Err(Error::LabelOutOfRange { label: 10 })
        ));
    }

    #[test]
    fn batch_has_image_shape_and_keeps_label_order() {
        let ds = Dataset::new((0..5).map(image).collect()).unwrap();
        let (input, labels) = ds.batch(&[4, 0, 2]);
        assert_eq!(input.dim(), (3, 1, 28, 28));
        assert_eq!(labels, vec![4, 0, 2]);
        assert_eq!(input[[1, 0, 0, 1]], ds.samples()[0].features()[1]);
    }

    #[test]
    fn sampler_covers_every_index_once_per_epoch() {
        let mut sampler = BatchSampler::new(35, 16, 1);
        assert_eq!(sampler.batches_per_epoch(), 3);
        let batches = sampler.next_epoch();
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![16, 16, 3]);
        let mut seen: Vec<usize> = batches.into_iter().flatten().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..35).collect::<Vec<_>>());
    }

    #[test]
    fn same_seed_gives_same_batch_order() {
        let mut a = BatchSampler::new(100, 16, 123);
        let mut b = BatchSampler::new(100, 16, 123);
        for _ in 0..3 {
            assert_eq!(a.next_epoch(), b.next_epoch());
        }
        let mut c = BatchSampler::new(100, 16, 124);
        assert_ne!(BatchSampler::new(100, 16, 123).next_epoch(), c.next_epoch());
    }
}

use crate::dataset::{Dataset, LabeledImage};
use crate::error::{Error, Result};
use crate::{IMAGE_PIXELS, NUM_CLASSES};
use log::{debug, info};
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;

/// Bytes before the first pixel of an IDX image file (magic + count + rows + cols).
pub const IMAGE_HEADER_LEN: usize = 16;
/// Bytes before the first label of an IDX label file (magic + count).
pub const LABEL_HEADER_LEN: usize = 8;

/// Decoder for MNIST's IDX image/label file pair.
pub struct IdxDatasetReader;

impl IdxDatasetReader {
    /// Read the first `count` images and labels and normalize them into a [`Dataset`].
    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(
        image_path: P,
        label_path: Q,
        count: usize,
    ) -> Result<Dataset> {
        let raw = Self::read_raw(image_path.as_ref(), label_path.as_ref(), count)?;

        // No cross-image dependency: normalize in parallel, collect keeps file order.
        let samples = raw
            .into_par_iter()
            .map(|(label, pixels)| LabeledImage::new(Some(label), pixels))
            .collect::<Result<Vec<_>>>()?;
        info!(
            "loaded {} samples from {}",
            samples.len(),
            image_path.as_ref().display()
        );
        Dataset::new(samples)
    }

    /// Byte-level decoding only: `(label, 784 pixels widened to f32)` per sample.
    pub fn read_raw(
        image_path: &Path,
        label_path: &Path,
        count: usize,
    ) -> Result<Vec<(u8, Vec<f32>)>> {
        let mut images = BufReader::new(File::open(image_path)?);
        let mut labels = BufReader::new(File::open(label_path)?);

        let mut image_header = [0u8; IMAGE_HEADER_LEN];
        read_or_truncated(&mut images, &mut image_header, image_path, count, 0)?;
        let mut label_header = [0u8; LABEL_HEADER_LEN];
        read_or_truncated(&mut labels, &mut label_header, label_path, count, 0)?;
        debug!(
            "idx headers: images {:02x?}, labels {:02x?}",
            image_header, label_header
        );

        let mut samples = Vec::with_capacity(count);
        let mut pixel_buf = [0u8; IMAGE_PIXELS];
        let mut label_buf = [0u8; 1];
        for index in 0..count {
            read_or_truncated(&mut images, &mut pixel_buf, image_path, count, index)?;
            read_or_truncated(&mut labels, &mut label_buf, label_path, count, index)?;

            let label = label_buf[0];
            if usize::from(label) >= NUM_CLASSES {
                return Err(Error::InvalidLabel { index, label });
            }
            samples.push((label, pixel_buf.iter().map(|&b| f32::from(b)).collect()));
        }
        Ok(samples)
    }
}

fn read_or_truncated<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    path: &Path,
    expected: usize,
    found: usize,
) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => Error::DatasetTruncated {
            path: path.to_path_buf(),
            expected,
            found,
        },
        _ => Error::Io(e),
    })
}

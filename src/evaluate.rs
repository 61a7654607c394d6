use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::model::Network;
use crate::predict::argmax;
use crate::NUM_CLASSES;
use ndarray::prelude::*;
use rayon::prelude::*;
use std::fmt;

/// Counts of (actual, predicted) label pairs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfusionMatrix {
    counts: [[u64; NUM_CLASSES]; NUM_CLASSES],
}

impl ConfusionMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, actual: u8, predicted: u8) {
        self.counts[actual as usize][predicted as usize] += 1;
    }

    pub fn merge(mut self, other: &ConfusionMatrix) -> Self {
        for (row, other_row) in self.counts.iter_mut().zip(other.counts.iter()) {
            for (c, o) in row.iter_mut().zip(other_row.iter()) {
                *c += o;
            }
        }
        self
    }

    pub fn count(&self, actual: u8, predicted: u8) -> u64 {
        self.counts[actual as usize][predicted as usize]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().flatten().sum()
    }

    pub fn correct(&self) -> u64 {
        (0..NUM_CLASSES).map(|i| self.counts[i][i]).sum()
    }

    /// `None` when nothing has been recorded.
    pub fn accuracy(&self) -> Option<f64> {
        let total = self.total();
        (total > 0).then(|| self.correct() as f64 / total as f64)
    }

    /// Of the samples predicted as `class`, the fraction that really were.
    pub fn precision(&self, class: u8) -> Option<f64> {
        let c = class as usize;
        let predicted: u64 = (0..NUM_CLASSES).map(|a| self.counts[a][c]).sum();
        (predicted > 0).then(|| self.counts[c][c] as f64 / predicted as f64)
    }

    /// Of the samples of `class`, the fraction predicted as such.
    pub fn recall(&self, class: u8) -> Option<f64> {
        let c = class as usize;
        let actual: u64 = self.counts[c].iter().sum();
        (actual > 0).then(|| self.counts[c][c] as f64 / actual as f64)
    }
}

impl fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "accuracy: {:.4} ({}/{})",
            self.accuracy().unwrap_or(0.0),
            self.correct(),
            self.total()
        )?;
        write!(f, "actual\\pred")?;
        for p in 0..NUM_CLASSES {
            write!(f, "{p:>6}")?;
        }
        writeln!(f, "  recall")?;
        for (a, row) in self.counts.iter().enumerate() {
            write!(f, "{a:>11}")?;
            for c in row {
                write!(f, "{c:>6}")?;
            }
            match self.recall(a as u8) {
                Some(r) => writeln!(f, "  {r:.3}")?,
                None => writeln!(f, "      -")?,
            }
        }
        Ok(())
    }
}

/// Result of scoring a network on a held-out set.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub confusion: ConfusionMatrix,
    pub accuracy: f64,
    pub score: f64,
}

/// Maps a network to a score; lower scores are better.
pub trait ScoreCalculator {
    fn calculate_score(&self, network: &Network) -> Result<Evaluation>;
}

/// `score = 1 - accuracy` on a fixed test set.
pub struct AccuracyCalculator<'a> {
    dataset: &'a Dataset,
    batch_size: usize,
}

impl<'a> AccuracyCalculator<'a> {
    pub fn new(dataset: &'a Dataset, batch_size: usize) -> Self {
        AccuracyCalculator {
            dataset,
            batch_size: batch_size.max(1),
        }
    }
}

impl ScoreCalculator for AccuracyCalculator<'_> {
    fn calculate_score(&self, network: &Network) -> Result<Evaluation> {
        if self.dataset.is_empty() {
            return Err(Error::EmptyEvaluationSet);
        }

        let indices: Vec<usize> = (0..self.dataset.len()).collect();
        let confusion = indices
            .par_chunks(self.batch_size)
            .map(|chunk| {
                let (input, labels) = self.dataset.batch(chunk);
                let probs = network.predict_proba(input);
                let mut local = ConfusionMatrix::new();
                for (row, &label) in probs.axis_iter(Axis(0)).zip(labels.iter()) {
                    local.record(label, argmax(row.iter()) as u8);
                }
                local
            })
            .reduce(ConfusionMatrix::new, |a, b| a.merge(&b));

        let accuracy = confusion.accuracy().ok_or(Error::EmptyEvaluationSet)?;
        Ok(Evaluation {
            confusion,
            accuracy,
            score: 1.0 - accuracy,
        })
    }
}

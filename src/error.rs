use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("dataset {path} truncated: expected {expected} samples, found {found}")]
    DatasetTruncated {
        path: PathBuf,
        expected: usize,
        found: usize,
    },

    #[error("invalid label {label} for sample {index} (expected 0..=9)")]
    InvalidLabel { index: usize, label: u8 },

    #[error("label {label} is not a digit (expected 0..=9)")]
    LabelOutOfRange { label: u8 },

    #[error("sample {index} has no label")]
    MissingLabel { index: usize },

    #[error("expected a vector of {expected} values, got {actual}")]
    InvalidVectorLength { expected: usize, actual: usize },

    #[error("pixel {index} has value {value}, expected a finite value in [0, 255]")]
    InvalidPixel { index: usize, value: f32 },

    #[error("degenerate image: every pixel equals {value}")]
    DegenerateImage { value: f32 },

    #[error("evaluation set is empty")]
    EmptyEvaluationSet,

    #[error("training aborted after {epochs_completed} completed epochs: {reason}")]
    TrainingAborted {
        epochs_completed: usize,
        best_epoch: Option<usize>,
        reason: String,
    },

    #[error("no model found at {0}")]
    ModelNotFound(PathBuf),

    #[error("model at {path} is corrupt: {reason}")]
    ModelCorrupt { path: PathBuf, reason: String },

    #[error("no model loaded: train one or call init() first")]
    ModelNotLoaded,

    #[error("invalid architecture: {0}")]
    InvalidArchitecture(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

//! Handwritten digit recognition: a small convolutional network trained on MNIST.
//!
//! The pipeline is IDX files -> [`normalize`] -> [`dataset`] batches -> [`train`], which
//! scores every epoch and keeps the best network through [`store`]. At inference time raw
//! pixels go through the same normalizer and then [`predict`]; [`recognizer`] ties the two
//! together behind `init` / `train` / `predict`.

pub mod architecture;
pub mod config;
pub mod dataset;
pub mod error;
pub mod evaluate;
pub mod idx;
pub mod image_input;
pub mod layers;
pub mod model;
pub mod normalize;
pub mod optim;
pub mod predict;
pub mod recognizer;
pub mod store;
pub mod termination;
pub mod train;

pub use architecture::NetworkArchitecture;
pub use config::TrainConfig;
pub use dataset::{Dataset, LabeledImage};
pub use error::{Error, Result};
pub use idx::IdxDatasetReader;
pub use predict::Predictor;
pub use recognizer::DigitRecognizer;
pub use store::{ModelCheckpoint, ModelStore};
pub use train::{TrainingController, TrainingOutcome};

/// MNIST images are square.
pub const IMAGE_SIDE: usize = 28;
pub const IMAGE_PIXELS: usize = IMAGE_SIDE * IMAGE_SIDE;
pub const NUM_CLASSES: usize = 10;

use crate::config::TrainConfig;
use crate::error::{Error, Result};
use crate::model::Network;
use crate::normalize::normalize;
use crate::predict::Predictor;
use crate::store::ModelStore;
use crate::termination::Cancelled;
use crate::train::{TrainingController, TrainingOutcome};

use log::info;
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};

/// Entry point for the rest of an application: one shared network, loaded once, swapped
/// atomically when a training run finishes.
pub struct DigitRecognizer {
    config: TrainConfig,
    store: ModelStore,
    network: RwLock<Option<Arc<Network>>>,
    cancelled: Cancelled,
}

impl DigitRecognizer {
    pub fn new(config: TrainConfig) -> Result<Self> {
        config.validate()?;
        Ok(DigitRecognizer {
            config,
            store: ModelStore::default(),
            network: RwLock::new(None),
            cancelled: Cancelled::default(),
        })
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn is_loaded(&self) -> bool {
        self.current().is_some()
    }

    /// Load the stored model unless one is already in memory.
    ///
    /// Returns whether a network is loaded afterwards. A missing model file is not an error.
    pub fn init(&self) -> Result<bool> {
        let mut slot = self.network.write().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Ok(true);
        }
        match self.store.restore(&self.config.model_path) {
            Ok(checkpoint) => {
                *slot = Some(Arc::new(checkpoint.network));
                Ok(true)
            }
            Err(Error::ModelNotFound(path)) => {
                info!("no model at {}, train one first", path.display());
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Train a new network, store it at the model path and make it current.
    pub fn train(&self, train_size: usize, test_size: usize) -> Result<TrainingOutcome> {
        self.cancelled.reset();
        self.run_training(train_size, test_size)
    }

    /// Run [`DigitRecognizer::train`] on a dedicated thread.
    ///
    /// The cancel flag is cleared before the thread starts, so a `cancel_training` issued
    /// as soon as this returns is honoured.
    pub fn spawn_training(
        self: Arc<Self>,
        train_size: usize,
        test_size: usize,
    ) -> JoinHandle<Result<TrainingOutcome>> {
        self.cancelled.reset();
        thread::spawn(move || self.run_training(train_size, test_size))
    }

    fn run_training(&self, train_size: usize, test_size: usize) -> Result<TrainingOutcome> {
        let controller =
            TrainingController::new(self.config.clone())?.with_cancellation(self.cancelled.clone());
        let outcome = controller.train(train_size, test_size)?;

        self.store.save(&outcome.best, &self.config.model_path)?;
        let network = Arc::new(outcome.best.network.clone());
        *self.network.write().unwrap_or_else(|e| e.into_inner()) = Some(network);
        info!(
            "model from epoch {} saved to {}",
            outcome.best.epoch,
            self.config.model_path.display()
        );
        Ok(outcome)
    }

    /// Ask a running training to stop after its current epoch.
    pub fn cancel_training(&self) {
        self.cancelled.cancel();
    }

    /// Classify 784 raw pixels in `[0, 255]`.
    pub fn predict(&self, raw_pixels: &[f32]) -> Result<u8> {
        let features = normalize(raw_pixels)?;
        self.predictor()?.predict(&features)
    }

    pub fn probabilities(&self, raw_pixels: &[f32]) -> Result<Vec<f32>> {
        let features = normalize(raw_pixels)?;
        self.predictor()?.probabilities(&features)
    }

    /// Predictor over the network current at the time of the call.
    pub fn predictor(&self) -> Result<Predictor> {
        self.current()
            .map(Predictor::new)
            .ok_or(Error::ModelNotLoaded)
    }

    fn current(&self) -> Option<Arc<Network>> {
        self.network
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

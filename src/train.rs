use crate::architecture::NetworkArchitecture;
use crate::config::TrainConfig;
use crate::dataset::{BatchSampler, Dataset};
use crate::error::{Error, Result};
use crate::evaluate::{AccuracyCalculator, ScoreCalculator};
use crate::idx::IdxDatasetReader;
use crate::model::{Module, Network};
use crate::optim::{negative_log_likelihood, NesterovSgd, Optimizer};
use crate::store::{ModelCheckpoint, ModelStore};
use crate::termination::{
    first_epoch_termination, first_iteration_termination, Cancelled, EpochTerminationCondition,
    IterationTerminationCondition, MaxEpochTime, MaxEpochs, TargetScore, TerminationReason,
};

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::{Duration, Instant};

const EVAL_BATCH_SIZE: usize = 64;

/// What a finished run hands back: the best checkpoint and why the loop stopped.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub best: ModelCheckpoint,
    pub termination: TerminationReason,
    pub epochs_completed: usize,
    pub elapsed: Duration,
}

struct TrainingState {
    epochs_completed: usize,
    started: Instant,
    best: Option<ModelCheckpoint>,
    termination: Option<TerminationReason>,
}

impl TrainingState {
    fn new() -> Self {
        TrainingState {
            epochs_completed: 0,
            started: Instant::now(),
            best: None,
            termination: None,
        }
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Keep `checkpoint` if it scores strictly lower than every earlier epoch.
    fn record(&mut self, checkpoint: ModelCheckpoint) -> bool {
        let improved = self
            .best
            .as_ref()
            .map_or(true, |best| checkpoint.score < best.score);
        if improved {
            self.best = Some(checkpoint);
        }
        improved
    }

    fn abort(&self, reason: String) -> Error {
        let best_epoch = self.best.as_ref().map(|b| b.epoch);
        warn!(
            "aborting training after {} epochs (best epoch: {:?}): {reason}",
            self.epochs_completed, best_epoch
        );
        Error::TrainingAborted {
            epochs_completed: self.epochs_completed,
            best_epoch,
            reason,
        }
    }
}

/// Runs the epoch loop for one architecture and configuration.
pub struct TrainingController {
    config: TrainConfig,
    architecture: NetworkArchitecture,
    store: ModelStore,
    epoch_conditions: Vec<Box<dyn EpochTerminationCondition>>,
    iteration_conditions: Vec<Box<dyn IterationTerminationCondition>>,
}

impl TrainingController {
    pub fn new(config: TrainConfig) -> Result<Self> {
        Self::with_architecture(config, NetworkArchitecture::mnist())
    }

    pub fn with_architecture(config: TrainConfig, architecture: NetworkArchitecture) -> Result<Self> {
        config.validate()?;
        architecture.validate()?;

        let mut epoch_conditions: Vec<Box<dyn EpochTerminationCondition>> =
            vec![Box::new(MaxEpochs(config.max_epochs))];
        if let Some(target) = config.target_score {
            epoch_conditions.push(Box::new(TargetScore(target)));
        }
        let iteration_conditions: Vec<Box<dyn IterationTerminationCondition>> =
            vec![Box::new(MaxEpochTime(config.max_epoch_time()))];

        Ok(TrainingController {
            store: ModelStore::new(architecture.clone()),
            config,
            architecture,
            epoch_conditions,
            iteration_conditions,
        })
    }

    /// Let another thread stop the run between epochs.
    pub fn with_cancellation(mut self, cancelled: Cancelled) -> Self {
        self.epoch_conditions.push(Box::new(cancelled));
        self
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn store(&self) -> &ModelStore {
        &self.store
    }

    /// Load the configured MNIST files and train on the first `train_size` / `test_size` samples.
    pub fn train(&self, train_size: usize, test_size: usize) -> Result<TrainingOutcome> {
        info!("loading {train_size} training and {test_size} test samples");
        let train = IdxDatasetReader::load(
            self.config.train_image_path(),
            self.config.train_label_path(),
            train_size,
        )?;
        let test = IdxDatasetReader::load(
            self.config.test_image_path(),
            self.config.test_label_path(),
            test_size,
        )?;
        self.fit(&train, &test)
    }

    pub fn fit(&self, train: &Dataset, test: &Dataset) -> Result<TrainingOutcome> {
        if test.is_empty() {
            return Err(Error::EmptyEvaluationSet);
        }
        if train.is_empty() {
            return Err(Error::InvalidConfig("training set is empty".into()));
        }

        let config = &self.config;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut network = Network::from_architecture(&self.architecture, &mut rng)?;
        let mut sampler = BatchSampler::new(train.len(), config.batch_size, config.seed);
        let mut optimizer = NesterovSgd::new(config.learning_rate, config.momentum);
        let scorer = AccuracyCalculator::new(test, EVAL_BATCH_SIZE);

        info!(
            "training on {} samples, evaluating on {} (batch size {}, lr {}, momentum {})",
            train.len(),
            test.len(),
            config.batch_size,
            config.learning_rate,
            config.momentum
        );

        let pb = if config.show_progress {
            ProgressBar::new((config.max_epochs * sampler.batches_per_epoch()) as u64)
        } else {
            ProgressBar::hidden()
        };
        pb.set_style(
            ProgressStyle::with_template(
                "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let mut state = TrainingState::new();

        while state.termination.is_none() {
            let epoch = state.epochs_completed + 1;
            let epoch_start = Instant::now();
            let mut loss_sum = 0.0f64;
            let mut seen = 0usize;
            let mut interrupted = None;

            for batch in sampler.next_epoch() {
                let (input, labels) = train.batch(&batch);

                network.zero_grad();
                let probs = network.forward_batch(input);
                let (loss, one_hot) = negative_log_likelihood(&labels, &probs);
                let batch_loss = loss.sum();
                if !batch_loss.is_finite() {
                    pb.finish_and_clear();
                    return Err(state.abort(format!("non-finite loss in epoch {epoch}")));
                }
                network.backward(one_hot.into_dyn());
                optimizer.step(&mut network);

                loss_sum += batch_loss as f64;
                seen += labels.len();
                pb.set_message(format!("epoch {epoch} loss {:.4}", loss_sum / seen as f64));
                pb.inc(1);

                interrupted =
                    first_iteration_termination(&self.iteration_conditions, epoch_start.elapsed());
                if interrupted.is_some() {
                    break;
                }
            }
            state.epochs_completed = epoch;

            if !network.is_finite() {
                pb.finish_and_clear();
                return Err(state.abort(format!("non-finite weights after epoch {epoch}")));
            }

            let eval = scorer.calculate_score(&network)?;
            pb.suspend(|| {
                info!(
                    "epoch {epoch}: mean loss {:.4}, accuracy {:.4}, score {:.4} ({:.1}s)",
                    loss_sum / seen.max(1) as f64,
                    eval.accuracy,
                    eval.score,
                    epoch_start.elapsed().as_secs_f64()
                );
                debug!("confusion matrix after epoch {epoch}:\n{}", eval.confusion);
            });

            let checkpoint = ModelCheckpoint {
                epoch,
                score: eval.score,
                network: network.clone(),
            };
            self.store.save(&checkpoint, config.latest_checkpoint_path())?;
            if state.record(checkpoint) {
                if let Some(best) = &state.best {
                    self.store.save(best, config.best_checkpoint_path())?;
                }
            }

            state.termination = interrupted
                .or_else(|| first_epoch_termination(&self.epoch_conditions, epoch, eval.score));
        }
        pb.finish_and_clear();

        let (Some(best), Some(termination)) = (state.best.take(), state.termination.take()) else {
            return Err(state.abort("no epoch was evaluated".into()));
        };
        let elapsed = state.elapsed();
        info!(
            "training stopped after {} epochs in {:.1}s: {termination}; best epoch {} with score {:.4}",
            state.epochs_completed,
            elapsed.as_secs_f64(),
            best.epoch,
            best.score
        );

        Ok(TrainingOutcome {
            best,
            termination,
            epochs_completed: state.epochs_completed,
            elapsed,
        })
    }
}

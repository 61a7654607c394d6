use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Training and storage configuration.
///
/// Every field has a default, so a TOML file only needs to list what it overrides.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Directory holding the four MNIST IDX files.
    pub data_dir: PathBuf,
    pub train_images: String,
    pub train_labels: String,
    pub test_images: String,
    pub test_labels: String,
    /// Where the best network of a run is stored and where `init()` looks for it.
    pub model_path: PathBuf,
    /// Per-epoch checkpoints (latest and best so far) land here while training runs.
    pub checkpoint_dir: PathBuf,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub momentum: f32,
    pub max_epochs: usize,
    /// Wall-clock ceiling for a single epoch.
    pub max_epoch_minutes: u64,
    /// Stop as soon as an epoch scores at or below this value.
    pub target_score: Option<f64>,
    pub seed: u64,
    pub show_progress: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            train_images: "train-images-idx3-ubyte".to_string(),
            train_labels: "train-labels-idx1-ubyte".to_string(),
            test_images: "t10k-images-idx3-ubyte".to_string(),
            test_labels: "t10k-labels-idx1-ubyte".to_string(),
            model_path: PathBuf::from("resources/model.json"),
            checkpoint_dir: PathBuf::from("resources/checkpoints"),
            batch_size: 16,
            learning_rate: 0.01,
            momentum: 0.9,
            max_epochs: 10,
            max_epoch_minutes: 15,
            target_score: None,
            seed: 123,
            show_progress: true,
        }
    }
}

impl TrainConfig {
    /// Load a configuration from a TOML file. Missing keys keep their defaults.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: TrainConfig = toml::from_str(&content)
            .map_err(|e| Error::InvalidConfig(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be positive".into()));
        }
        if self.max_epochs == 0 {
            return Err(Error::InvalidConfig("max_epochs must be positive".into()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "learning_rate must be a positive number, got {}",
                self.learning_rate
            )));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(Error::InvalidConfig(format!(
                "momentum must be in [0, 1), got {}",
                self.momentum
            )));
        }
        if let Some(target) = self.target_score {
            if !(0.0..=1.0).contains(&target) {
                return Err(Error::InvalidConfig(format!(
                    "target_score must be in [0, 1], got {target}"
                )));
            }
        }
        Ok(())
    }

    pub fn max_epoch_time(&self) -> Duration {
        Duration::from_secs(self.max_epoch_minutes.saturating_mul(60))
    }

    pub fn train_image_path(&self) -> PathBuf {
        self.data_dir.join(&self.train_images)
    }

    pub fn train_label_path(&self) -> PathBuf {
        self.data_dir.join(&self.train_labels)
    }

    pub fn test_image_path(&self) -> PathBuf {
        self.data_dir.join(&self.test_images)
    }

    pub fn test_label_path(&self) -> PathBuf {
        self.data_dir.join(&self.test_labels)
    }

    pub fn latest_checkpoint_path(&self) -> PathBuf {
        self.checkpoint_dir.join("latest_model.json")
    }

    pub fn best_checkpoint_path(&self) -> PathBuf {
        self.checkpoint_dir.join("best_model.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_the_reference_training_setup() {
        let config = TrainConfig::default();
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.learning_rate, 0.01);
        assert_eq!(config.momentum, 0.9);
        assert_eq!(config.max_epochs, 10);
        assert_eq!(config.max_epoch_time(), Duration::from_secs(15 * 60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn huge_epoch_limit_saturates() {
        let config = TrainConfig {
            max_epoch_minutes: u64::MAX,
            ..TrainConfig::default()
        };
        assert_eq!(config.max_epoch_time(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn toml_overrides_only_listed_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_epochs = 5\nseed = 7\ndata_dir = \"mnist\"").unwrap();
        let config = TrainConfig::from_path(file.path()).unwrap();
        assert_eq!(config.max_epochs, 5);
        assert_eq!(config.seed, 7);
        assert_eq!(config.train_image_path(), PathBuf::from("mnist/train-images-idx3-ubyte"));
        assert_eq!(config.batch_size, 16);
    }

    #[test]
    fn rejects_bad_values() {
        let config = TrainConfig {
            momentum: 1.0,
            ..TrainConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = TrainConfig {
            batch_size: 0,
            ..TrainConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}

use crate::architecture::NetworkArchitecture;
use crate::error::{Error, Result};
use crate::model::Network;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

const FORMAT_VERSION: u32 = 1;

/// A trained network together with the epoch and score that produced it.
#[derive(Debug, Clone)]
pub struct ModelCheckpoint {
    pub epoch: usize,
    pub score: f64,
    pub network: Network,
}

#[derive(Serialize, Deserialize)]
struct CheckpointFile {
    format_version: u32,
    architecture: NetworkArchitecture,
    epoch: usize,
    score: f64,
    network: Network,
}

/// Saves and restores checkpoints for one expected architecture.
#[derive(Debug, Clone)]
pub struct ModelStore {
    architecture: NetworkArchitecture,
}

impl Default for ModelStore {
    fn default() -> Self {
        Self::new(NetworkArchitecture::mnist())
    }
}

impl ModelStore {
    pub fn new(architecture: NetworkArchitecture) -> Self {
        ModelStore { architecture }
    }

    pub fn architecture(&self) -> &NetworkArchitecture {
        &self.architecture
    }

    /// Write the checkpoint as JSON. The file is written next to `path` first and renamed
    /// into place, so readers never see a half-written model.
    pub fn save<P: AsRef<Path>>(&self, checkpoint: &ModelCheckpoint, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("json.tmp");

        let file = CheckpointFile {
            format_version: FORMAT_VERSION,
            architecture: self.architecture.clone(),
            epoch: checkpoint.epoch,
            score: checkpoint.score,
            network: checkpoint.network.clone(),
        };
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        serde_json::to_writer(&mut writer, &file)?;
        writer.flush()?;
        drop(writer);
        fs::rename(&tmp_path, path)?;

        debug!(
            "saved checkpoint (epoch {}, score {:.4}) to {}",
            checkpoint.epoch,
            checkpoint.score,
            path.display()
        );
        Ok(())
    }

    pub fn restore<P: AsRef<Path>>(&self, path: P) -> Result<ModelCheckpoint> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::ModelNotFound(path.to_path_buf()));
        }
        let corrupt = |reason: String| Error::ModelCorrupt {
            path: path.to_path_buf(),
            reason,
        };

        let reader = BufReader::new(File::open(path)?);
        let file: CheckpointFile =
            serde_json::from_reader(reader).map_err(|e| corrupt(e.to_string()))?;

        if file.format_version != FORMAT_VERSION {
            return Err(corrupt(format!(
                "unsupported format version {}",
                file.format_version
            )));
        }
        if file.architecture != self.architecture {
            return Err(corrupt("stored architecture differs from the expected one".into()));
        }

        // Lower the expected architecture to compare layer layout, geometry and tensor shapes.
        let reference = Network::from_architecture(&self.architecture, &mut StdRng::seed_from_u64(0))?;
        if file.network.signature() != reference.signature() {
            return Err(corrupt("network layers do not match the architecture".into()));
        }
        if !file.network.is_finite() {
            return Err(corrupt("network holds non-finite weights".into()));
        }

        info!(
            "restored model from {} (epoch {}, score {:.4})",
            path.display(),
            file.epoch,
            file.score
        );
        Ok(ModelCheckpoint {
            epoch: file.epoch,
            score: file.score,
            network: file.network,
        })
    }
}

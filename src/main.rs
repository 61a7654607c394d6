use digitnet::image_input::load_raw_pixels;
use digitnet::{DigitRecognizer, Error, Result, TrainConfig, IMAGE_PIXELS};

use clap::{Parser, Subcommand};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// TOML file with training and storage settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Where the trained model is stored and loaded from
    #[arg(long, global = true)]
    model_path: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a new model on the MNIST IDX files
    Train {
        #[arg(long, default_value_t = 60_000)]
        train_size: usize,
        #[arg(long, default_value_t = 10_000)]
        test_size: usize,
        /// Directory holding the IDX files
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long)]
        max_epochs: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Classify one digit
    Predict {
        /// Image file (PNG, ...) of a dark digit on a light background
        #[arg(long, required_unless_present = "raw", conflicts_with = "raw")]
        image: Option<PathBuf>,
        /// File of 784 raw grayscale bytes, row-major, white digit on black
        #[arg(long)]
        raw: Option<PathBuf>,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => TrainConfig::from_path(path)?,
        None => TrainConfig::default(),
    };
    if let Some(model_path) = cli.model_path {
        config.model_path = model_path;
    }

    match cli.command {
        Commands::Train {
            train_size,
            test_size,
            data_dir,
            max_epochs,
            seed,
        } => {
            if let Some(dir) = data_dir {
                config.data_dir = dir;
            }
            if let Some(n) = max_epochs {
                config.max_epochs = n;
            }
            if let Some(s) = seed {
                config.seed = s;
            }
            let recognizer = DigitRecognizer::new(config)?;
            let outcome = recognizer.train(train_size, test_size)?;
            println!(
                "best epoch {} with accuracy {:.4} ({})",
                outcome.best.epoch,
                1.0 - outcome.best.score,
                outcome.termination
            );
        }
        Commands::Predict { image, raw } => {
            let pixels = match (image, raw) {
                (Some(path), _) => load_raw_pixels(path)?,
                (None, Some(path)) => read_raw_bytes(&path)?,
                (None, None) => unreachable!("clap requires --image or --raw"),
            };
            let recognizer = DigitRecognizer::new(config)?;
            if !recognizer.init()? {
                return Err(Error::ModelNotLoaded);
            }
            let probabilities = recognizer.probabilities(&pixels)?;
            let digit = recognizer.predict(&pixels)?;
            info!("probabilities: {probabilities:.3?}");
            println!("{digit}");
        }
    }
    Ok(())
}

fn read_raw_bytes(path: &Path) -> Result<Vec<f32>> {
    let bytes = fs::read(path)?;
    if bytes.len() != IMAGE_PIXELS {
        return Err(Error::InvalidVectorLength {
            expected: IMAGE_PIXELS,
            actual: bytes.len(),
        });
    }
    Ok(bytes.into_iter().map(f32::from).collect())
}

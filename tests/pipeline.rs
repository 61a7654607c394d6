//! End to end: IDX files on disk, a short training run, persistence and inference.

use digitnet::dataset::{Dataset, LabeledImage};
use digitnet::termination::TerminationReason;
use digitnet::{
    DigitRecognizer, Error, IdxDatasetReader, Predictor, TrainConfig, TrainingController,
    IMAGE_PIXELS, IMAGE_SIDE,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

// Seven-segment strokes: (row range, column range).
const TOP: ((usize, usize), (usize, usize)) = ((4, 8), (8, 20));
const TOP_RIGHT: ((usize, usize), (usize, usize)) = ((4, 15), (16, 20));
const BOTTOM_RIGHT: ((usize, usize), (usize, usize)) = ((13, 25), (16, 20));
const BOTTOM: ((usize, usize), (usize, usize)) = ((21, 25), (8, 20));
const BOTTOM_LEFT: ((usize, usize), (usize, usize)) = ((13, 25), (8, 12));
const TOP_LEFT: ((usize, usize), (usize, usize)) = ((4, 15), (8, 12));
const MIDDLE: ((usize, usize), (usize, usize)) = ((12, 16), (8, 20));

fn segments(digit: u8) -> Vec<((usize, usize), (usize, usize))> {
    match digit {
        0 => vec![TOP, TOP_RIGHT, BOTTOM_RIGHT, BOTTOM, BOTTOM_LEFT, TOP_LEFT],
        1 => vec![TOP_RIGHT, BOTTOM_RIGHT],
        2 => vec![TOP, TOP_RIGHT, MIDDLE, BOTTOM_LEFT, BOTTOM],
        3 => vec![TOP, TOP_RIGHT, MIDDLE, BOTTOM_RIGHT, BOTTOM],
        4 => vec![TOP_LEFT, MIDDLE, TOP_RIGHT, BOTTOM_RIGHT],
        5 => vec![TOP, TOP_LEFT, MIDDLE, BOTTOM_RIGHT, BOTTOM],
        6 => vec![TOP, TOP_LEFT, MIDDLE, BOTTOM_LEFT, BOTTOM, BOTTOM_RIGHT],
        7 => vec![TOP, TOP_RIGHT, BOTTOM_RIGHT],
        8 => vec![TOP, TOP_RIGHT, BOTTOM_RIGHT, BOTTOM, BOTTOM_LEFT, TOP_LEFT, MIDDLE],
        9 => vec![TOP, TOP_RIGHT, BOTTOM_RIGHT, BOTTOM, TOP_LEFT, MIDDLE],
        _ => unreachable!(),
    }
}

/// A white-on-black digit bitmap, shifted by (dx, dy) pixels.
fn digit_bitmap(digit: u8, dx: isize, dy: isize) -> Vec<u8> {
    let mut pixels = vec![0u8; IMAGE_PIXELS];
    for ((r0, r1), (c0, c1)) in segments(digit) {
        for r in r0..r1 {
            for c in c0..c1 {
                let y = (r as isize + dy) as usize;
                let x = (c as isize + dx) as usize;
                pixels[y * IMAGE_SIDE + x] = 255;
            }
        }
    }
    pixels
}

fn shift(i: usize) -> (isize, isize) {
    const SHIFTS: [isize; 5] = [0, -2, 2, -1, 1];
    (SHIFTS[(i / 10) % 5], SHIFTS[(i / 50) % 5])
}

fn write_idx(dir: &Path, images: &str, labels: &str, count: usize) {
    let mut image_bytes = Vec::new();
    image_bytes.extend_from_slice(&0x0000_0803u32.to_be_bytes());
    image_bytes.extend_from_slice(&(count as u32).to_be_bytes());
    image_bytes.extend_from_slice(&(IMAGE_SIDE as u32).to_be_bytes());
    image_bytes.extend_from_slice(&(IMAGE_SIDE as u32).to_be_bytes());
    let mut label_bytes = Vec::new();
    label_bytes.extend_from_slice(&0x0000_0801u32.to_be_bytes());
    label_bytes.extend_from_slice(&(count as u32).to_be_bytes());

    for i in 0..count {
        let digit = (i % 10) as u8;
        let (dx, dy) = shift(i);
        image_bytes.extend(digit_bitmap(digit, dx, dy));
        label_bytes.push(digit);
    }
    fs::write(dir.join(images), image_bytes).unwrap();
    fs::write(dir.join(labels), label_bytes).unwrap();
}

fn config(dir: &TempDir) -> TrainConfig {
    let config = TrainConfig {
        data_dir: dir.path().join("data"),
        model_path: dir.path().join("resources/model.json"),
        checkpoint_dir: dir.path().join("resources/checkpoints"),
        show_progress: false,
        ..TrainConfig::default()
    };
    fs::create_dir_all(&config.data_dir).unwrap();
    write_idx(&config.data_dir, &config.train_images, &config.train_labels, 32);
    write_idx(&config.data_dir, &config.test_images, &config.test_labels, 16);
    config
}

fn raw(bytes: &[u8]) -> Vec<f32> {
    bytes.iter().map(|&b| f32::from(b)).collect()
}

#[test]
fn reader_returns_exactly_the_requested_count() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);

    let ds = IdxDatasetReader::load(config.train_image_path(), config.train_label_path(), 20).unwrap();
    assert_eq!(ds.len(), 20);
    assert_eq!(&ds.labels()[..12], &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 0, 1]);
    assert_eq!(ds.samples()[3].raw_pixels(), raw(&digit_bitmap(3, 0, 0)).as_slice());

    let err = IdxDatasetReader::load(config.train_image_path(), config.train_label_path(), 33)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::DatasetTruncated {
            expected: 33,
            found: 32,
            ..
        }
    ));
}

#[test]
fn small_run_stops_on_epoch_limit_and_model_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = TrainConfig {
        max_epochs: 2,
        ..config(&dir)
    };

    let trained = DigitRecognizer::new(config.clone()).unwrap();
    let outcome = trained.train(32, 16).unwrap();
    assert_eq!(outcome.termination, TerminationReason::MaxEpochs { epochs: 2 });
    assert_eq!(outcome.epochs_completed, 2);
    assert!((0.0..=1.0).contains(&outcome.best.score));
    assert!((1..=2).contains(&outcome.best.epoch));
    assert!(config.model_path.exists());
    assert!(config.latest_checkpoint_path().exists());
    assert!(config.best_checkpoint_path().exists());

    // A fresh process: nothing in memory until init restores the stored model.
    let restarted = DigitRecognizer::new(config).unwrap();
    assert!(matches!(
        restarted.predict(&raw(&digit_bitmap(4, 0, 0))),
        Err(Error::ModelNotLoaded)
    ));
    assert!(restarted.init().unwrap());

    for digit in 0..10 {
        let pixels = raw(&digit_bitmap(digit, 1, -1));
        assert_eq!(
            trained.probabilities(&pixels).unwrap(),
            restarted.probabilities(&pixels).unwrap()
        );
        let predicted = restarted.predict(&pixels).unwrap();
        assert!(predicted <= 9);
    }
}

#[test]
fn training_on_a_worker_thread_swaps_the_model_in() {
    let dir = TempDir::new().unwrap();
    let config = TrainConfig {
        max_epochs: 1,
        ..config(&dir)
    };
    let recognizer = Arc::new(DigitRecognizer::new(config).unwrap());
    assert!(!recognizer.is_loaded());

    let handle = Arc::clone(&recognizer).spawn_training(32, 16);
    let outcome = handle.join().unwrap().unwrap();
    assert_eq!(outcome.epochs_completed, 1);
    assert!(recognizer.is_loaded());
    assert!(recognizer.predict(&raw(&digit_bitmap(8, 0, 0))).unwrap() <= 9);
}

#[test]
fn cancel_right_after_spawning_stops_the_first_epoch() {
    let dir = TempDir::new().unwrap();
    let config = TrainConfig {
        max_epochs: 5,
        ..config(&dir)
    };
    let recognizer = Arc::new(DigitRecognizer::new(config).unwrap());

    let handle = Arc::clone(&recognizer).spawn_training(32, 16);
    recognizer.cancel_training();
    let outcome = handle.join().unwrap().unwrap();
    assert_eq!(outcome.termination, TerminationReason::Cancelled);
    assert_eq!(outcome.epochs_completed, 1);
    assert!(recognizer.is_loaded());
}

#[test]
fn canonical_digits_are_learned() {
    let dir = TempDir::new().unwrap();
    let config = TrainConfig {
        max_epochs: 100,
        target_score: Some(0.0),
        ..config(&dir)
    };

    let image = |digit: u8, dx: isize, dy: isize| {
        LabeledImage::new(Some(digit), raw(&digit_bitmap(digit, dx, dy))).unwrap()
    };
    let train = Dataset::new((0..90).map(|i| {
        let (dx, dy) = (((i / 10) % 3) as isize - 1, ((i / 30) % 3) as isize - 1);
        image((i % 10) as u8, dx, dy)
    }).collect())
    .unwrap();
    let canonical = Dataset::new((0..10).map(|d| image(d, 0, 0)).collect()).unwrap();

    let outcome = TrainingController::new(config)
        .unwrap()
        .fit(&train, &canonical)
        .unwrap();
    assert_eq!(outcome.best.score, 0.0, "stopped by {}", outcome.termination);

    let predictor = Predictor::new(Arc::new(outcome.best.network));
    for sample in canonical.samples() {
        assert_eq!(predictor.predict(sample.features()).ok(), sample.label());
    }
}

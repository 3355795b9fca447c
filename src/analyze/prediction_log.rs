//! JSONL prediction logging for future retraining.
//!
//! Each modality prediction is appended to a daily JSONL file; predictions
//! below the confidence threshold are mirrored to `needs_review/` for human
//! labelling. Logging failures never affect inference.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use crate::store::ModalityModel;

/// One logged prediction line.
#[derive(Debug, Serialize)]
struct PredictionLine<'a> {
    timestamp: String,
    image_path: &'a str,
    dataset_id: Option<&'a str>,
    prediction: &'a str,
    confidence: f64,
    probabilities: BTreeMap<&'a str, f64>,
    heuristic_votes: BTreeMap<&'a str, f64>,
    needs_review: bool,
    human_label: Option<String>,
    reviewed_at: Option<String>,
    model: ModelInfo<'a>,
}

/// Model identity recorded with each prediction.
#[derive(Debug, Serialize)]
struct ModelInfo<'a> {
    backbone: &'a str,
    version: &'a str,
}

/// Thread-safe JSONL logger with daily file rotation.
#[derive(Debug)]
pub struct PredictionLogger {
    log_dir: PathBuf,
    low_confidence_threshold: f64,
    write_lock: Mutex<()>,
}

impl PredictionLogger {
    /// Creates the logger, ensuring the log directories exist.
    ///
    /// # Errors
    ///
    /// Returns the IO error when the directories cannot be created.
    pub fn new(
        log_dir: impl Into<PathBuf>,
        low_confidence_threshold: f64,
    ) -> std::io::Result<Self> {
        let log_dir = log_dir.into();
        std::fs::create_dir_all(log_dir.join("needs_review"))?;
        info!(
            dir = %log_dir.display(),
            threshold = low_confidence_threshold,
            "prediction logger initialised"
        );
        Ok(Self {
            log_dir,
            low_confidence_threshold,
            write_lock: Mutex::new(()),
        })
    }

    /// Appends one prediction, mirroring low-confidence records for review.
    ///
    /// Runs on the blocking pool with the analyzer; failures are logged at
    /// debug level and swallowed.
    pub fn log_prediction(
        &self,
        image_path: &Path,
        dataset_id: Option<&str>,
        backbone: &str,
        model: &ModalityModel,
    ) {
        let needs_review = model.confidence < self.low_confidence_threshold;
        let image_path = image_path.to_string_lossy();
        let line = PredictionLine {
            timestamp: Utc::now().to_rfc3339(),
            image_path: &image_path,
            dataset_id,
            prediction: &model.pred,
            confidence: round4(model.confidence),
            probabilities: rounded(&model.probs),
            heuristic_votes: rounded(&model.heuristic_votes),
            needs_review,
            human_label: None,
            reviewed_at: None,
            model: ModelInfo {
                backbone,
                version: &model.version,
            },
        };

        if let Err(error) = self.append(&line, needs_review) {
            debug!(error = %error, "prediction logging failed (non-critical)");
        }
    }

    fn append(&self, line: &PredictionLine<'_>, needs_review: bool) -> std::io::Result<()> {
        let payload = serde_json::to_string(line)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let day = Utc::now().format("%Y-%m-%d");
        let filename = format!("predictions_{day}.jsonl");

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        append_line(&self.log_dir.join(&filename), &payload)?;
        if needs_review {
            append_line(&self.log_dir.join("needs_review").join(&filename), &payload)?;
        }
        Ok(())
    }
}

fn append_line(path: &Path, payload: &str) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{payload}")
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn rounded(values: &BTreeMap<String, f64>) -> BTreeMap<&str, f64> {
    values
        .iter()
        .map(|(k, v)| (k.as_str(), round4(*v)))
        .collect()
}

//! Per-file analysis: format sniffing plus modality inference.
//!
//! [`analyze_file`] is a pure function of a path and its folder context. It
//! is synchronous and CPU-bound; the pipeline invokes it on the blocking
//! pool under the analyze-stage semaphore. It never fails: any fault is
//! folded into an `error`-kind descriptor so a single bad file cannot abort
//! its dataset.

mod modality;
mod prediction_log;
mod sniff;

pub use modality::{
    INFERENCE_VERSION, MODALITY_CLASSES, ModalityClassifier, UniformClassifier, infer_modality,
};
pub use prediction_log::PredictionLogger;
pub use sniff::{SniffReport, sniff_file};

use std::panic::AssertUnwindSafe;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::store::{FileKind, FileMeta, FileRecord, ModalityModel};

/// How many trailing parent path segments feed the folder heuristics.
const FOLDER_CONTEXT_SEGMENTS: usize = 3;

/// Analyses one file into its catalog descriptor.
///
/// Panics from decoders are caught and converted into `error`-kind
/// descriptors; the returned record is always persistable.
#[must_use]
pub fn analyze_file(
    path: &Path,
    scan_root: &Path,
    dataset_id: &str,
    created_at: DateTime<Utc>,
    classifier: &dyn ModalityClassifier,
    prediction_log: Option<&PredictionLogger>,
) -> FileRecord {
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        analyze_file_inner(
            path,
            scan_root,
            dataset_id,
            created_at,
            classifier,
            prediction_log,
        )
    }));

    match outcome {
        Ok(record) => record,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            warn!(path = %path.display(), error = %message, "analysis panicked");
            error_record(path, scan_root, dataset_id, created_at, &message)
        }
    }
}

fn analyze_file_inner(
    path: &Path,
    scan_root: &Path,
    dataset_id: &str,
    created_at: DateTime<Utc>,
    classifier: &dyn ModalityClassifier,
    prediction_log: Option<&PredictionLogger>,
) -> FileRecord {
    let report = sniff_file(path);
    let relpath = relpath_of(path, scan_root);

    // Modality inference only applies to decodable 2D images; everything
    // else keeps the sniffer's modality with a fallback model.
    let modality_model = if report.kind == FileKind::Image {
        match image::open(path) {
            Ok(decoded) => {
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let model = infer_modality(
                    &decoded,
                    &filename,
                    &folder_context(path),
                    "",
                    classifier,
                );
                if let Some(log) = prediction_log {
                    log.log_prediction(path, Some(dataset_id), classifier.name(), &model);
                }
                model
            }
            Err(error) => {
                debug!(path = %path.display(), error = %error, "image undecodable, modality fallback");
                ModalityModel::fallback(&report.modality)
            }
        }
    } else {
        ModalityModel::fallback(&report.modality)
    };

    FileRecord {
        dataset_id: dataset_id.to_string(),
        relpath,
        abspath: path.to_string_lossy().into_owned(),
        kind: report.kind,
        modality: modality_model.pred.clone(),
        modality_model,
        ndim: report.ndim,
        dims: report.dims,
        size_bytes: report.size_bytes,
        created_at,
        meta: report.meta,
    }
}

/// Minimal descriptor for a file whose analysis failed outright.
fn error_record(
    path: &Path,
    scan_root: &Path,
    dataset_id: &str,
    created_at: DateTime<Utc>,
    message: &str,
) -> FileRecord {
    let size_bytes = i64::try_from(
        std::fs::metadata(path).map(|meta| meta.len()).unwrap_or(0),
    )
    .unwrap_or(0);

    FileRecord {
        dataset_id: dataset_id.to_string(),
        relpath: relpath_of(path, scan_root),
        abspath: path.to_string_lossy().into_owned(),
        kind: FileKind::Error,
        modality: "unknown".to_string(),
        modality_model: ModalityModel::error(message),
        ndim: None,
        dims: None,
        size_bytes,
        created_at,
        meta: FileMeta::Error {
            error: message.to_string(),
        },
    }
}

/// Path relative to the scan root; paths outside it keep their full form so
/// the record is still keyable.
fn relpath_of(path: &Path, scan_root: &Path) -> String {
    path.strip_prefix(scan_root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

/// The last three parent path segments, for folder-name heuristics.
fn folder_context(path: &Path) -> Vec<String> {
    let Some(parent) = path.parent() else {
        return Vec::new();
    };
    let segments: Vec<String> = parent
        .components()
        .filter_map(|c| match c {
            std::path::Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    let start = segments.len().saturating_sub(FOLDER_CONTEXT_SEGMENTS);
    segments[start..].to_vec()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "analysis panicked".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_analyze_png_produces_image_descriptor() {
        let temp = TempDir::new().unwrap();
        let scan_root = temp.path().join("extracted");
        let path = scan_root.join("us_scans/frame.png");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        image::GrayImage::from_pixel(128, 128, image::Luma([40]))
            .save(&path)
            .unwrap();

        let record = analyze_file(
            &path,
            &scan_root,
            "ds-1",
            Utc::now(),
            &UniformClassifier,
            None,
        );

        assert_eq!(record.kind, FileKind::Image);
        assert_eq!(record.relpath, "us_scans/frame.png");
        assert_eq!(record.ndim, Some(2));
        assert_eq!(record.dims, Some(vec![128, 128]));
        assert_eq!(record.meta, FileMeta::Image);
        // Folder token pushes the prediction to ultrasound.
        assert_eq!(record.modality, "US");
        assert_eq!(record.modality_model.method, "cnn+heuristics");
    }

    #[test]
    fn test_analyze_undecodable_image_falls_back() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("broken.png");
        std::fs::write(&path, b"not a png").unwrap();

        let record = analyze_file(
            &path,
            temp.path(),
            "ds-1",
            Utc::now(),
            &UniformClassifier,
            None,
        );

        assert_eq!(record.kind, FileKind::Image);
        assert_eq!(record.modality, "unknown");
        assert_eq!(record.modality_model.method, "fallback");
    }

    #[test]
    fn test_analyze_unknown_file_keeps_fallback_model() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("notes.txt");
        std::fs::write(&path, b"plain text").unwrap();

        let record = analyze_file(
            &path,
            temp.path(),
            "ds-1",
            Utc::now(),
            &UniformClassifier,
            None,
        );

        assert_eq!(record.kind, FileKind::Unknown);
        assert_eq!(record.modality_model.method, "fallback");
        assert_eq!(record.meta, FileMeta::Unknown);
    }

    #[test]
    fn test_panicking_classifier_yields_error_descriptor() {
        struct PanickingClassifier;
        impl ModalityClassifier for PanickingClassifier {
            fn name(&self) -> &'static str {
                "panicking"
            }
            fn predict(
                &self,
                _image: &image::DynamicImage,
            ) -> std::collections::BTreeMap<String, f64> {
                panic!("model weights corrupted")
            }
        }

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.png");
        image::GrayImage::new(8, 8).save(&path).unwrap();

        let record = analyze_file(
            &path,
            temp.path(),
            "ds-1",
            Utc::now(),
            &PanickingClassifier,
            None,
        );

        assert_eq!(record.kind, FileKind::Error);
        assert_eq!(record.relpath, "a.png");
        match &record.meta {
            FileMeta::Error { error } => assert!(error.contains("model weights corrupted")),
            other => panic!("expected error meta, got {other:?}"),
        }
        assert_eq!(record.modality_model.method, "error");
    }

    #[test]
    fn test_folder_context_takes_last_three_segments() {
        let path = Path::new("/a/b/c/d/e/file.png");
        assert_eq!(folder_context(path), vec!["c", "d", "e"]);
        assert_eq!(folder_context(Path::new("file.png")), Vec::<String>::new());
    }

    #[test]
    fn test_prediction_logging_records_image_predictions() {
        let temp = TempDir::new().unwrap();
        let log_dir = temp.path().join("logs");
        let logger = PredictionLogger::new(&log_dir, 2.0).unwrap();

        let path = temp.path().join("scan.png");
        image::GrayImage::new(16, 16).save(&path).unwrap();

        analyze_file(
            &path,
            temp.path(),
            "ds-9",
            Utc::now(),
            &UniformClassifier,
            Some(&logger),
        );

        // Threshold of 2.0 forces a needs_review mirror as well.
        let entries: Vec<_> = std::fs::read_dir(&log_dir)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path().is_file())
            .collect();
        assert_eq!(entries.len(), 1);
    }
}

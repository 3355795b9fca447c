//! Catalog record types and lifecycle states.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetStatus {
    /// Ingestion is in flight (or was interrupted by a restart).
    Processing,
    /// Catalog and summary are complete.
    Ready,
    /// Ingestion failed; `last_error` carries the cause.
    Failed,
}

impl DatasetStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    /// Returns true for `ready` and `failed`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }
}

impl fmt::Display for DatasetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DatasetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(Self::Processing),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid dataset status: {s}")),
        }
    }
}

/// Observable milestone of the per-dataset state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Job accepted, not yet picked up by the worker.
    Enqueued,
    /// Download + extraction in progress.
    Prepare,
    /// Per-file analysis fanout in progress.
    AnalyzeFiles,
    /// Summary composed; dataset ready.
    Finalize,
    /// Terminal failure.
    Failed,
}

impl Stage {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Prepare => "prepare",
            Self::AnalyzeFiles => "analyze_files",
            Self::Finalize => "finalize",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enqueued" => Ok(Self::Enqueued),
            "prepare" => Ok(Self::Prepare),
            "analyze_files" => Ok(Self::AnalyzeFiles),
            "finalize" => Ok(Self::Finalize),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid pipeline stage: {s}")),
        }
    }
}

/// Classification of a single catalogued file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    /// DICOM instance.
    Dicom,
    /// NIfTI volume.
    Nifti,
    /// Standard 2D image container.
    Image,
    /// Unrecognised format.
    Unknown,
    /// Analysis failed; meta carries the captured message.
    Error,
}

impl FileKind {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dicom => "dicom",
            Self::Nifti => "nifti",
            Self::Image => "image",
            Self::Unknown => "unknown",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for FileKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dicom" => Ok(Self::Dicom),
            "nifti" => Ok(Self::Nifti),
            "image" => Ok(Self::Image),
            "unknown" => Ok(Self::Unknown),
            "error" => Ok(Self::Error),
            _ => Err(format!("invalid file kind: {s}")),
        }
    }
}

/// Per-kind descriptor metadata from the sniffer.
///
/// The tag set is closed and mirrors [`FileKind`]; DICOM fields keep their
/// standard keyword spelling in the persisted JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileMeta {
    /// DICOM header identifiers read without pixel data.
    Dicom {
        /// SOP Class UID, when present.
        #[serde(rename = "SOPClassUID", skip_serializing_if = "Option::is_none", default)]
        sop_class_uid: Option<String>,
        /// Series Instance UID, when present. Drives series-level 3D counting.
        #[serde(
            rename = "SeriesInstanceUID",
            skip_serializing_if = "Option::is_none",
            default
        )]
        series_instance_uid: Option<String>,
        /// Study Instance UID, when present.
        #[serde(
            rename = "StudyInstanceUID",
            skip_serializing_if = "Option::is_none",
            default
        )]
        study_instance_uid: Option<String>,
        /// Body part examined, when present.
        #[serde(
            rename = "BodyPartExamined",
            skip_serializing_if = "Option::is_none",
            default
        )]
        body_part_examined: Option<String>,
    },
    /// NIfTI volume (no extra metadata).
    Nifti,
    /// 2D image (no extra metadata).
    Image,
    /// Unrecognised format (no extra metadata).
    Unknown,
    /// Analysis failed.
    Error {
        /// Captured failure message.
        error: String,
    },
}

impl FileMeta {
    /// Returns the DICOM series UID when this is a DICOM descriptor.
    #[must_use]
    pub fn series_instance_uid(&self) -> Option<&str> {
        match self {
            Self::Dicom {
                series_instance_uid,
                ..
            } => series_instance_uid.as_deref(),
            _ => None,
        }
    }
}

/// Output of the hybrid modality inference for one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModalityModel {
    /// Winning label.
    pub pred: String,
    /// `winner / Σ max(0, votes)`.
    pub confidence: f64,
    /// Inference version tag.
    pub version: String,
    /// `cnn+heuristics`, `fallback`, or `error`.
    pub method: String,
    /// Classifier probability distribution.
    pub probs: BTreeMap<String, f64>,
    /// Additive votes per label (classifier probs included).
    pub heuristic_votes: BTreeMap<String, f64>,
    /// Which signal sources contributed.
    pub sources: Vec<String>,
    /// Diagnostic detail captured during inference.
    pub details: ModalityModelDetails,
}

impl ModalityModel {
    /// Fallback model used when no decodable 2D image is available;
    /// carries the sniffer's modality verbatim.
    #[must_use]
    pub fn fallback(pred: impl Into<String>) -> Self {
        Self {
            pred: pred.into(),
            confidence: 0.0,
            version: "n/a".to_string(),
            method: "fallback".to_string(),
            probs: BTreeMap::new(),
            heuristic_votes: BTreeMap::new(),
            sources: vec!["sniff".to_string()],
            details: ModalityModelDetails::default(),
        }
    }

    /// Model recorded for files whose analysis failed outright.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            pred: "unknown".to_string(),
            confidence: 0.0,
            version: "n/a".to_string(),
            method: "error".to_string(),
            probs: BTreeMap::new(),
            heuristic_votes: BTreeMap::new(),
            sources: Vec::new(),
            details: ModalityModelDetails {
                error: Some(message.into()),
                ..ModalityModelDetails::default()
            },
        }
    }
}

/// Diagnostic signals captured while inferring a modality.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModalityModelDetails {
    /// Width / height.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub aspect_ratio: Option<f64>,
    /// Whether the image read as grayscale.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub grayscale: Option<bool>,
    /// Fraction of pixels on an edge.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub edge_density: Option<f64>,
    /// Leading bins of the 32-bin intensity histogram.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub intensity_hist: Option<Vec<u64>>,
    /// Captured failure message for error models.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

/// One analysed file, keyed by `(dataset_id, relpath)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Owning dataset.
    pub dataset_id: String,
    /// Path relative to the scan root.
    pub relpath: String,
    /// Absolute path on local storage.
    pub abspath: String,
    /// Format classification.
    pub kind: FileKind,
    /// Modality label.
    pub modality: String,
    /// Full inference output.
    pub modality_model: ModalityModel,
    /// Dimensionality, when known.
    pub ndim: Option<i64>,
    /// Ordered dimension sizes, when known.
    pub dims: Option<Vec<i64>>,
    /// File size in bytes.
    pub size_bytes: i64,
    /// Analysis timestamp.
    pub created_at: DateTime<Utc>,
    /// Per-kind descriptor metadata.
    pub meta: FileMeta,
}

/// Percentage share (and optional mean confidence) of one modality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModalityShare {
    /// Share of `total_files`, 0-100.
    pub percent: f64,
    /// Mean classifier confidence, when tracked.
    pub confidence: Option<f64>,
}

/// Aggregated dataset counters, overwritten at stage boundaries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetSummary {
    /// Files analysed (equals catalog rows at `ready`).
    pub total_files: u64,
    /// Analyzer tasks scheduled by the walk.
    pub scheduled_files: u64,
    /// Label -> count over analysed files.
    pub modality_counts: BTreeMap<String, u64>,
    /// Label -> percentage profile.
    pub modalities: BTreeMap<String, ModalityShare>,
    /// True iff more than one non-`unknown` modality has count > 0.
    pub mixed_modality: bool,
    /// Placeholder until OOD scoring is wired.
    pub outliers: u64,
    /// Kind -> count.
    pub kind_counts: BTreeMap<String, u64>,
    /// Extension -> count over analysed files.
    pub ext_counts: BTreeMap<String, u64>,
    /// Extension -> count over scheduled files.
    pub scheduled_ext_counts: BTreeMap<String, u64>,
    /// Basename collisions across subdirectories.
    pub duplicate_basename_count: u64,
    /// Extension -> collision count.
    pub duplicate_basename_ext_counts: BTreeMap<String, u64>,
    /// Files with `ndim = 2`.
    pub image_2d_count: u64,
    /// Files with `ndim >= 3` plus DICOM series with >= 2 instances.
    pub volume_3d_count: u64,
}

/// A dataset row as read back from the catalog.
#[derive(Debug, Clone)]
pub struct DatasetRecord {
    /// Stable external handle.
    pub dataset_id: String,
    /// Display name.
    pub name: String,
    /// URL the ingest was requested with.
    pub source_url: String,
    /// Pre-resolution request URL, when the caller expanded a reference.
    pub original_request_url: Option<String>,
    /// Owning team, when known.
    pub team_id: Option<String>,
    /// Submitting user, when known.
    pub owner_user_id: Option<String>,
    /// Lifecycle status.
    pub status: DatasetStatus,
    /// State machine milestone.
    pub stage: Stage,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Aggregated summary; absent until finalize.
    pub summary: Option<DatasetSummary>,
    /// Provider that fetched the dataset.
    pub provider: Option<String>,
    /// URL handed to the provider.
    pub resolution_original_url: Option<String>,
    /// URL the provider actually downloaded.
    pub resolved_url: Option<String>,
    /// Failure cause, set only on `failed`.
    pub last_error: Option<String>,
}

/// Fields required to create a dataset row before enqueueing its job.
#[derive(Debug, Clone)]
pub struct NewDataset {
    /// Stable external handle; must be unique.
    pub dataset_id: String,
    /// Display name.
    pub name: String,
    /// URL to ingest.
    pub source_url: String,
    /// Pre-resolution request URL, when applicable.
    pub original_request_url: Option<String>,
    /// Owning team.
    pub team_id: Option<String>,
    /// Submitting user.
    pub owner_user_id: Option<String>,
}

impl NewDataset {
    /// Creates a minimal dataset row description.
    #[must_use]
    pub fn new(dataset_id: impl Into<String>, name: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            name: name.into(),
            source_url: source_url.into(),
            original_request_url: None,
            team_id: None,
            owner_user_id: None,
        }
    }
}

//! Hybrid modality inference for 2D images.
//!
//! Combines a pluggable classifier's probability distribution with additive
//! heuristic votes from image statistics and filename/folder/OCR tokens.
//! The final label is the argmax of the votes; confidence is the winner's
//! share of the non-negative vote mass.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use image::DynamicImage;
use regex::Regex;

use crate::store::{ModalityModel, ModalityModelDetails};

/// Modality classes in fixed order for consistent indexing.
pub const MODALITY_CLASSES: [&str; 5] = ["CT", "MR", "XRAY", "US", "OPTICAL"];

/// Vote slots: the classifier classes plus a catch-all.
const VOTE_CLASSES: [&str; 6] = ["CT", "MR", "XRAY", "US", "OPTICAL", "OTHER"];

/// Version tag recorded on every inference result.
pub const INFERENCE_VERSION: &str = "v1.0.0";

/// Gradient magnitude above which a pixel counts as an edge.
const EDGE_THRESHOLD: u32 = 100;

/// Edge density above which the X-ray vote is boosted.
const EDGE_DENSITY_VOTE_CUTOFF: f64 = 0.2;

#[allow(clippy::expect_used)]
static US_TOKENS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bus\b|us_|ultrasound").expect("token regex is valid") // Static pattern, safe to panic
});

#[allow(clippy::expect_used)]
static CT_TOKENS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bct\b|ctscan").expect("token regex is valid") // Static pattern, safe to panic
});

#[allow(clippy::expect_used)]
static MR_TOKENS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bmr\b|mri").expect("token regex is valid") // Static pattern, safe to panic
});

/// Classifier over [`MODALITY_CLASSES`].
///
/// The production model is an external collaborator; implementations are
/// pure functions from pixels to a probability distribution. Predictions
/// run on the blocking pool, so implementations must be `Send + Sync`.
pub trait ModalityClassifier: Send + Sync {
    /// Backbone identifier recorded in prediction logs.
    fn name(&self) -> &'static str;

    /// Returns a probability per class in [`MODALITY_CLASSES`].
    fn predict(&self, image: &DynamicImage) -> BTreeMap<String, f64>;
}

/// Fallback classifier used when no trained model is wired in: a uniform
/// distribution, leaving the decision to the heuristics.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformClassifier;

impl ModalityClassifier for UniformClassifier {
    fn name(&self) -> &'static str {
        "uniform"
    }

    fn predict(&self, _image: &DynamicImage) -> BTreeMap<String, f64> {
        let p = 1.0 / MODALITY_CLASSES.len() as f64;
        MODALITY_CLASSES
            .iter()
            .map(|class| ((*class).to_string(), p))
            .collect()
    }
}

/// Infers the imaging modality of a decoded 2D image.
#[must_use]
pub fn infer_modality(
    image: &DynamicImage,
    filename: &str,
    foldernames: &[String],
    ocr_text: &str,
    classifier: &dyn ModalityClassifier,
) -> ModalityModel {
    let mut votes: BTreeMap<String, f64> = VOTE_CLASSES
        .iter()
        .map(|class| ((*class).to_string(), 0.0))
        .collect();
    let mut details = ModalityModelDetails::default();

    let probs = classifier.predict(image);

    // Aspect ratio: near-square frames lean ultrasound / MR.
    let (width, height) = (image.width(), image.height());
    let aspect = f64::from(width) / f64::from(height.max(1));
    details.aspect_ratio = Some(aspect);
    if aspect > 0.7 && aspect < 1.5 {
        add_vote(&mut votes, "US", 0.2);
        add_vote(&mut votes, "MR", 0.2);
    }

    // Grayscale vs colour.
    let grayscale = is_grayscale(image);
    details.grayscale = Some(grayscale);
    if grayscale {
        add_vote(&mut votes, "CT", 0.2);
        add_vote(&mut votes, "MR", 0.2);
        add_vote(&mut votes, "XRAY", 0.2);
    } else {
        add_vote(&mut votes, "OPTICAL", 0.3);
    }

    let gray = image.to_luma8();
    details.intensity_hist = Some(intensity_histogram_head(&gray));

    let edge_density = edge_density(&gray);
    details.edge_density = Some(edge_density);
    if edge_density > EDGE_DENSITY_VOTE_CUTOFF {
        add_vote(&mut votes, "XRAY", 0.15);
    }

    // Filename/folder token heuristics.
    let namejoined = format!("{filename} {}", foldernames.join(" ")).to_lowercase();
    if US_TOKENS.is_match(&namejoined) {
        add_vote(&mut votes, "US", 1.0);
    }
    if CT_TOKENS.is_match(&namejoined) {
        add_vote(&mut votes, "CT", 1.0);
    }
    if MR_TOKENS.is_match(&namejoined) {
        add_vote(&mut votes, "MR", 1.0);
    }
    if namejoined.contains("xray") || namejoined.contains("cr") || namejoined.contains("dx") {
        add_vote(&mut votes, "XRAY", 1.0);
    }

    // OCR keyword heuristics.
    let ocr = ocr_text.to_lowercase();
    if ocr.contains("mhz") || ocr.contains("depth") || ocr.contains("gain") {
        add_vote(&mut votes, "US", 0.8);
    }
    if ocr.contains("kvp") || ocr.contains("mas") {
        add_vote(&mut votes, "XRAY", 0.8);
    }
    if ocr.contains("te") || ocr.contains("tr") {
        add_vote(&mut votes, "MR", 0.8);
    }

    // Fold the classifier distribution into the votes.
    for (class, p) in &probs {
        add_vote(&mut votes, class, *p);
    }

    // Final decision: argmax, with exact ties resolved to the earliest
    // class in VOTE_CLASSES order. max_by keeps the last maximum, so the
    // candidates are walked back-to-front.
    let pred = VOTE_CLASSES
        .iter()
        .rev()
        .max_by(|a, b| {
            let va = votes.get(**a).copied().unwrap_or(0.0);
            let vb = votes.get(**b).copied().unwrap_or(0.0);
            va.partial_cmp(&vb).unwrap_or(std::cmp::Ordering::Equal)
        })
        .copied()
        .unwrap_or("OTHER");
    let winner = votes.get(pred).copied().unwrap_or(0.0);
    let vote_mass: f64 = votes.values().map(|v| v.max(0.0)).sum();
    let confidence = if vote_mass > 0.0 {
        winner / vote_mass
    } else {
        0.0
    };

    ModalityModel {
        pred: pred.to_string(),
        confidence,
        version: INFERENCE_VERSION.to_string(),
        method: "cnn+heuristics".to_string(),
        probs,
        heuristic_votes: votes,
        sources: vec!["cnn".to_string(), "heuristics".to_string()],
        details,
    }
}

fn add_vote(votes: &mut BTreeMap<String, f64>, class: &str, amount: f64) {
    if let Some(slot) = votes.get_mut(class) {
        *slot += amount;
    }
}

/// True when the image has no colour channels or every pixel has equal RGB
/// components.
fn is_grayscale(image: &DynamicImage) -> bool {
    if !image.color().has_color() {
        return true;
    }
    let rgb = image.to_rgb8();
    rgb.pixels().all(|p| p[0] == p[1] && p[1] == p[2])
}

/// Leading bins of a 32-bin luma histogram.
fn intensity_histogram_head(gray: &image::GrayImage) -> Vec<u64> {
    let mut bins = [0u64; 32];
    for pixel in gray.pixels() {
        bins[(usize::from(pixel[0]) * 32) / 256] += 1;
    }
    bins[..5].to_vec()
}

/// Fraction of interior pixels whose gradient magnitude crosses the edge
/// threshold.
fn edge_density(gray: &image::GrayImage) -> f64 {
    let (width, height) = gray.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }

    let mut edges: u64 = 0;
    let mut total: u64 = 0;
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let gx = i32::from(gray.get_pixel(x + 1, y)[0]) - i32::from(gray.get_pixel(x - 1, y)[0]);
            let gy = i32::from(gray.get_pixel(x, y + 1)[0]) - i32::from(gray.get_pixel(x, y - 1)[0]);
            if gx.unsigned_abs() + gy.unsigned_abs() > EDGE_THRESHOLD {
                edges += 1;
            }
            total += 1;
        }
    }
    if total == 0 {
        0.0
    } else {
        edges as f64 / total as f64
    }
}

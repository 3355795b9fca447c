//! Format sniffing: a deterministic cascade by suffix and magic bytes.
//!
//! Output is best-effort and never raises: unreadable or malformed files
//! still produce a report, with shape information absent. Pixel data is
//! never decoded here; DICOM reads stop before the pixel element and NIfTI
//! reads only the 348-byte header.

use std::io::Read;
use std::path::Path;

use dicom_object::{OpenFileOptions, Tag};
use tracing::trace;

use crate::store::{FileKind, FileMeta};
use crate::walker::file_ext;

/// Pixel Data element; DICOM reads stop here.
const PIXEL_DATA: Tag = Tag(0x7FE0, 0x0010);

/// Suffixes probed as standard 2D image containers.
const IMAGE_SUFFIXES: &[&str] = &[".png", ".jpg", ".jpeg", ".bmp", ".tif", ".tiff"];

/// NIfTI-1 header length.
const NIFTI1_HEADER_LEN: usize = 348;

/// Best-effort classification of one file.
#[derive(Debug, Clone, PartialEq)]
pub struct SniffReport {
    /// Format classification.
    pub kind: FileKind,
    /// Modality, when the format carries one (DICOM); `unknown` otherwise.
    pub modality: String,
    /// Dimensionality, when known.
    pub ndim: Option<i64>,
    /// Ordered dimension sizes, when known.
    pub dims: Option<Vec<i64>>,
    /// File size in bytes (0 when unreadable).
    pub size_bytes: i64,
    /// Per-kind metadata.
    pub meta: FileMeta,
}

impl SniffReport {
    fn unknown(size_bytes: i64) -> Self {
        Self {
            kind: FileKind::Unknown,
            modality: "unknown".to_string(),
            ndim: None,
            dims: None,
            size_bytes,
            meta: FileMeta::Unknown,
        }
    }
}

/// Classifies a file by suffix and magic.
///
/// Cascade: NIfTI suffixes, then DICOM magic or suffix, then common 2D
/// image suffixes, then `unknown`.
#[must_use]
pub fn sniff_file(path: &Path) -> SniffReport {
    let size_bytes = i64::try_from(
        std::fs::metadata(path).map(|meta| meta.len()).unwrap_or(0),
    )
    .unwrap_or(i64::MAX);
    let ext = file_ext(path);

    if ext == ".nii" || ext == ".nii.gz" {
        return sniff_nifti(path, size_bytes);
    }

    if looks_like_dicom(path) || ext == ".dcm" {
        if let Some(report) = sniff_dicom(path, size_bytes) {
            return report;
        }
    }

    if IMAGE_SUFFIXES.contains(&ext.as_str()) {
        return sniff_image(path, size_bytes);
    }

    trace!(path = %path.display(), "unrecognised format");
    SniffReport::unknown(size_bytes)
}

/// Checks for the `DICM` magic at offset 128.
fn looks_like_dicom(path: &Path) -> bool {
    let Ok(mut file) = std::fs::File::open(path) else {
        return false;
    };
    let mut preamble = [0u8; 132];
    match file.read_exact(&mut preamble) {
        Ok(()) => &preamble[128..132] == b"DICM",
        Err(_) => false,
    }
}

/// Reads DICOM header identifiers without pixel data.
///
/// Returns `None` when the file cannot be parsed as DICOM so the cascade
/// can fall through to the remaining formats.
fn sniff_dicom(path: &Path, size_bytes: i64) -> Option<SniffReport> {
    let obj = OpenFileOptions::new()
        .read_until(PIXEL_DATA)
        .open_file(path)
        .ok()?;

    let modality = string_element(&obj, "Modality").unwrap_or_else(|| "unknown".to_string());
    let rows = int_element(&obj, "Rows");
    let cols = int_element(&obj, "Columns");
    let dims = match (cols, rows) {
        (Some(cols), Some(rows)) => Some(vec![cols, rows]),
        _ => None,
    };

    Some(SniffReport {
        kind: FileKind::Dicom,
        modality,
        // A single DICOM instance is 2D; 3D is detected at series level later.
        ndim: Some(2),
        dims,
        size_bytes,
        meta: FileMeta::Dicom {
            sop_class_uid: string_element(&obj, "SOPClassUID"),
            series_instance_uid: string_element(&obj, "SeriesInstanceUID"),
            study_instance_uid: string_element(&obj, "StudyInstanceUID"),
            body_part_examined: string_element(&obj, "BodyPartExamined"),
        },
    })
}

fn string_element(obj: &dicom_object::DefaultDicomObject, name: &str) -> Option<String> {
    let value = obj.element_by_name(name).ok()?.to_str().ok()?;
    let value = value.trim_end_matches('\0').trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn int_element(obj: &dicom_object::DefaultDicomObject, name: &str) -> Option<i64> {
    obj.element_by_name(name).ok()?.to_int::<i64>().ok()
}

/// Parses the NIfTI-1 header for the full shape.
///
/// Parse failures still classify the file as `nifti` (the suffix is
/// unambiguous), just without shape information.
fn sniff_nifti(path: &Path, size_bytes: i64) -> SniffReport {
    let dims = read_nifti_dims(path);
    SniffReport {
        kind: FileKind::Nifti,
        modality: "unknown".to_string(),
        ndim: dims.as_ref().map(|d| d.len() as i64),
        dims,
        size_bytes,
        meta: FileMeta::Nifti,
    }
}

/// Reads `dim[]` from a NIfTI-1 header, handling gzip and both endiannesses.
fn read_nifti_dims(path: &Path) -> Option<Vec<i64>> {
    let file = std::fs::File::open(path).ok()?;
    let mut header = [0u8; NIFTI1_HEADER_LEN];

    if file_ext(path) == ".nii.gz" {
        flate2::read::GzDecoder::new(file)
            .read_exact(&mut header)
            .ok()?;
    } else {
        let mut file = file;
        file.read_exact(&mut header).ok()?;
    }

    let sizeof_hdr_le = i32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let big_endian = match sizeof_hdr_le {
        348 => false,
        _ if sizeof_hdr_le.swap_bytes() == 348 => true,
        _ => return None,
    };

    let read_i16 = |offset: usize| -> i16 {
        let bytes = [header[offset], header[offset + 1]];
        if big_endian {
            i16::from_be_bytes(bytes)
        } else {
            i16::from_le_bytes(bytes)
        }
    };

    // dim[0] holds the rank, dim[1..=rank] the sizes.
    let rank = read_i16(40);
    if !(1..=7).contains(&rank) {
        return None;
    }
    let dims: Vec<i64> = (1..=rank)
        .map(|i| i64::from(read_i16(40 + 2 * i as usize)))
        .collect();
    if dims.iter().any(|&d| d <= 0) {
        return None;
    }
    Some(dims)
}

/// Probes a 2D image container for its dimensions.
///
/// Undecodable images keep `kind=image` with `ndim=2` (the suffix is
/// unambiguous), just without dimensions.
fn sniff_image(path: &Path, size_bytes: i64) -> SniffReport {
    let dims = image::image_dimensions(path)
        .ok()
        .map(|(w, h)| vec![i64::from(w), i64::from(h)]);
    SniffReport {
        kind: FileKind::Image,
        modality: "unknown".to_string(),
        ndim: Some(2),
        dims,
        size_bytes,
        meta: FileMeta::Image,
    }
}

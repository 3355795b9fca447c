//! Bounded traversal of a dataset scan root.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Extension reported for files without one.
const NO_EXTENSION: &str = "none";

/// Yields absolute file paths under `root`, at most `limit` of them.
///
/// Traversal is depth-first with name-sorted entries so repeated runs over
/// the same tree schedule files in the same order. Unreadable entries are
/// skipped. Hitting the cap truncates silently.
pub fn iter_files(root: &Path, limit: usize) -> impl Iterator<Item = PathBuf> + use<> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .take(limit)
}

/// Returns the lowercased extension of a path, handling the compound
/// `.nii.gz` specifically; `none` when the file has no extension.
#[must_use]
pub fn file_ext(path: &Path) -> String {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return NO_EXTENSION.to_string();
    };
    let lowered = name.to_ascii_lowercase();
    if lowered.ends_with(".nii.gz") {
        return ".nii.gz".to_string();
    }
    match lowered.rsplit_once('.') {
        // A leading dot alone (hidden file) is not an extension.
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => format!(".{ext}"),
        _ => NO_EXTENSION.to_string(),
    }
}

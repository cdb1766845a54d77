//! Helpers for keeping input paths out of span fields.
//!
//! Transcript directories often carry names of people or cases, so spans
//! record only the file name.

use std::path::Path;

/// Returns only the filename component of a path (no directory).
pub fn redact_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}

// src/utils/path.rs
use std::path::{Path, PathBuf};

use crate::errors::StoreError;

/// Validate a source name before it becomes a slot file name.
///
/// - Must be a single path segment of `[A-Za-z0-9._-]`.
/// - Must not start with `.` (no hidden files, no `..`).
/// - Surrounding whitespace is trimmed.
pub fn sanitize_source(name: &str) -> Result<String, StoreError> {
    let s = name.trim();
    let valid = !s.is_empty()
        && s.len() <= 128
        && !s.starts_with('.')
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !valid {
        return Err(StoreError::InvalidSource(name.to_string()));
    }
    Ok(s.to_string())
}

/// Ensure that a candidate absolute path resolves (or its parent resolves) to a
/// location contained within the canonicalized `root_abs`. Returns the
/// canonicalized path that was checked.
///
/// For creation paths that don't exist yet, this canonicalizes the parent and
/// rejoins the leaf to prevent symlink escapes.
pub fn assert_within_root_abs(root_abs: &Path, candidate_abs: &Path) -> Result<PathBuf, StoreError> {
    let root = root_abs
        .canonicalize()
        .map_err(|e| StoreError::io("canonicalize", root_abs, e))?;

    let resolved = match candidate_abs.canonicalize() {
        Ok(c) => c,
        Err(_) => {
            let parent = candidate_abs
                .parent()
                .ok_or_else(|| StoreError::Unavailable(format!("invalid path {candidate_abs:?}: no parent")))?;
            let leaf = candidate_abs
                .file_name()
                .ok_or_else(|| StoreError::Unavailable(format!("invalid path {candidate_abs:?}: no file name")))?;
            let canon_parent = parent
                .canonicalize()
                .map_err(|e| StoreError::io("canonicalize", parent, e))?;
            canon_parent.join(leaf)
        }
    };

    if !resolved.starts_with(&root) {
        return Err(StoreError::Unavailable(format!(
            "path escapes state dir: path={candidate_abs:?} root={root:?}"
        )));
    }
    Ok(resolved)
}

/// Join relative config values onto the root; absolute values pass through.
pub fn absolutize(root: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        root.join(value)
    }
}

//! Archive name policy.
//!
//! Names stored in an archive are always relative: leading separators,
//! empty segments, `.` and `..` segments are dropped.  Caller-supplied
//! renames are held to a stricter standard and may not contain `..` at all.

use std::path::Path;

use crate::error::{Error, Result};

fn invalid(name: &str, reason: &'static str) -> Error {
    Error::InvalidName {
        name: name.to_string(),
        reason,
    }
}

pub(crate) fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::NonUtf8Path(path.to_path_buf()))
}

/// Normalize a host path into an archive name, with `/` between segments.
pub fn archive_name(path: &str, separator: char) -> Result<String> {
    if !path.is_empty() && path.chars().all(|c| c == separator) {
        return Err(invalid(path, "refusing to archive the root directory"));
    }

    let segments: Vec<&str> = path
        .split(separator)
        .filter(|segment| !matches!(*segment, "" | "." | ".."))
        .collect();
    if segments.is_empty() {
        return Err(invalid(path, "name is empty after normalization"));
    }
    Ok(segments.join("/"))
}

/// Check a caller-supplied archive name.
pub fn validate_rename(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(invalid(name, "rename target is empty"));
    }
    if name.starts_with("/..") {
        return Err(invalid(name, "rename target escapes the archive root"));
    }
    if name.split('/').any(|segment| segment == "..") {
        return Err(invalid(name, "rename target contains '..'"));
    }
    Ok(())
}

/// Name for `path`, found while walking `root`, when `root` itself is
/// stored as `base`.
pub fn compose_rename(base: &str, root: &Path, path: &Path) -> Result<String> {
    // walk results always live under the root
    let suffix = path.strip_prefix(root).unwrap_or(path);
    let suffix = path_str(suffix)?;
    if suffix.is_empty() {
        Ok(base.to_string())
    } else {
        Ok(format!("{}/{suffix}", base.trim_end_matches('/')))
    }
}

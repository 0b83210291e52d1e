//! Path utilities for SFTP operations
//!
//! Remote SFTP paths always use `/`, whatever the local or remote OS.
//! Local paths go through `PathBuf` so the platform separator is used.

use std::path::{Path, PathBuf};

/// Join remote SFTP path components using `/` separator.
pub fn join_remote_path(base: &str, component: &str) -> String {
    if base.is_empty() {
        component.to_string()
    } else if base.ends_with('/') {
        format!("{}{}", base, component)
    } else {
        format!("{}/{}", base, component)
    }
}

/// Join local path components using the platform-native separator.
pub fn join_local_path(base: &Path, component: &str) -> PathBuf {
    let mut path = base.to_path_buf();
    path.push(component);
    path
}

/// Last component of a remote path (`/a/b/` → `b`, `/` → `/`)
pub fn remote_file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return if path.is_empty() { "" } else { "/" };
    }
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Path of the temporary file an upload to `path` is written to
pub fn upload_temp_path(path: &str, suffix: &str) -> String {
    format!("{}{}", path, suffix)
}

/// A child name is safe to join if it cannot escape its parent directory
pub fn is_safe_entry_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
}

/// Human-readable label of a file inside a job, relative to the job root.
///
/// `relative` is the list of segments below the root; for a single-file job
/// (no segments) the root's own name is used.
pub fn relative_label(root_name: &str, relative: &[String]) -> String {
    if relative.is_empty() {
        root_name.to_string()
    } else {
        relative.join("/")
    }
}

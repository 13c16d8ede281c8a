//! Filesystem utilities.
//!
//! Crash-tolerant write primitives used by the settings file and the config
//! store, plus path checks for plugin directories.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};

use crate::core::{CoreError, CoreResult};

// =============================================================================
// Path Validation Utilities
// =============================================================================

/// Checks that a plugin id (or similar key) can be used as one path segment.
pub fn validate_path_id_component(id: &str, label: &str) -> Result<(), String> {
    let id = id.trim();
    if id.is_empty() {
        return Err(format!("{label} must not be blank"));
    }
    if id.contains("..") || id.contains(&['/', '\\', ':'][..]) {
        return Err(format!("{label} {id:?} would escape its directory"));
    }
    if id.chars().any(char::is_control) {
        return Err(format!("{label} {id:?} has control characters"));
    }
    Ok(())
}

/// Resolves a manifest-relative path inside `base`.
///
/// The relative path must not be absolute and must not escape `base`.
pub fn resolve_within(base: &Path, relative: &str, label: &str) -> Result<PathBuf, String> {
    let trimmed = relative.trim();
    if trimmed.is_empty() {
        return Err(format!("{label} must not be blank"));
    }

    let rel = Path::new(trimmed);
    if rel.is_absolute() {
        return Err(format!("Invalid {label}: must be a relative path"));
    }
    for component in rel.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(format!(
                    "Invalid {label}: must stay inside the plugin directory"
                ))
            }
        }
    }

    Ok(base.join(rel))
}

// =============================================================================
// Atomic Writes
// =============================================================================

/// `settings.json` -> `settings.json.<suffix>`, next to the original.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "plugdock".to_string());
    path.with_file_name(format!("{name}.{suffix}"))
}

/// Replaces `path` with `bytes`. The data is synced to a `.tmp` sibling
/// first, so a crash leaves either the old or the new contents.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> CoreResult<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let staged = sibling(path, "tmp");
    let mut out = BufWriter::new(File::create(&staged)?);
    out.write_all(bytes)?;
    let file = out.into_inner().map_err(|e| CoreError::IoError(e.into_error()))?;
    file.sync_all()?;
    drop(file);

    swap_into_place(&staged, path)
}

pub fn atomic_write_json_pretty<T: serde::Serialize>(path: &Path, value: &T) -> CoreResult<()> {
    atomic_write_bytes(path, &serde_json::to_vec_pretty(value)?)
}

fn swap_into_place(staged: &Path, dest: &Path) -> CoreResult<()> {
    if !dest.exists() {
        return Ok(std::fs::rename(staged, dest)?);
    }

    // Some platforms refuse to rename over an existing file.
    let previous = sibling(dest, "bak");
    let _ = std::fs::remove_file(&previous);
    std::fs::rename(dest, &previous)?;

    if let Err(e) = std::fs::rename(staged, dest) {
        let _ = std::fs::rename(&previous, dest);
        let _ = std::fs::remove_file(staged);
        return Err(e.into());
    }
    let _ = std::fs::remove_file(&previous);
    Ok(())
}

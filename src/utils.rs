//! Miscellaneous helper utilities.
use std::path::Path;

/// Render an optional byte id as hex, `-` when absent.
#[must_use]
pub fn hex_or_dash(bytes: Option<&[u8]>) -> String {
    bytes.map_or_else(|| "-".to_string(), hex::encode)
}

/// Ensure a file path's parent directory exists.
pub fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

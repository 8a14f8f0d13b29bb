pub mod appearance;
pub mod body_model;
pub mod measurements;
pub mod mesh;
pub mod silhouette;

use std::path::Path;

/// A directory counts as a provisioned asset source only if it holds at
/// least one regular file.
pub(crate) fn dir_has_files(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| {
            entries.any(|entry| {
                entry
                    .map(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

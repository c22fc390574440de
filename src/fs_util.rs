use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::MetadataError;

pub fn ensure_dir(dir: &Utf8Path) -> Result<(), MetadataError> {
    fs::create_dir_all(dir)
        .map_err(|err| MetadataError::Filesystem(format!("create {dir}: {err}")))
}

/// Files directly inside `dir` whose name ends with `.{ext}`, in directory
/// listing order.
pub fn files_with_ext(dir: &Utf8Path, ext: &str) -> Result<Vec<Utf8PathBuf>, MetadataError> {
    let suffix = format!(".{ext}");
    let entries = dir
        .read_dir_utf8()
        .map_err(|err| MetadataError::Filesystem(format!("read {dir}: {err}")))?;
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| MetadataError::Filesystem(err.to_string()))?;
        if entry.file_name().ends_with(&suffix) && entry.path().is_file() {
            out.push(entry.path().to_path_buf());
        }
    }
    Ok(out)
}

pub fn copy_file(source: &Utf8Path, destination: &Utf8Path) -> Result<(), MetadataError> {
    fs::copy(source, destination).map_err(|err| {
        MetadataError::Filesystem(format!("copy {source} to {destination}: {err}"))
    })?;
    Ok(())
}

pub fn utf8_path(path: std::path::PathBuf) -> Result<Utf8PathBuf, MetadataError> {
    Utf8PathBuf::from_path_buf(path)
        .map_err(|path| MetadataError::Filesystem(format!("non-utf8 path: {}", path.display())))
}

use std::{
    fs,
    io::{self, Write},
    path::Path,
};

use keystash_core::StorageError;
use tempfile::NamedTempFile;

/// Replace `path` with `bytes` via a temp file in the same directory, so a
/// concurrent reader sees either the old or the new contents.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let parent = path.parent().ok_or_else(|| StorageError::Io {
        reason: "invalid storage path".to_string(),
    })?;
    fs::create_dir_all(parent).map_err(StorageError::io)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(StorageError::io)?;
    tmp.write_all(bytes).map_err(StorageError::io)?;
    tmp.flush().map_err(StorageError::io)?;
    tmp.persist(path).map_err(|e| StorageError::io(e.error))?;
    Ok(())
}

/// Read a whole file; `None` if it does not exist.
pub(crate) fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StorageError::io(err)),
    }
}

/// Remove a file; returns whether it existed.
pub(crate) fn remove_optional(path: &Path) -> Result<bool, StorageError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(StorageError::io(err)),
    }
}

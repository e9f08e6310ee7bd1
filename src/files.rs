//! Filesystem helpers over ambient `cap-std` directories.
//!
//! Every helper opens the parent directory of the target path with ambient
//! authority and performs the operation relative to it, so callers only deal
//! in UTF-8 paths and a single error type.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by filesystem helpers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FileError {
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when a path has no file name component.
    #[error("path {path} is missing a file name")]
    MissingFileName {
        /// Offending path.
        path: Utf8PathBuf,
    },
}

impl FileError {
    fn io(path: &Utf8Path, err: &io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

fn split(path: &Utf8Path) -> Result<(&Utf8Path, &str), FileError> {
    let file_name = path.file_name().ok_or_else(|| FileError::MissingFileName {
        path: path.to_path_buf(),
    })?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    Ok((parent, file_name))
}

fn open_dir(path: &Utf8Path) -> Result<Dir, FileError> {
    Dir::open_ambient_dir(path, ambient_authority()).map_err(|err| FileError::io(path, &err))
}

/// Creates `path` and all missing parents.
///
/// # Errors
///
/// Returns [`FileError::Io`] when a directory cannot be created.
pub fn create_dir_all(path: &Utf8Path) -> Result<(), FileError> {
    Dir::create_ambient_dir_all(path, ambient_authority()).map_err(|err| FileError::io(path, &err))
}

/// Returns `true` when `path` exists. A missing parent directory counts as
/// absent rather than as an error.
///
/// # Errors
///
/// Returns [`FileError::Io`] when the parent directory cannot be inspected.
pub fn exists(path: &Utf8Path) -> Result<bool, FileError> {
    let (parent, file_name) = split(path)?;
    match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir
            .try_exists(file_name)
            .map_err(|err| FileError::io(path, &err)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(FileError::io(parent, &err)),
    }
}

/// Reads a UTF-8 file into memory.
///
/// # Errors
///
/// Returns [`FileError::Io`] when the file cannot be opened or read.
pub fn read_to_string(path: &Utf8Path) -> Result<String, FileError> {
    let (parent, file_name) = split(path)?;
    open_dir(parent)?
        .read_to_string(file_name)
        .map_err(|err| FileError::io(path, &err))
}

/// Writes `contents` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`FileError::Io`] when the parent cannot be created or the write
/// fails.
pub fn write(path: &Utf8Path, contents: impl AsRef<[u8]>) -> Result<(), FileError> {
    let (parent, file_name) = split(path)?;
    create_dir_all(parent)?;
    open_dir(parent)?
        .write(file_name, contents)
        .map_err(|err| FileError::io(path, &err))
}

/// Writes `contents` to a sibling temporary file and renames it over `path`
/// so readers never observe a torn write.
///
/// # Errors
///
/// Returns [`FileError::Io`] when writing or renaming fails.
pub fn write_atomic(path: &Utf8Path, contents: impl AsRef<[u8]>) -> Result<(), FileError> {
    let (parent, file_name) = split(path)?;
    create_dir_all(parent)?;
    let dir = open_dir(parent)?;
    let temp_name = format!(".{file_name}.{}.tmp", Uuid::new_v4().simple());
    dir.write(&temp_name, contents)
        .map_err(|err| FileError::io(path, &err))?;
    dir.rename(&temp_name, &dir, file_name).map_err(|err| {
        dir.remove_file(&temp_name).ok();
        FileError::io(path, &err)
    })
}

/// Copies `from` to `to`, creating the destination's parent directories.
///
/// # Errors
///
/// Returns [`FileError::Io`] when either side cannot be accessed.
pub fn copy(from: &Utf8Path, to: &Utf8Path) -> Result<(), FileError> {
    let (from_parent, from_name) = split(from)?;
    let (to_parent, to_name) = split(to)?;
    create_dir_all(to_parent)?;
    let source = open_dir(from_parent)?;
    let target = open_dir(to_parent)?;
    source
        .copy(from_name, &target, to_name)
        .map(|_| ())
        .map_err(|err| FileError::io(from, &err))
}

/// Removes `path` recursively. Removing a missing directory is a no-op.
///
/// # Errors
///
/// Returns [`FileError::Io`] when removal fails for any other reason.
pub fn remove_dir_all(path: &Utf8Path) -> Result<(), FileError> {
    if !exists(path)? {
        return Ok(());
    }
    let (parent, file_name) = split(path)?;
    open_dir(parent)?
        .remove_dir_all(file_name)
        .map_err(|err| FileError::io(path, &err))
}

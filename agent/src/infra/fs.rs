//! Filesystem helpers shared by the step methods, the host-state loader and
//! the nginx driver. Everything here is synchronous; async callers go through
//! [`blocking`].

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::Path;

use crate::domain::StepError;

/// In-flight writes; never listed as hosts, upstreams or sites.
const TEMP_SUFFIX: &str = ".tmp";

/// Run blocking filesystem work off the async runtime.
///
/// # Errors
///
/// Propagates the closure's error; a panicked task becomes a `Command` error.
pub async fn blocking<T, F>(f: F) -> Result<T, StepError>
where
    F: FnOnce() -> Result<T, StepError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StepError::Command(format!("filesystem task failed: {e}")))?
}

/// Write via a uniquely named sibling temp file and rename, creating parent
/// directories. Concurrent writers of one path each rename a complete file;
/// the last rename wins.
///
/// # Errors
///
/// Returns the first I/O error, annotated with the path.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StepError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .map_err(|e| StepError::io(format!("creating {}", parent.display()), e))?;
    let file_name = path
        .file_name()
        .ok_or_else(|| StepError::invalid(format!("{} has no file name", path.display())))?;
    let mut prefix = std::ffi::OsString::from(".");
    prefix.push(file_name);
    prefix.push(".");
    let mut temp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(parent)
        .map_err(|e| StepError::io(format!("creating temp file for {}", path.display()), e))?;
    temp.write_all(contents)
        .and_then(|()| temp.as_file().sync_all())
        .map_err(|e| StepError::io(format!("writing {}", temp.path().display()), e))?;
    temp.persist(path)
        .map_err(|e| StepError::io(format!("finalizing {}", path.display()), e.error))?;
    Ok(())
}

/// Read a JSON object of string values; a missing file reads as empty.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn read_string_map(path: &Path) -> Result<BTreeMap<String, String>, StepError> {
    match std::fs::read(path) {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(BTreeMap::new()),
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| StepError::Command(format!("parsing {}: {e}", path.display()))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(StepError::io(format!("reading {}", path.display()), e)),
    }
}

/// Write a JSON object with stable key order, pretty-printed.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub fn write_string_map(path: &Path, map: &BTreeMap<String, String>) -> Result<(), StepError> {
    let body = serde_json::to_vec_pretty(map)
        .map_err(|e| StepError::Command(format!("serializing {}: {e}", path.display())))?;
    write_atomic(path, &body)
}

/// Remove a file; returns whether it existed.
///
/// # Errors
///
/// Returns any error other than "not found".
pub fn remove_file_if_exists(path: &Path) -> Result<bool, StepError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StepError::io(format!("removing {}", path.display()), e)),
    }
}

/// Remove a directory tree; returns whether it existed.
///
/// # Errors
///
/// Returns any error other than "not found".
pub fn remove_dir_if_exists(path: &Path) -> Result<bool, StepError> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StepError::io(format!("removing {}", path.display()), e)),
    }
}

/// Names of the immediate subdirectories (or files, with `dirs = false`), sorted.
///
/// # Errors
///
/// Returns an error if the directory exists but cannot be listed.
pub fn list_entries(path: &Path, dirs: bool) -> Result<Vec<String>, StepError> {
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StepError::io(format!("listing {}", path.display()), e)),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StepError::io(format!("listing {}", path.display()), e))?;
        let is_dir = entry.path().is_dir();
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_dir == dirs && !name.ends_with(TEMP_SUFFIX) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

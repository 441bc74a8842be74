//! Crash-safe JSON documents on disk.
//!
//! Every write lands in a temp file in the target directory and is then
//! renamed over the destination, so a reader only ever sees the previous
//! document or the new one.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{ErrorKind, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Outcome of reading a persisted document.
#[derive(Debug)]
pub enum Loaded<T> {
    /// No file yet (fresh install).
    Missing,
    /// File exists but is not a valid document (crash mid-write, manual edit).
    Corrupt(String),
    Valid(T),
}

/// Atomically write `data` to `path` using a tempfile in the same directory.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;

    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value).context("failed to encode json")?;
    atomic_write(path, &data)
}

/// Read and decode `path`. Only genuine I/O failures are errors; an absent or
/// undecodable file is reported through [`Loaded`].
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Loaded<T>> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Loaded::Missing),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(v) => Ok(Loaded::Valid(v)),
        Err(e) => Ok(Loaded::Corrupt(e.to_string())),
    }
}

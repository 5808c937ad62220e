//! Filesystem substrate shared by every coordination component.
//!
//! Records are field-named JSON files. Whole-record writes go through a
//! temporary file in the same directory followed by an atomic rename, so
//! readers never observe a half-written record and a failed write leaves the
//! previous version in place. Append-only logs are JSONL files. Short
//! read-modify-write sections are serialized across processes with advisory
//! `fd-lock` guards kept under `locks/`.

use crate::error::{CoordinationError, Result};
use fd_lock::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Join path segments below the storage root.
    pub fn path(&self, parts: &[&str]) -> PathBuf {
        parts
            .iter()
            .fold(self.root.clone(), |acc, part| acc.join(part))
    }

    pub fn ensure_dir(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        Ok(())
    }

    /// Read a JSON record. A missing file is `Ok(None)`; an unparseable one is
    /// `Corrupt` and must abort the operation that asked for it.
    pub fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| CoordinationError::Corrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
    }

    /// Replace a record atomically (temp file in the same directory + rename).
    pub fn write_json_atomic<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| CoordinationError::validation(format!("no parent for {}", path.display())))?;
        fs::create_dir_all(parent)?;

        let json = serde_json::to_vec_pretty(value)?;
        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Append one entry to a JSONL log (one JSON object per line).
    pub fn append_jsonl<T: Serialize>(&self, path: &Path, entry: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let entry_json = serde_json::to_string(entry)?;
        let content = format!("{entry_json}\n");

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(content.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Current byte length of a file; a missing file is empty.
    pub fn file_len(&self, path: &Path) -> Result<u64> {
        match fs::metadata(path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Cut an append-only log back to `len` bytes, dropping later appends.
    pub fn truncate(&self, path: &Path, len: u64) -> Result<()> {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(len)?;
        file.sync_data()?;
        Ok(())
    }

    /// Read every entry of a JSONL log. Any unparseable line makes the whole
    /// log `Corrupt`; journals are replayed and must not silently skip lines.
    pub fn read_jsonl<T: DeserializeOwned>(&self, path: &Path) -> Result<Vec<T>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str(line).map_err(|e| CoordinationError::Corrupt {
                path: path.display().to_string(),
                reason: format!("line {}: {e}", index + 1),
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Rewrite a JSONL log atomically, used when compacting queues.
    pub fn rewrite_jsonl<T: Serialize>(&self, path: &Path, entries: &[T]) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| CoordinationError::validation(format!("no parent for {}", path.display())))?;
        fs::create_dir_all(parent)?;

        let mut tmp = NamedTempFile::new_in(parent)?;
        for entry in entries {
            let line = serde_json::to_string(entry)?;
            tmp.write_all(line.as_bytes())?;
            tmp.write_all(b"\n")?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Remove a record; returns whether it existed.
    pub fn remove(&self, path: &Path) -> Result<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// List files with the given extension in a directory, sorted by name.
    pub fn list_files(&self, dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == extension) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// List immediate subdirectory names, sorted.
    pub fn list_dirs(&self, dir: &Path) -> Result<Vec<String>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Run `f` while holding the exclusive advisory guard `name`.
    ///
    /// The guard is an `flock` on `locks/<name>.guard`; it serializes both
    /// threads of this process and other processes sharing the root. Keep the
    /// critical section short: it blocks the calling thread.
    pub fn with_guard<T>(&self, name: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let dir = self.path(&["locks"]);
        fs::create_dir_all(&dir)?;
        let guard_path = dir.join(format!("{}.guard", file_key(name)));

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&guard_path)?;
        let mut lock = RwLock::new(file);
        let _guard = lock.write()?;
        f()
    }
}

/// Map an arbitrary logical key to a stable, filesystem-safe file stem.
///
/// Keeps a readable prefix and appends an FNV-1a hash of the full key so
/// distinct keys never collide after sanitizing.
pub fn file_key(key: &str) -> String {
    let readable: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(48)
        .collect();
    format!("{}-{:016x}", readable.trim_matches('_'), fnv1a(key))
}

/// FNV-1a is deterministic across Rust versions and compilations, unlike
/// `DefaultHasher`, so file names stay valid between binaries.
fn fnv1a(key: &str) -> u64 {
    const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    key.as_bytes().iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

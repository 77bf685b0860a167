// Weft - Peer-to-peer resource sharing fabric: CPU, memory and storage pooling over a minimal length-framed protocol
// Copyright (C) 2026  weft contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;

use crate::error::{WeftError, WeftResult};

/// Filesystem-backed public replica store. Everything lives directly under
/// one sandboxed root; filenames are reduced to their basename so a request
/// can never walk out of it.
pub struct FileStorage {
    root: PathBuf,
    inner: Mutex<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub file_count: usize,
    pub total_size: u64,
    pub operation_count: u64,
    pub storage_dir: String,
}

/// Strip any path components; reject names that vanish entirely.
pub fn sanitize_filename(filename: &str) -> WeftResult<String> {
    let base = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");

    if base.is_empty() || base == "." || base == ".." {
        return Err(WeftError::Validation(format!(
            "invalid filename: {}",
            filename
        )));
    }

    Ok(base.to_string())
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> WeftResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        info!("File storage initialized at {}", root.display());

        Ok(Self {
            root,
            inner: Mutex::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn put_file(&self, filename: &str, data: &[u8]) -> WeftResult<()> {
        let safe = sanitize_filename(filename)?;
        let path = self.root.join(&safe);

        fs::write(&path, data)?;
        *self.inner.lock().unwrap() += 1;
        info!("File PUT (name = {}) (bytes = {})", safe, data.len());
        Ok(())
    }

    pub fn get_file(&self, filename: &str) -> WeftResult<Option<Vec<u8>>> {
        let safe = sanitize_filename(filename)?;
        let path = self.root.join(&safe);

        if !path.is_file() {
            debug!("File GET (name = {}) not found", safe);
            return Ok(None);
        }

        let data = fs::read(&path)?;
        *self.inner.lock().unwrap() += 1;
        info!("File GET (name = {}) (bytes = {})", safe, data.len());
        Ok(Some(data))
    }

    /// Returns the size of the removed file so callers can release quota.
    pub fn delete_file(&self, filename: &str) -> WeftResult<Option<u64>> {
        let safe = sanitize_filename(filename)?;
        let path = self.root.join(&safe);

        if !path.is_file() {
            return Ok(None);
        }

        let size = fs::metadata(&path)?.len();
        fs::remove_file(&path)?;
        *self.inner.lock().unwrap() += 1;
        info!("File DELETE (name = {})", safe);
        Ok(Some(size))
    }

    pub fn contains(&self, filename: &str) -> bool {
        sanitize_filename(filename)
            .map(|safe| self.root.join(safe).is_file())
            .unwrap_or(false)
    }

    pub fn list_files(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if entry.path().is_file() {
                    if let Some(name) = entry.file_name().to_str() {
                        names.push(name.to_string());
                    }
                }
            }
        }
        names.sort();
        names
    }

    pub fn stats(&self) -> StorageStats {
        let mut file_count = 0;
        let mut total_size = 0;
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if let Ok(meta) = entry.metadata() {
                    if meta.is_file() {
                        file_count += 1;
                        total_size += meta.len();
                    }
                }
            }
        }

        StorageStats {
            file_count,
            total_size,
            operation_count: *self.inner.lock().unwrap(),
            storage_dir: self.root.display().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    #[test]
    fn put_get_round_trip() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("pub")).unwrap();

        storage.put_file("report.txt", b"contents").unwrap();
        assert_eq!(
            storage.get_file("report.txt").unwrap(),
            Some(b"contents".to_vec())
        );
        assert_eq!(storage.get_file("absent.txt").unwrap(), None);
    }

    #[test]
    fn traversal_is_stripped_to_basename() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("pub")).unwrap();

        storage.put_file("../../escape.txt", b"x").unwrap();

        // Stored under the sandbox root, not outside it.
        assert!(storage.contains("escape.txt"));
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn dot_names_are_rejected() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("pub")).unwrap();

        assert!(storage.put_file("..", b"x").is_err());
        assert!(storage.put_file("", b"x").is_err());
    }

    #[test]
    fn delete_reports_size() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("pub")).unwrap();

        storage.put_file("f", b"12345").unwrap();
        assert_eq!(storage.delete_file("f").unwrap(), Some(5));
        assert_eq!(storage.delete_file("f").unwrap(), None);
    }

    #[test]
    fn list_is_sorted() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("pub")).unwrap();

        storage.put_file("b", b"1").unwrap();
        storage.put_file("a", b"2").unwrap();
        assert_eq!(storage.list_files(), vec!["a".to_string(), "b".to_string()]);
    }
}

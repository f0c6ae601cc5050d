use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use hashbrown::HashMap;

use serde::{Deserialize, Serialize};

use tempfile::NamedTempFile;

use tracing::{debug, warn};

use crate::error::{Error, ErrorKind, Result};

/// The persisted record of a file stored on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// File name, unique among the stored files.
    pub name: String,
    /// Base64 encoding of the file `SHA-256` digest.
    pub hash: String,
    /// Absolute file path.
    pub path: PathBuf,
}

impl FileInfo {
    /// Creates a [`FileInfo`].
    #[must_use]
    #[inline]
    pub fn new(name: impl Into<String>, hash: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            hash: hash.into(),
            path: path.into(),
        }
    }
}

/// A durable store of [`FileInfo`] records, keyed by file name.
///
/// Implementations serialize their own mutations.
pub trait FileRepository: Send + Sync {
    /// Returns the record of a file, if any.
    ///
    /// # Errors
    ///
    /// Fails when the store cannot be read.
    fn file_info(&self, name: &str) -> Result<Option<FileInfo>>;

    /// Stores a record, replacing the one with the same name.
    ///
    /// # Errors
    ///
    /// Fails when the store cannot be written.
    fn store(&self, info: FileInfo) -> Result<()>;

    /// Removes the record of a file. Removing an unknown name has no effect.
    ///
    /// # Errors
    ///
    /// Fails when the store cannot be written.
    fn remove(&self, name: &str) -> Result<()>;

    /// Returns the names of all stored files.
    ///
    /// # Errors
    ///
    /// Fails when the store cannot be read.
    fn file_names(&self) -> Result<Vec<String>>;
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| Error::new(ErrorKind::Repository, "File repository lock poisoned"))
}

/// A [`FileRepository`] kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryFileRepository {
    files: Mutex<HashMap<String, FileInfo>>,
}

impl InMemoryFileRepository {
    /// Creates an empty [`InMemoryFileRepository`].
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileRepository for InMemoryFileRepository {
    fn file_info(&self, name: &str) -> Result<Option<FileInfo>> {
        Ok(lock(&self.files)?.get(name).cloned())
    }

    fn store(&self, info: FileInfo) -> Result<()> {
        let _ = lock(&self.files)?.insert(info.name.clone(), info);
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        let _ = lock(&self.files)?.remove(name);
        Ok(())
    }

    fn file_names(&self) -> Result<Vec<String>> {
        Ok(lock(&self.files)?.keys().cloned().collect())
    }
}

/// A [`FileRepository`] persisted as a single `JSON` document.
///
/// The whole document is rewritten on every mutation. A new document is
/// first written to a temporary file in the same directory, and then it
/// atomically replaces the previous one.
#[derive(Debug)]
pub struct JsonFileRepository {
    path: PathBuf,
    files: Mutex<HashMap<String, FileInfo>>,
}

impl JsonFileRepository {
    /// Opens a [`JsonFileRepository`], loading the records from the given
    /// path when the document exists.
    ///
    /// # Errors
    ///
    /// Fails when an existing document cannot be read or decoded.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let files = if path.exists() {
            let document = std::fs::read(&path)?;
            let records: Vec<FileInfo> = serde_json::from_slice(&document)?;
            debug!(
                "Loaded {} file records from `{}`",
                records.len(),
                path.display()
            );
            records
                .into_iter()
                .map(|info| (info.name.clone(), info))
                .collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            files: Mutex::new(files),
        })
    }

    /// Returns the path of the `JSON` document.
    #[must_use]
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, files: &HashMap<String, FileInfo>) -> Result<()> {
        let mut records: Vec<&FileInfo> = files.values().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        let document = serde_json::to_vec_pretty(&records)?;

        let directory = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(directory)?;

        let mut staging = NamedTempFile::new_in(directory)?;
        staging.write_all(&document)?;
        staging.as_file().sync_all()?;
        let _ = staging.persist(&self.path)?;

        Ok(())
    }

    fn mutate(&self, change: impl FnOnce(&mut HashMap<String, FileInfo>)) -> Result<()> {
        let mut files = lock(&self.files)?;
        let mut updated = files.clone();
        change(&mut updated);

        if let Err(e) = self.persist(&updated) {
            warn!("Impossible to persist `{}`: {e}", self.path.display());
            return Err(e);
        }

        *files = updated;
        Ok(())
    }
}

impl FileRepository for JsonFileRepository {
    fn file_info(&self, name: &str) -> Result<Option<FileInfo>> {
        Ok(lock(&self.files)?.get(name).cloned())
    }

    fn store(&self, info: FileInfo) -> Result<()> {
        self.mutate(|files| {
            let _ = files.insert(info.name.clone(), info);
        })
    }

    fn remove(&self, name: &str) -> Result<()> {
        if !lock(&self.files)?.contains_key(name) {
            return Ok(());
        }

        self.mutate(|files| {
            let _ = files.remove(name);
        })
    }

    fn file_names(&self) -> Result<Vec<String>> {
        Ok(lock(&self.files)?.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::{FileInfo, FileRepository, InMemoryFileRepository, JsonFileRepository};

    fn exercise(repository: &dyn FileRepository) {
        assert_eq!(repository.file_info("a.bin").unwrap(), None);

        repository
            .store(FileInfo::new("a.bin", "aGFzaA==", "/files/a.bin"))
            .unwrap();
        repository
            .store(FileInfo::new("b.bin", "aGFzaA==", "/files/b.bin"))
            .unwrap();
        // Same name, new record.
        repository
            .store(FileInfo::new("a.bin", "bmV3", "/files/a.bin"))
            .unwrap();

        assert_eq!(
            repository.file_info("a.bin").unwrap(),
            Some(FileInfo::new("a.bin", "bmV3", "/files/a.bin"))
        );

        let mut names = repository.file_names().unwrap();
        names.sort();
        assert_eq!(names, ["a.bin", "b.bin"]);

        repository.remove("b.bin").unwrap();
        repository.remove("unknown.bin").unwrap();
        assert_eq!(repository.file_names().unwrap(), ["a.bin"]);
    }

    #[test]
    fn in_memory_repository() {
        exercise(&InMemoryFileRepository::new());
    }

    #[test]
    fn json_repository() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("files.json");

        exercise(&JsonFileRepository::open(&path).unwrap());

        // Records survive a reopening.
        let reopened = JsonFileRepository::open(&path).unwrap();
        assert_eq!(reopened.path(), path);
        assert_eq!(
            reopened.file_info("a.bin").unwrap(),
            Some(FileInfo::new("a.bin", "bmV3", "/files/a.bin"))
        );
        assert_eq!(reopened.file_names().unwrap(), ["a.bin"]);

        // Only the document remains in the directory.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn corrupted_json_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("files.json");
        std::fs::write(&path, b"{ not a list").unwrap();

        assert!(JsonFileRepository::open(&path).is_err());
    }
}

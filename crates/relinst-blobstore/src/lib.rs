//! Local blob store.
//!
//! Stores opaque byte blobs as files under a root directory, each named by a
//! freshly generated UUID:
//! `<root>/<blob_id>`
//!
//! Features:
//! - Atomic writes via write-to-temp-then-rename
//! - SHA-1 computed while the blob is written and returned to the caller
//! - Every fetch re-hashes the content and fails on mismatch, including for
//!   blobs this process wrote itself
//! - Fetches hand out a private temp copy that the caller releases with
//!   [`Blobstore::cleanup`]

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Errors from blob store operations.
#[derive(Debug, Error)]
pub enum BlobstoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("invalid blob id: {0:?}")]
    InvalidId(String),

    #[error("blob {blob_id} failed SHA-1 verification: expected {expected}, got {actual}")]
    Integrity {
        blob_id: String,
        expected: String,
        actual: String,
    },
}

/// Result type for blob store operations.
pub type BlobstoreResult<T> = Result<T, BlobstoreError>;

/// Reference to a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    /// Opaque id assigned at store time (safe to use as a file name).
    pub id: String,
    /// SHA-1 of the blob content, hex encoded.
    pub sha1: String,
}

/// Blob persistence with integrity verification.
pub trait Blobstore {
    /// Store a copy of the file at `path` as a new blob.
    fn create(&self, path: &Path) -> BlobstoreResult<BlobRef>;

    /// Fetch a blob into a temporary local file after verifying its SHA-1.
    ///
    /// On mismatch nothing is left behind and [`BlobstoreError::Integrity`]
    /// is returned.
    fn get(&self, blob_id: &str, expected_sha1: &str) -> BlobstoreResult<PathBuf>;

    /// Release a file previously returned by [`Blobstore::get`].
    fn cleanup(&self, path: &Path) -> BlobstoreResult<()>;

    /// Remove a stored blob. Removing an absent blob is not an error.
    fn delete(&self, blob_id: &str) -> BlobstoreResult<()>;
}

/// Options for [`LocalBlobstore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalBlobstoreOptions {
    /// Directory holding the blobs.
    pub root_path: PathBuf,
}

/// Blob store backed by a local directory.
#[derive(Debug)]
pub struct LocalBlobstore {
    root: PathBuf,
}

impl LocalBlobstore {
    /// Create a store at `options.root_path`.
    ///
    /// Creates the directory if it doesn't exist.
    pub fn new(options: LocalBlobstoreOptions) -> BlobstoreResult<Self> {
        let root = options.root_path;
        fs::create_dir_all(&root)?;

        // Verify the store is writable
        let test_file = root.join(".store_test");
        File::create(&test_file)?;
        fs::remove_file(&test_file)?;

        Ok(Self { root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Check if a blob exists in the store.
    pub fn has_blob(&self, blob_id: &str) -> bool {
        self.blob_path(blob_id)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    /// Number of stored blobs.
    pub fn blob_count(&self) -> BlobstoreResult<usize> {
        let mut count = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let is_hidden = entry.file_name().to_string_lossy().starts_with('.');
            if !is_hidden && entry.file_type()?.is_file() {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Remove leftover temp files from interrupted writes and fetches.
    ///
    /// Only safe while no other operation on this store is in flight.
    pub fn remove_temps(&self) -> BlobstoreResult<usize> {
        let temp_dir = self.temp_dir();
        if !temp_dir.exists() {
            return Ok(0);
        }

        let mut removed = 0;
        for entry in fs::read_dir(&temp_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() && fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn blob_path(&self, blob_id: &str) -> BlobstoreResult<PathBuf> {
        let valid = !blob_id.is_empty()
            && blob_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(BlobstoreError::InvalidId(blob_id.to_string()));
        }
        Ok(self.root.join(blob_id))
    }

    fn temp_dir(&self) -> PathBuf {
        self.root.join(".tmp")
    }

    fn temp_path(&self) -> BlobstoreResult<PathBuf> {
        let temp_dir = self.temp_dir();
        fs::create_dir_all(&temp_dir)?;
        Ok(temp_dir.join(Uuid::new_v4().to_string()))
    }
}

impl Blobstore for LocalBlobstore {
    fn create(&self, path: &Path) -> BlobstoreResult<BlobRef> {
        let blob_id = Uuid::new_v4().to_string();
        let temp_path = self.temp_path()?;

        let sha1 = match copy_with_sha1(path, &temp_path) {
            Ok(sha1) => sha1,
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                return Err(e.into());
            }
        };

        let final_path = self.blob_path(&blob_id)?;
        if let Err(e) = fs::rename(&temp_path, &final_path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }

        debug!(blob_id = %blob_id, sha1 = %sha1, source = %path.display(), "stored blob");
        Ok(BlobRef { id: blob_id, sha1 })
    }

    fn get(&self, blob_id: &str, expected_sha1: &str) -> BlobstoreResult<PathBuf> {
        let blob_path = self.blob_path(blob_id)?;
        if !blob_path.is_file() {
            return Err(BlobstoreError::NotFound(blob_id.to_string()));
        }

        let temp_path = self.temp_path()?;
        let actual = match copy_with_sha1(&blob_path, &temp_path) {
            Ok(actual) => actual,
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                return Err(e.into());
            }
        };

        if !actual.eq_ignore_ascii_case(expected_sha1) {
            let _ = fs::remove_file(&temp_path);
            return Err(BlobstoreError::Integrity {
                blob_id: blob_id.to_string(),
                expected: expected_sha1.to_string(),
                actual,
            });
        }

        debug!(blob_id = %blob_id, "fetched blob");
        Ok(temp_path)
    }

    fn cleanup(&self, path: &Path) -> BlobstoreResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, blob_id: &str) -> BlobstoreResult<()> {
        let path = self.blob_path(blob_id)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(blob_id = %blob_id, "deleted blob");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Compute the hex SHA-1 of a file.
pub fn sha1_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buffer = [0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Copy `from` to `to`, returning the hex SHA-1 of the bytes copied.
fn copy_with_sha1(from: &Path, to: &Path) -> io::Result<String> {
    let mut reader = File::open(from)?;
    let mut writer = File::create(to)?;
    let mut hasher = Sha1::new();
    let mut buffer = [0u8; 64 * 1024];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        writer.write_all(&buffer[..n])?;
    }

    writer.sync_all()?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store(dir: &Path) -> LocalBlobstore {
        LocalBlobstore::new(LocalBlobstoreOptions {
            root_path: dir.join("blobs"),
        })
        .unwrap()
    }

    fn write_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn temp_entries(store: &LocalBlobstore) -> usize {
        match fs::read_dir(store.root().join(".tmp")) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }

    #[test]
    fn test_store_and_retrieve() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = make_store(temp_dir.path());
        let source = write_file(temp_dir.path(), "payload", b"compiled package bytes");

        let blob = store.create(&source).unwrap();
        assert!(store.has_blob(&blob.id));
        assert_eq!(blob.sha1, sha1_file(&source).unwrap());

        let fetched = store.get(&blob.id, &blob.sha1).unwrap();
        assert_eq!(fs::read(&fetched).unwrap(), b"compiled package bytes");

        store.cleanup(&fetched).unwrap();
        assert!(!fetched.exists());
        assert_eq!(temp_entries(&store), 0);
    }

    #[test]
    fn test_known_sha1() {
        let temp_dir = tempfile::tempdir().unwrap();
        let source = write_file(temp_dir.path(), "abc", b"abc");
        assert_eq!(
            sha1_file(&source).unwrap(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_ids_are_unique() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = make_store(temp_dir.path());
        let source = write_file(temp_dir.path(), "payload", b"same bytes");

        let first = store.create(&source).unwrap();
        let second = store.create(&source).unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(first.sha1, second.sha1);
        assert_eq!(store.blob_count().unwrap(), 2);
    }

    #[test]
    fn test_wrong_sha1_fails_without_leftovers() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = make_store(temp_dir.path());
        let source = write_file(temp_dir.path(), "payload", b"bytes");
        let blob = store.create(&source).unwrap();

        let result = store.get(&blob.id, "0000000000000000000000000000000000000000");
        assert!(matches!(result, Err(BlobstoreError::Integrity { .. })));
        assert_eq!(temp_entries(&store), 0);

        // The blob itself is untouched
        assert!(store.get(&blob.id, &blob.sha1).is_ok());
    }

    #[test]
    fn test_tampered_blob_detected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = make_store(temp_dir.path());
        let source = write_file(temp_dir.path(), "payload", b"original");
        let blob = store.create(&source).unwrap();

        fs::write(store.root().join(&blob.id), b"tampered").unwrap();

        let result = store.get(&blob.id, &blob.sha1);
        assert!(matches!(result, Err(BlobstoreError::Integrity { .. })));
    }

    #[test]
    fn test_missing_blob() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = make_store(temp_dir.path());

        let result = store.get("does-not-exist", "abc");
        assert!(matches!(result, Err(BlobstoreError::NotFound(_))));
    }

    #[test]
    fn test_invalid_id_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = make_store(temp_dir.path());

        assert!(matches!(
            store.get("../escape", "abc"),
            Err(BlobstoreError::InvalidId(_))
        ));
        assert!(matches!(store.delete(""), Err(BlobstoreError::InvalidId(_))));
    }

    #[test]
    fn test_delete() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = make_store(temp_dir.path());
        let source = write_file(temp_dir.path(), "payload", b"bytes");
        let blob = store.create(&source).unwrap();

        store.delete(&blob.id).unwrap();
        assert!(!store.has_blob(&blob.id));

        // Deleting again is fine
        store.delete(&blob.id).unwrap();
    }

    #[test]
    fn test_remove_temps() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = make_store(temp_dir.path());
        let source = write_file(temp_dir.path(), "payload", b"bytes");
        let blob = store.create(&source).unwrap();

        // Fetched but never cleaned up
        let _ = store.get(&blob.id, &blob.sha1).unwrap();
        let _ = store.get(&blob.id, &blob.sha1).unwrap();

        assert_eq!(store.remove_temps().unwrap(), 2);
        assert_eq!(temp_entries(&store), 0);
        assert_eq!(store.blob_count().unwrap(), 1);
    }
}

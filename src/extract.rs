//! Blob extraction into target directories.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use relinst_blobstore::{sha1_file, Blobstore, BlobstoreError};
use thiserror::Error;
use tracing::debug;

use crate::archive::{self, ArchiveError};

/// Errors from extraction.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("fetching blob: {0}")]
    Blobstore(#[from] BlobstoreError),

    #[error("unpacking {archive}: {source}")]
    Unpack {
        archive: String,
        #[source]
        source: ArchiveError,
    },

    #[error("archive {path} failed SHA-1 verification: expected {expected}, got {actual}")]
    Integrity {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Unpacks stored blobs and local archives after verifying their digests.
#[derive(Clone)]
pub struct BlobExtractor {
    blobstore: Arc<dyn Blobstore>,
}

impl BlobExtractor {
    pub fn new(blobstore: Arc<dyn Blobstore>) -> Self {
        Self { blobstore }
    }

    /// Fetch, verify and unpack a blob into `dest`.
    ///
    /// The fetched temp file is released whether unpacking succeeds or not.
    pub fn extract(&self, blob_id: &str, sha1: &str, dest: &Path) -> Result<(), ExtractError> {
        debug!(blob_id = %blob_id, dest = %dest.display(), "extracting blob");

        let fetched = self.blobstore.get(blob_id, sha1)?;
        let unpacked = archive::unpack(&fetched, dest).map_err(|source| ExtractError::Unpack {
            archive: blob_id.to_string(),
            source,
        });
        let cleaned = self.blobstore.cleanup(&fetched);

        unpacked?;
        cleaned?;
        Ok(())
    }

    /// Verify and unpack a local archive (e.g. a package source) into `dest`.
    pub fn extract_archive(&self, path: &Path, sha1: &str, dest: &Path) -> Result<(), ExtractError> {
        let actual = sha1_file(path)?;
        if !actual.eq_ignore_ascii_case(sha1) {
            return Err(ExtractError::Integrity {
                path: path.to_path_buf(),
                expected: sha1.to_string(),
                actual,
            });
        }

        archive::unpack(path, dest).map_err(|source| ExtractError::Unpack {
            archive: path.display().to_string(),
            source,
        })
    }

    /// Delete a blob that is no longer needed.
    pub fn cleanup(&self, blob_id: &str) -> Result<(), ExtractError> {
        Ok(self.blobstore.delete(blob_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relinst_blobstore::{LocalBlobstore, LocalBlobstoreOptions};
    use std::fs;
    use tempfile::TempDir;

    fn setup(temp: &TempDir) -> (Arc<LocalBlobstore>, BlobExtractor) {
        let store = Arc::new(
            LocalBlobstore::new(LocalBlobstoreOptions {
                root_path: temp.path().join("blobs"),
            })
            .unwrap(),
        );
        let extractor = BlobExtractor::new(store.clone());
        (store, extractor)
    }

    fn make_archive(temp: &TempDir) -> PathBuf {
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("bin")).unwrap();
        fs::write(src.join("bin/tool"), "tool").unwrap();
        let archive = temp.path().join("src.tgz");
        archive::pack_dir(&src, &archive).unwrap();
        archive
    }

    fn temp_files(store: &LocalBlobstore) -> usize {
        fs::read_dir(store.root().join(".tmp"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[test]
    fn test_extract_blob() {
        let temp = TempDir::new().unwrap();
        let (store, extractor) = setup(&temp);
        let blob = store.create(&make_archive(&temp)).unwrap();

        let dest = temp.path().join("dest");
        extractor.extract(&blob.id, &blob.sha1, &dest).unwrap();

        assert_eq!(fs::read_to_string(dest.join("bin/tool")).unwrap(), "tool");
        assert_eq!(temp_files(&store), 0);
    }

    #[test]
    fn test_extract_with_wrong_sha1() {
        let temp = TempDir::new().unwrap();
        let (store, extractor) = setup(&temp);
        let blob = store.create(&make_archive(&temp)).unwrap();

        let dest = temp.path().join("dest");
        let result = extractor.extract(&blob.id, "deadbeef", &dest);

        assert!(matches!(
            result,
            Err(ExtractError::Blobstore(BlobstoreError::Integrity { .. }))
        ));
        assert!(!dest.join("bin/tool").exists());
        assert_eq!(temp_files(&store), 0);
    }

    #[test]
    fn test_failed_unpack_still_cleans_up() {
        let temp = TempDir::new().unwrap();
        let (store, extractor) = setup(&temp);
        let not_archive = temp.path().join("plain");
        fs::write(&not_archive, "not a tarball").unwrap();
        let blob = store.create(&not_archive).unwrap();

        let result = extractor.extract(&blob.id, &blob.sha1, &temp.path().join("dest"));

        assert!(matches!(result, Err(ExtractError::Unpack { .. })));
        assert_eq!(temp_files(&store), 0);
    }

    #[test]
    fn test_extract_local_archive() {
        let temp = TempDir::new().unwrap();
        let (_store, extractor) = setup(&temp);
        let archive = make_archive(&temp);
        let sha1 = sha1_file(&archive).unwrap();

        let dest = temp.path().join("dest");
        extractor.extract_archive(&archive, &sha1, &dest).unwrap();
        assert!(dest.join("bin/tool").exists());

        let result = extractor.extract_archive(&archive, "bad", &temp.path().join("other"));
        assert!(matches!(result, Err(ExtractError::Integrity { .. })));
    }

    #[test]
    fn test_cleanup_deletes_blob() {
        let temp = TempDir::new().unwrap();
        let (store, extractor) = setup(&temp);
        let blob = store.create(&make_archive(&temp)).unwrap();

        extractor.cleanup(&blob.id).unwrap();
        assert!(!store.has_blob(&blob.id));
    }
}

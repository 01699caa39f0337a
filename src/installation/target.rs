//! On-disk layout of an installation target.

use std::path::{Path, PathBuf};

/// Directory an installation is written to.
///
/// ```text
/// <path>/blobs                     blobstore root
/// <path>/packages/<name>           installed compiled packages
/// <path>/jobs/<name>               rendered jobs
/// <path>/compiled_packages.jsonl   compiled package index
/// <path>/tmp                       compile scratch space
/// <path>/logs                      packaging script logs
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    path: PathBuf,
}

impl Target {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn blobstore_path(&self) -> PathBuf {
        self.path.join("blobs")
    }

    pub fn packages_path(&self) -> PathBuf {
        self.path.join("packages")
    }

    pub fn jobs_path(&self) -> PathBuf {
        self.path.join("jobs")
    }

    pub fn compiled_package_index_path(&self) -> PathBuf {
        self.path.join("compiled_packages.jsonl")
    }

    pub fn tmp_path(&self) -> PathBuf {
        self.path.join("tmp")
    }

    pub fn logs_path(&self) -> PathBuf {
        self.path.join("logs")
    }

    pub fn package_path(&self, name: &str) -> PathBuf {
        self.packages_path().join(name)
    }

    pub fn job_path(&self, name: &str) -> PathBuf {
        self.jobs_path().join(name)
    }
}

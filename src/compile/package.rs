//! Compiling a single package.
//!
//! A compile is skipped entirely when the repository already holds a record
//! for `(name, fingerprint, dependency_key)`. Otherwise the package is built
//! in a scratch directory:
//!
//! ```text
//! <scratch>/src/          verified and unpacked source archive
//! <scratch>/packages/<d>/ compiled dependency blobs
//! <scratch>/install/      output, packed and stored on success
//! ```
//!
//! The scratch directory is removed whether the compile succeeds or not.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use relinst_blobstore::{BlobRef, Blobstore, BlobstoreError};
use relinst_index::{Index, IndexError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::repo::{CompiledPackageRecord, CompiledPackageRepo};
use super::runner::{log_tail, CommandRunner, CommandSpec, RunnerError};
use crate::archive::{self, ArchiveError};
use crate::digest::canonical_sha256;
use crate::extract::{BlobExtractor, ExtractError};
use crate::release::Package;

/// Name of the build script inside a package source archive.
pub const PACKAGING_SCRIPT: &str = "packaging";

/// Lines of the build log quoted in a failure.
const LOG_TAIL_LINES: usize = 20;

/// Errors from compiling one package.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("computing dependency key: {0}")]
    DependencyKey(#[from] serde_json::Error),

    #[error("compiled package cache: {0}")]
    Cache(#[from] IndexError),

    #[error("preparing source: {0}")]
    Source(#[source] ExtractError),

    #[error("extracting compiled dependency '{name}': {source}")]
    Dependency {
        name: String,
        #[source]
        source: ExtractError,
    },

    #[error("source archive has no '{}' script", PACKAGING_SCRIPT)]
    MissingScript,

    #[error("running packaging script: {0}")]
    Runner(#[from] RunnerError),

    #[error("packaging script failed with {status} (log: {}):\n{tail}", .log.display())]
    ScriptFailed {
        status: String,
        log: PathBuf,
        tail: String,
    },

    #[error("packaging script produced no output in the install directory")]
    NoOutput,

    #[error("packing compiled output: {0}")]
    Archive(#[from] ArchiveError),

    #[error("storing compiled package: {0}")]
    Store(#[from] BlobstoreError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A package compiled during this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPackageRef {
    pub name: String,
    pub fingerprint: String,
    pub record: CompiledPackageRecord,
}

#[derive(Serialize)]
struct DependencyKeyEntry<'a> {
    name: &'a str,
    fingerprint: &'a str,
    blob_sha1: &'a str,
}

/// Key identifying the exact compiled dependencies a package is built
/// against. Order of `dependencies` does not matter.
pub fn dependency_key(dependencies: &[CompiledPackageRef]) -> Result<String, serde_json::Error> {
    let mut entries: Vec<_> = dependencies
        .iter()
        .map(|dep| DependencyKeyEntry {
            name: &dep.name,
            fingerprint: &dep.fingerprint,
            blob_sha1: &dep.record.blob_sha1,
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(b.name));
    canonical_sha256(&entries)
}

/// Compiles one package against already compiled dependencies.
pub trait PackageCompiler {
    fn compile(
        &mut self,
        package: &Package,
        dependencies: &[CompiledPackageRef],
    ) -> Result<CompiledPackageRecord, CompileError>;
}

/// Where compiles run and how.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Shell used to run the packaging script
    pub shell: String,
    /// Parent of per-compile scratch directories
    pub scratch_root: PathBuf,
    /// Directory for per-package build logs
    pub logs_root: PathBuf,
}

/// Compiles packages from release sources with a packaging script.
pub struct ReleasePackageCompiler<I: Index, R: CommandRunner> {
    repo: CompiledPackageRepo<I>,
    blobstore: Arc<dyn Blobstore>,
    extractor: BlobExtractor,
    runner: R,
    options: CompileOptions,
}

impl<I: Index, R: CommandRunner> ReleasePackageCompiler<I, R> {
    pub fn new(
        repo: CompiledPackageRepo<I>,
        blobstore: Arc<dyn Blobstore>,
        extractor: BlobExtractor,
        runner: R,
        options: CompileOptions,
    ) -> Self {
        Self {
            repo,
            blobstore,
            extractor,
            runner,
            options,
        }
    }

    pub fn repo(&self) -> &CompiledPackageRepo<I> {
        &self.repo
    }

    /// Build log location for a package.
    pub fn log_path(&self, package: &Package) -> PathBuf {
        let short: String = package.fingerprint.chars().take(12).collect();
        self.options
            .logs_root
            .join(format!("{}-{}.log", package.name, short))
    }

    fn build(
        &self,
        scratch: &Path,
        package: &Package,
        dependencies: &[CompiledPackageRef],
    ) -> Result<BlobRef, CompileError> {
        let src_dir = scratch.join("src");
        self.extractor
            .extract_archive(&package.source.path, &package.source.sha1, &src_dir)
            .map_err(CompileError::Source)?;

        let packages_dir = scratch.join("packages");
        fs::create_dir_all(&packages_dir)?;
        for dep in dependencies {
            self.extractor
                .extract(
                    &dep.record.blob_id,
                    &dep.record.blob_sha1,
                    &packages_dir.join(&dep.name),
                )
                .map_err(|source| CompileError::Dependency {
                    name: dep.name.clone(),
                    source,
                })?;
        }

        if !src_dir.join(PACKAGING_SCRIPT).is_file() {
            return Err(CompileError::MissingScript);
        }

        let install_dir = scratch.join("install");
        fs::create_dir_all(&install_dir)?;

        let log_path = self.log_path(package);
        match fs::remove_file(&log_path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        let mut env = BTreeMap::new();
        env.insert("PKG_NAME".to_string(), package.name.clone());
        env.insert("PKG_COMPILE_TARGET".to_string(), path_string(&src_dir));
        env.insert("PKG_INSTALL_TARGET".to_string(), path_string(&install_dir));
        env.insert("PKG_PACKAGES_DIR".to_string(), path_string(&packages_dir));

        let spec = CommandSpec {
            program: self.options.shell.clone(),
            args: vec!["-x".to_string(), PACKAGING_SCRIPT.to_string()],
            working_dir: src_dir,
            env,
            log_path: log_path.clone(),
        };

        let outcome = self.runner.run(&spec)?;
        if !outcome.success() {
            return Err(CompileError::ScriptFailed {
                status: outcome.describe(),
                tail: log_tail(&log_path, LOG_TAIL_LINES),
                log: log_path,
            });
        }
        debug!(package = %package.name, duration = ?outcome.duration, "packaging script finished");

        if fs::read_dir(&install_dir)?.next().is_none() {
            return Err(CompileError::NoOutput);
        }

        let archive_path = scratch.join("compiled.tgz");
        archive::pack_dir(&install_dir, &archive_path)?;
        Ok(self.blobstore.create(&archive_path)?)
    }
}

impl<I: Index, R: CommandRunner> PackageCompiler for ReleasePackageCompiler<I, R> {
    fn compile(
        &mut self,
        package: &Package,
        dependencies: &[CompiledPackageRef],
    ) -> Result<CompiledPackageRecord, CompileError> {
        let dependency_key = dependency_key(dependencies)?;

        if let Some(record) = self.repo.find(package, &dependency_key)? {
            debug!(package = %package.name, blob_id = %record.blob_id, "compiled package cache hit");
            return Ok(record);
        }

        info!(package = %package.name, fingerprint = %package.fingerprint, "compiling package");

        fs::create_dir_all(&self.options.scratch_root)?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("compile-{}-", package.name))
            .tempdir_in(&self.options.scratch_root)?;

        let blob = self.build(scratch.path(), package, dependencies)?;
        let record = CompiledPackageRecord {
            blob_id: blob.id,
            blob_sha1: blob.sha1,
            dependency_key,
        };

        let stored = scratch
            .close()
            .map_err(CompileError::from)
            .and_then(|()| self.repo.save(package, &record).map_err(CompileError::from));
        if let Err(e) = stored {
            // The blob is unreachable without its record.
            if let Err(delete_err) = self.blobstore.delete(&record.blob_id) {
                warn!(
                    blob_id = %record.blob_id,
                    error = %delete_err,
                    "failed to delete unrecorded blob"
                );
            }
            return Err(e);
        }

        info!(package = %package.name, blob_id = %record.blob_id, "compiled package stored");
        Ok(record)
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

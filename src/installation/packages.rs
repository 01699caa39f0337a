//! Compiling the packages jobs need and installing them into the target.

use std::io;

use thiserror::Error;
use tracing::debug;

use super::{remove_dir_if_exists, Target};
use crate::compile::{CompiledPackages, DependencyCompiler, DependencyError, PackageCompiler};
use crate::extract::{BlobExtractor, ExtractError};
use crate::release::{Job, Release};

#[derive(Debug, Error)]
pub enum PackageInstallError {
    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error("installing package '{package}': {source}")]
    Extract {
        package: String,
        #[source]
        source: ExtractError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Compiles job dependencies and extracts each into its package directory
/// under the target.
pub struct PackageInstaller<C: PackageCompiler> {
    compiler: DependencyCompiler<C>,
    extractor: BlobExtractor,
    target: Target,
}

impl<C: PackageCompiler> PackageInstaller<C> {
    pub fn new(
        compiler: DependencyCompiler<C>,
        extractor: BlobExtractor,
        target: Target,
    ) -> Self {
        Self {
            compiler,
            extractor,
            target,
        }
    }

    pub fn compiler(&self) -> &DependencyCompiler<C> {
        &self.compiler
    }

    /// Compile every package `jobs` need without installing anything.
    pub fn compile(
        &mut self,
        release: &Release,
        jobs: &[&Job],
    ) -> Result<CompiledPackages, PackageInstallError> {
        Ok(self.compiler.compile(release, jobs)?)
    }

    /// Compile and install every package `jobs` need, replacing previous
    /// contents of each package directory.
    pub fn install(
        &mut self,
        release: &Release,
        jobs: &[&Job],
    ) -> Result<CompiledPackages, PackageInstallError> {
        let compiled = self.compile(release, jobs)?;

        for package in compiled.iter() {
            let dest = self.target.package_path(&package.name);
            remove_dir_if_exists(&dest)?;
            self.extractor
                .extract(&package.record.blob_id, &package.record.blob_sha1, &dest)
                .map_err(|source| PackageInstallError::Extract {
                    package: package.name.clone(),
                    source,
                })?;
            debug!(package = %package.name, path = %dest.display(), "package installed");
        }

        Ok(compiled)
    }
}

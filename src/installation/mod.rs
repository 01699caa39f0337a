//! Installing a release into a target directory.
//!
//! [`Installer::install`] locks the target, loads the release named by the
//! installation manifest, compiles and installs every package the selected
//! jobs need, and renders the jobs. Collaborators are built once per run from
//! the target layout and the installer configuration.

mod jobs;
mod lock;
mod manifest;
mod packages;
mod registry;
mod render;
mod target;

pub use jobs::{JobResolveError, JobResolver};
pub use lock::{LockError, TargetLock};
pub use manifest::{InstallationManifest, ManifestError};
pub use packages::{PackageInstallError, PackageInstaller};
pub use registry::{ProcessRegistry, RegistryConfig, RegistryError, RegistryManager};
pub use render::{JobRenderError, JobRenderer, PropertyRenderer, RenderError, RenderedJob, Renderer};
pub use target::Target;

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use relinst_blobstore::{BlobstoreError, LocalBlobstore, LocalBlobstoreOptions};
use relinst_index::{FileIndex, IndexError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::compile::{
    CommandRunner, CompileOptions, CompiledPackageRepo, CompiledPackages, DependencyCompiler,
    ReleasePackageCompiler, SystemRunner,
};
use crate::config::InstallerConfig;
use crate::extract::BlobExtractor;
use crate::release::{Release, ReleaseError};

/// Errors from an install, compile or uninstall run.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("loading release: {0}")]
    Release(#[from] ReleaseError),

    #[error(transparent)]
    Jobs(#[from] JobResolveError),

    #[error(transparent)]
    Packages(#[from] PackageInstallError),

    #[error(transparent)]
    Render(#[from] JobRenderError),

    #[error("template renderer: {0}")]
    Renderer(#[from] RenderError),

    #[error("opening blobstore: {0}")]
    Blobstore(#[from] BlobstoreError),

    #[error("opening compiled package index: {0}")]
    Index(#[from] IndexError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Remove `dir` and everything below it, if present.
pub(crate) fn remove_dir_if_exists(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// A finished installation.
pub struct Installation {
    target: Target,
    name: String,
    release: Release,
    jobs: Vec<RenderedJob>,
    packages: CompiledPackages,
    registry: Option<Box<dyn RegistryManager>>,
}

impl Installation {
    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn release(&self) -> &Release {
        &self.release
    }

    pub fn jobs(&self) -> &[RenderedJob] {
        &self.jobs
    }

    pub fn packages(&self) -> &CompiledPackages {
        &self.packages
    }

    pub fn has_registry(&self) -> bool {
        self.registry.is_some()
    }

    /// Start the registry, if the manifest configures one.
    pub fn start_registry(&mut self) -> Result<(), RegistryError> {
        match self.registry.as_mut() {
            Some(registry) => registry.start(),
            None => {
                debug!(installation = %self.name, "no registry configured");
                Ok(())
            }
        }
    }

    pub fn stop_registry(&mut self) -> Result<(), RegistryError> {
        match self.registry.as_mut() {
            Some(registry) => registry.stop(),
            None => Ok(()),
        }
    }

    /// Run `f` with the registry up; it is stopped again whether `f`
    /// succeeds or not.
    pub fn with_running_registry<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Installation) -> Result<T, E>,
        E: From<RegistryError>,
    {
        self.start_registry()?;
        let result = f(self);
        match self.stop_registry() {
            Ok(()) => result,
            Err(e) if result.is_ok() => Err(e.into()),
            Err(e) => {
                warn!(error = %e, "failed to stop registry after error");
                result
            }
        }
    }
}

/// Per-run collaborators built from the target layout.
struct Services<'i, R: CommandRunner> {
    blobstore: Arc<LocalBlobstore>,
    extractor: BlobExtractor,
    packages: PackageInstaller<ReleasePackageCompiler<FileIndex, &'i R>>,
}

/// Installs releases described by installation manifests.
pub struct Installer<R: CommandRunner = SystemRunner> {
    config: InstallerConfig,
    renderer: Box<dyn Renderer>,
    runner: R,
}

impl Installer<SystemRunner> {
    pub fn new(config: InstallerConfig) -> Result<Self, InstallError> {
        Ok(Self::with_parts(
            config,
            Box::new(PropertyRenderer::new()?),
            SystemRunner::new(),
        ))
    }
}

impl<R: CommandRunner> Installer<R> {
    pub fn with_parts(config: InstallerConfig, renderer: Box<dyn Renderer>, runner: R) -> Self {
        Self {
            config,
            renderer,
            runner,
        }
    }

    pub fn config(&self) -> &InstallerConfig {
        &self.config
    }

    /// Compile and install the manifest's release into `target`.
    pub fn install(
        &self,
        manifest: &InstallationManifest,
        target: &Target,
    ) -> Result<Installation, InstallError> {
        let _lock = TargetLock::acquire(target.path(), self.config.lock_timeout())?;
        let release = Release::load(&manifest.release_dir())?;
        info!(
            installation = %manifest.name,
            release = %release.name(),
            version = %release.version(),
            target = %target.path().display(),
            "installing release"
        );

        let jobs = JobResolver::new().resolve(&release, &manifest.jobs)?;

        let mut services = self.services(target)?;
        let packages = services.packages.install(&release, &jobs)?;

        let renderer = JobRenderer::new(
            &*self.renderer,
            services.blobstore.clone(),
            services.extractor.clone(),
            target.tmp_path(),
        );
        let mut rendered = Vec::with_capacity(jobs.len());
        for job in &jobs {
            rendered.push(renderer.render(job, &manifest.properties, &target.job_path(&job.name))?);
        }

        let registry = manifest.registry.clone().map(|config| {
            Box::new(ProcessRegistry::new(
                config,
                target.path().to_path_buf(),
                target.logs_path().join("registry.log"),
                self.config.registry_grace(),
            )) as Box<dyn RegistryManager>
        });

        info!(
            installation = %manifest.name,
            packages = packages.len(),
            jobs = rendered.len(),
            "installation complete"
        );
        Ok(Installation {
            target: target.clone(),
            name: manifest.name.clone(),
            release,
            jobs: rendered,
            packages,
            registry,
        })
    }

    /// Compile the packages the manifest's jobs need, filling the cache
    /// without installing anything.
    pub fn compile(
        &self,
        manifest: &InstallationManifest,
        target: &Target,
    ) -> Result<CompiledPackages, InstallError> {
        let _lock = TargetLock::acquire(target.path(), self.config.lock_timeout())?;
        let release = Release::load(&manifest.release_dir())?;
        let jobs = JobResolver::new().resolve(&release, &manifest.jobs)?;

        let mut services = self.services(target)?;
        Ok(services.packages.compile(&release, &jobs)?)
    }

    /// Remove everything installed into `target`.
    pub fn uninstall(&self, target: &Target) -> Result<(), InstallError> {
        if !target.path().exists() {
            debug!(target = %target.path().display(), "nothing to uninstall");
            return Ok(());
        }
        let _lock = TargetLock::acquire(target.path(), self.config.lock_timeout())?;
        remove_dir_if_exists(target.path())?;
        info!(target = %target.path().display(), "installation removed");
        Ok(())
    }

    fn services(&self, target: &Target) -> Result<Services<'_, R>, InstallError> {
        let blobstore = Arc::new(LocalBlobstore::new(LocalBlobstoreOptions {
            root_path: target.blobstore_path(),
        })?);
        let removed = blobstore.remove_temps()?;
        if removed > 0 {
            debug!(removed, "removed leftover blobstore temp files");
        }

        let index = FileIndex::open(target.compiled_package_index_path())?;
        let extractor = BlobExtractor::new(blobstore.clone());
        let compiler = ReleasePackageCompiler::new(
            CompiledPackageRepo::new(index),
            blobstore.clone(),
            extractor.clone(),
            &self.runner,
            CompileOptions {
                shell: self.config.shell.clone(),
                scratch_root: target.tmp_path(),
                logs_root: target.logs_path(),
            },
        );
        let packages = PackageInstaller::new(
            DependencyCompiler::new(compiler),
            extractor.clone(),
            target.clone(),
        );

        Ok(Services {
            blobstore,
            extractor,
            packages,
        })
    }
}

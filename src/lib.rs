//! relinst - release installer
//!
//! Compiles the packages of a release (jobs plus packages built from source
//! with a `packaging` script) in dependency order, caches compiled packages
//! by content, and installs them together with rendered jobs into a target
//! directory.

pub mod archive;
pub mod compile;
pub mod config;
pub mod digest;
pub mod extract;
pub mod installation;
pub mod release;

pub use compile::{
    CompileError, CompiledPackageRecord, CompiledPackageRef, CompiledPackageRepo,
    CompiledPackages, DependencyCompiler, DependencyError, PackageCompiler,
    ReleasePackageCompiler,
};
pub use config::{ConfigError, InstallerConfig};
pub use extract::{BlobExtractor, ExtractError};
pub use installation::{
    InstallError, Installation, InstallationManifest, Installer, Target, TargetLock,
};
pub use release::{Job, Package, Release, ReleaseError, SourceArchive};

//! Release model: jobs, packages and their dependencies.
//!
//! A release is loaded once from a directory containing `release.toml` and
//! is read-only afterwards. Package dependencies are stored by name and
//! resolved against the owning [`Release`].

mod manifest;

pub use manifest::{JobEntry, PackageEntry, ReleaseManifest, RELEASE_MANIFEST};

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::digest::canonical_sha256;

/// Errors that can occur when loading or validating a release.
#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("Failed to read release manifest: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse release manifest: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Release manifest not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid {kind} name: '{name}' (must be a single path component)")]
    InvalidName { kind: &'static str, name: String },

    #[error("Duplicate {kind} name: '{name}'")]
    DuplicateName { kind: &'static str, name: String },

    #[error("Package '{package}' depends on unknown package '{dependency}'")]
    UnknownDependency { package: String, dependency: String },

    #[error("Job '{job}' requires unknown package '{package}'")]
    UnknownJobPackage { job: String, package: String },

    #[error("Dependency cycle between packages: {}", .packages.join(", "))]
    Cycle { packages: Vec<String> },

    #[error("Failed to compute fingerprint for package '{package}': {reason}")]
    Fingerprint { package: String, reason: String },
}

/// Source archive of a package, as shipped in the release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceArchive {
    /// Path to the gzip tar holding the package source and `packaging` script.
    pub path: PathBuf,
    /// Expected SHA-1 of the archive, hex encoded.
    pub sha1: String,
}

/// A package: source plus declared dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub name: String,
    /// Deterministic identity of the source and its transitive dependencies.
    pub fingerprint: String,
    pub source: SourceArchive,
    /// Names of direct dependencies.
    pub dependencies: Vec<String>,
}

/// A job: a runnable unit that requires packages and ships templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub name: String,
    /// Names of required packages.
    pub packages: Vec<String>,
    /// Template path (relative to `<dir>/templates`) to rendered destination
    /// (relative to the installed job directory).
    pub templates: BTreeMap<String, String>,
    /// Directory holding the job's files.
    pub dir: PathBuf,
}

impl Job {
    /// Directory holding the job's template sources.
    pub fn templates_dir(&self) -> PathBuf {
        self.dir.join("templates")
    }
}

/// A versioned bundle of jobs and packages.
#[derive(Debug, Clone)]
pub struct Release {
    name: String,
    version: String,
    packages: Vec<Package>,
    jobs: Vec<Job>,
}

impl Release {
    /// Build a release, validating names and references.
    ///
    /// Dependency cycles are not rejected here; they surface when the
    /// packages are ordered for compilation.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        packages: Vec<Package>,
        jobs: Vec<Job>,
    ) -> Result<Self, ReleaseError> {
        let mut package_names = HashSet::new();
        for package in &packages {
            check_name("package", &package.name)?;
            if !package_names.insert(package.name.as_str()) {
                return Err(ReleaseError::DuplicateName {
                    kind: "package",
                    name: package.name.clone(),
                });
            }
        }

        for package in &packages {
            for dependency in &package.dependencies {
                if !package_names.contains(dependency.as_str()) {
                    return Err(ReleaseError::UnknownDependency {
                        package: package.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        let mut job_names = HashSet::new();
        for job in &jobs {
            check_name("job", &job.name)?;
            if !job_names.insert(job.name.as_str()) {
                return Err(ReleaseError::DuplicateName {
                    kind: "job",
                    name: job.name.clone(),
                });
            }
            for package in &job.packages {
                if !package_names.contains(package.as_str()) {
                    return Err(ReleaseError::UnknownJobPackage {
                        job: job.name.clone(),
                        package: package.clone(),
                    });
                }
            }
        }

        Ok(Self {
            name: name.into(),
            version: version.into(),
            packages,
            jobs,
        })
    }

    /// Load a release from a directory containing `release.toml`.
    pub fn load(dir: &Path) -> Result<Self, ReleaseError> {
        ReleaseManifest::load(dir)?.into_release(dir)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn packages(&self) -> &[Package] {
        &self.packages
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Get a package by name
    pub fn package(&self, name: &str) -> Option<&Package> {
        self.packages.iter().find(|p| p.name == name)
    }

    /// Get a job by name
    pub fn job(&self, name: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

/// Names become directory names under the target, so they must be a single
/// normal path component.
fn check_name(kind: &'static str, name: &str) -> Result<(), ReleaseError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.contains('\0');
    if valid {
        Ok(())
    } else {
        Err(ReleaseError::InvalidName {
            kind,
            name: name.to_string(),
        })
    }
}

#[derive(Serialize)]
struct FingerprintInput<'a> {
    name: &'a str,
    source_sha1: &'a str,
    dependencies: Vec<DependencyFingerprint<'a>>,
}

#[derive(Serialize)]
struct DependencyFingerprint<'a> {
    name: &'a str,
    fingerprint: &'a str,
}

/// Fingerprint of a package from its source digest and the fingerprints of
/// its direct dependencies (which in turn cover theirs).
///
/// `dependencies` are `(name, fingerprint)` pairs in any order.
pub fn package_fingerprint(
    name: &str,
    source_sha1: &str,
    dependencies: &[(&str, &str)],
) -> Result<String, serde_json::Error> {
    let mut dependencies: Vec<_> = dependencies
        .iter()
        .map(|&(name, fingerprint)| DependencyFingerprint { name, fingerprint })
        .collect();
    dependencies.sort_by(|a, b| a.name.cmp(b.name));

    canonical_sha256(&FingerprintInput {
        name,
        source_sha1,
        dependencies,
    })
}

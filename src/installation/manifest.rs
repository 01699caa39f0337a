//! Installation manifest: which release to install, which of its jobs, and
//! the properties their templates are rendered with.
//!
//! ```toml
//! name = "cpi"
//! release = "releases/cpi"    # relative to this file
//! jobs = ["cpi"]              # empty or absent: every job in the release
//!
//! [properties]
//! cpi.host = "10.0.0.5"
//!
//! [registry]
//! command = "registry-server"
//! args = ["--port", "25777"]
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::registry::RegistryConfig;

/// Errors that can occur when loading an installation manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Failed to read installation manifest: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse installation manifest: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Installation manifest not found: {0}")]
    NotFound(PathBuf),

    #[error("Missing required field '{0}' in installation manifest")]
    MissingField(&'static str),

    #[error("Job '{0}' listed more than once")]
    DuplicateJob(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallationManifest {
    pub name: String,

    /// Release directory, relative to the manifest's directory
    pub release: PathBuf,

    #[serde(default)]
    pub jobs: Vec<String>,

    #[serde(default)]
    pub properties: Map<String, Value>,

    #[serde(default)]
    pub registry: Option<RegistryConfig>,

    /// Directory the manifest was loaded from
    #[serde(skip)]
    base_dir: PathBuf,
}

impl InstallationManifest {
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        if !path.exists() {
            return Err(ManifestError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path)?;
        let mut manifest = Self::parse(&content)?;
        manifest.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(manifest)
    }

    /// Parse a manifest; relative paths resolve against the current directory.
    pub fn parse(content: &str) -> Result<Self, ManifestError> {
        let manifest: Self = toml::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        if self.name.is_empty() {
            return Err(ManifestError::MissingField("name"));
        }
        if self.release.as_os_str().is_empty() {
            return Err(ManifestError::MissingField("release"));
        }

        let mut seen = HashSet::new();
        for job in &self.jobs {
            if !seen.insert(job) {
                return Err(ManifestError::DuplicateJob(job.clone()));
            }
        }
        Ok(())
    }

    /// Absolute (or manifest-relative) release directory.
    pub fn release_dir(&self) -> PathBuf {
        self.base_dir.join(&self.release)
    }
}

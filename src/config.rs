//! Installer configuration, read from `~/.config/relinst/config.toml`.
//!
//! ```toml
//! data_dir = "/var/lib/relinst"
//! shell = "bash"
//! registry_grace_seconds = 10
//! lock_timeout_seconds = 30
//! ```
//!
//! Every field is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::digest::sha256_hex;
use crate::installation::Target;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    /// Root for installation targets without an explicit path
    pub data_dir: PathBuf,

    /// Shell that runs packaging scripts
    pub shell: String,

    /// Seconds between SIGTERM and SIGKILL when stopping the registry
    pub registry_grace_seconds: u64,

    /// Seconds to wait for another install on the same target
    pub lock_timeout_seconds: u64,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        let data_dir = match std::env::var("HOME") {
            Ok(home) => PathBuf::from(home).join(".local/share/relinst"),
            Err(_) => std::env::temp_dir().join("relinst"),
        };
        Self {
            data_dir,
            shell: "bash".to_string(),
            registry_grace_seconds: 10,
            lock_timeout_seconds: 30,
        }
    }
}

impl InstallerConfig {
    /// `~/.config/relinst/config.toml`, if `HOME` is set.
    pub fn default_path() -> Option<PathBuf> {
        std::env::var("HOME")
            .ok()
            .map(|home| PathBuf::from(home).join(".config/relinst/config.toml"))
    }

    /// Load the default config file, falling back to defaults when absent.
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_seconds)
    }

    pub fn registry_grace(&self) -> Duration {
        Duration::from_secs(self.registry_grace_seconds)
    }

    /// Default target for a manifest: `<data_dir>/installations/<id>`, where
    /// the id is derived from the manifest's absolute path.
    pub fn target_for(&self, manifest_path: &Path) -> Target {
        let absolute = manifest_path
            .canonicalize()
            .unwrap_or_else(|_| manifest_path.to_path_buf());
        let digest = sha256_hex(absolute.to_string_lossy().as_bytes());
        let id = digest.get(..16).unwrap_or(&digest);
        Target::new(self.data_dir.join("installations").join(id))
    }
}

//! Sidecar registry process that runs alongside an installation.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::compile::runner::ENV_ALLOWLIST;

/// `[registry]` section of an installation manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry is already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("failed to start registry '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Starts and stops the registry.
pub trait RegistryManager {
    fn start(&mut self) -> Result<(), RegistryError>;
    fn stop(&mut self) -> Result<(), RegistryError>;
    fn is_running(&mut self) -> bool;
}

/// Registry run as a local child process.
///
/// Stopping sends SIGTERM and waits up to the grace period before killing.
#[derive(Debug)]
pub struct ProcessRegistry {
    config: RegistryConfig,
    working_dir: PathBuf,
    log_path: PathBuf,
    grace: Duration,
    child: Option<Child>,
}

impl ProcessRegistry {
    pub fn new(
        config: RegistryConfig,
        working_dir: PathBuf,
        log_path: PathBuf,
        grace: Duration,
    ) -> Self {
        Self {
            config,
            working_dir,
            log_path,
            grace,
            child: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    fn terminate(&self, child: &mut Child) -> io::Result<()> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            let pid = Pid::from_raw(child.id() as i32);
            let _ = signal::kill(pid, Signal::SIGTERM);
        }
        #[cfg(not(unix))]
        {
            let _ = child.kill();
        }

        let start = Instant::now();
        while start.elapsed() < self.grace {
            if child.try_wait()?.is_some() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        warn!(pid = child.id(), "registry ignored SIGTERM, killing");
        let _ = child.kill();
        child.wait()?;
        Ok(())
    }
}

impl RegistryManager for ProcessRegistry {
    fn start(&mut self) -> Result<(), RegistryError> {
        if self.is_running() {
            return Err(RegistryError::AlreadyRunning(self.pid().unwrap_or_default()));
        }

        if let Some(parent) = self.log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;

        let env: BTreeMap<String, String> = ENV_ALLOWLIST
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
            .chain(self.config.env.clone())
            .collect();

        let child = Command::new(&self.config.command)
            .args(&self.config.args)
            .current_dir(&self.working_dir)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .spawn()
            .map_err(|source| RegistryError::Spawn {
                command: self.config.command.clone(),
                source,
            })?;

        info!(command = %self.config.command, pid = child.id(), "registry started");
        self.child = Some(child);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), RegistryError> {
        let Some(mut child) = self.child.take() else {
            debug!("registry not running");
            return Ok(());
        };

        if child.try_wait()?.is_none() {
            self.terminate(&mut child)?;
        }
        info!(pid = child.id(), "registry stopped");
        Ok(())
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.as_mut().map(Child::try_wait), Some(Ok(None)))
    }
}

impl Drop for ProcessRegistry {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "failed to stop registry");
        }
    }
}

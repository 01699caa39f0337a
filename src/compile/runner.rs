//! Running packaging scripts.
//!
//! Commands run with a cleared environment: only [`ENV_ALLOWLIST`] entries of
//! the caller's environment are passed through, plus the variables given in
//! the [`CommandSpec`]. Stdout and stderr are streamed line by line into a log
//! file; the exit status decides success.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

/// Caller environment variables passed to packaging scripts.
pub const ENV_ALLOWLIST: &[&str] = &[
    "HOME", "PATH", "TMPDIR", "LANG", "LC_ALL", "LC_CTYPE", "TERM", "USER", "LOGNAME",
];

/// Errors from running a command.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to open log {path}: {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A command to run.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Set on top of the allowlisted caller environment
    pub env: BTreeMap<String, String>,
    /// Combined stdout/stderr destination (appended)
    pub log_path: PathBuf,
}

/// How a command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub exit_code: Option<i32>,
    /// Terminating signal, e.g. `SIG9`
    pub signal: Option<String>,
    pub duration: Duration,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Human readable status for error messages.
    pub fn describe(&self) -> String {
        match (&self.exit_code, &self.signal) {
            (Some(code), _) => format!("exit code {}", code),
            (None, Some(signal)) => format!("killed by {}", signal),
            (None, None) => "unknown status".to_string(),
        }
    }
}

/// Runs external commands to completion.
pub trait CommandRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutcome, RunnerError>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutcome, RunnerError> {
        (**self).run(spec)
    }
}

/// Runs commands as local child processes.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }

    fn environment(spec: &CommandSpec) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        for key in ENV_ALLOWLIST {
            if let Ok(value) = std::env::var(key) {
                env.insert(key.to_string(), value);
            }
        }
        env.extend(spec.env.clone());
        env
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutcome, RunnerError> {
        if let Some(parent) = spec.log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_path)
            .map_err(|source| RunnerError::Log {
                path: spec.log_path.clone(),
                source,
            })?;
        let log_file = Arc::new(Mutex::new(log_file));

        debug!(
            program = %spec.program,
            args = ?spec.args,
            cwd = %spec.working_dir.display(),
            "running command"
        );

        let start = Instant::now();
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .env_clear()
            .envs(Self::environment(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                program: spec.program.clone(),
                source,
            })?;

        let stdout = child.stdout.take().map(|out| stream(out, Arc::clone(&log_file), ""));
        let stderr = child
            .stderr
            .take()
            .map(|err| stream(err, Arc::clone(&log_file), "[stderr] "));

        let status = child.wait()?;

        for handle in [stdout, stderr].into_iter().flatten() {
            if handle.join().is_err() {
                warn!(log = %spec.log_path.display(), "log streaming thread panicked");
            }
        }

        let signal = if status.code().is_none() {
            termination_signal(&status)
        } else {
            None
        };

        Ok(CommandOutcome {
            exit_code: status.code(),
            signal,
            duration: start.elapsed(),
        })
    }
}

fn stream<R>(
    reader: R,
    log: Arc<Mutex<fs::File>>,
    prefix: &'static str,
) -> thread::JoinHandle<()>
where
    R: io::Read + Send + 'static,
{
    thread::spawn(move || {
        let mut failed = false;
        for line in BufReader::new(reader).lines().map_while(Result::ok) {
            // The pipe is drained even after a failed write.
            if failed {
                continue;
            }
            let written = match log.lock() {
                Ok(mut file) => writeln!(file, "{}{}", prefix, line),
                Err(_) => Err(io::Error::new(io::ErrorKind::Other, "log file lock poisoned")),
            };
            if let Err(e) = written {
                warn!(error = %e, "failed to write command output, log is truncated");
                failed = true;
            }
        }
    })
}

#[cfg(unix)]
fn termination_signal(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|s| format!("SIG{}", s))
}

#[cfg(not(unix))]
fn termination_signal(_status: &std::process::ExitStatus) -> Option<String> {
    None
}

/// Read a log file for error reporting, keeping only the last `lines` lines.
pub fn log_tail(path: &Path, lines: usize) -> String {
    let content = fs::read_to_string(path).unwrap_or_default();
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spec(temp: &TempDir, script: &str) -> CommandSpec {
        CommandSpec {
            program: "bash".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: temp.path().to_path_buf(),
            env: BTreeMap::new(),
            log_path: temp.path().join("logs/run.log"),
        }
    }

    #[test]
    fn test_env_allowlist() {
        assert!(ENV_ALLOWLIST.contains(&"HOME"));
        assert!(ENV_ALLOWLIST.contains(&"PATH"));
        assert!(!ENV_ALLOWLIST.contains(&"AWS_SECRET_ACCESS_KEY"));
    }

    #[test]
    fn test_success_and_output_logged() {
        let temp = TempDir::new().unwrap();
        let spec = spec(&temp, "echo out; echo err >&2");

        let outcome = SystemRunner::new().run(&spec).unwrap();
        assert!(outcome.success());

        let log = fs::read_to_string(&spec.log_path).unwrap();
        assert!(log.contains("out\n"));
        assert!(log.contains("[stderr] err"));
    }

    #[test]
    fn test_exit_code_is_authoritative() {
        let temp = TempDir::new().unwrap();
        let outcome = SystemRunner::new()
            .run(&spec(&temp, "echo looks fine; exit 3"))
            .unwrap();

        assert!(!outcome.success());
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.describe(), "exit code 3");
    }

    #[test]
    fn test_environment_is_filtered() {
        let temp = TempDir::new().unwrap();
        std::env::set_var("RELINST_RUNNER_SECRET", "hunter2");

        let mut spec = spec(&temp, "echo \"secret=${RELINST_RUNNER_SECRET:-unset} pkg=$PKG_NAME\"");
        spec.env.insert("PKG_NAME".to_string(), "ruby".to_string());
        SystemRunner::new().run(&spec).unwrap();

        let log = fs::read_to_string(&spec.log_path).unwrap();
        assert!(log.contains("secret=unset pkg=ruby"));
    }

    #[test]
    fn test_spawn_failure() {
        let temp = TempDir::new().unwrap();
        let mut spec = spec(&temp, "");
        spec.program = "/nonexistent/relinst-shell".to_string();

        let result = SystemRunner::new().run(&spec);
        assert!(matches!(result, Err(RunnerError::Spawn { .. })));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_unwritable_log_does_not_stall_command() {
        let temp = TempDir::new().unwrap();
        let mut spec = spec(&temp, "seq 1 100000; seq 1 100000 >&2; exit 4");
        spec.log_path = PathBuf::from("/dev/full");

        let outcome = SystemRunner::new().run(&spec).unwrap();
        assert_eq!(outcome.exit_code, Some(4));
    }

    #[test]
    fn test_log_tail() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("log");
        fs::write(&path, "a\nb\nc\n").unwrap();

        assert_eq!(log_tail(&path, 2), "b\nc");
        assert_eq!(log_tail(&temp.path().join("missing"), 2), "");
    }
}

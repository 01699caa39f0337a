//! relinst CLI
//!
//! Entry point for the `relinst` command-line tool.

use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use relinst::{InstallationManifest, Installer, InstallerConfig, Target};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relinst")]
#[command(about = "Compile and install releases from source", version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to installer config (default: ~/.config/relinst/config.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and install the release described by a manifest
    Install {
        /// Installation manifest
        manifest: PathBuf,

        /// Target directory (default: derived from the manifest path)
        #[arg(long, short = 't')]
        target: Option<PathBuf>,

        /// Remove the target before installing
        #[arg(long)]
        clean: bool,

        /// Start the registry and keep it running until interrupted
        #[arg(long)]
        start_registry: bool,
    },

    /// Compile the packages the manifest's jobs need, without installing
    Compile {
        /// Installation manifest
        manifest: PathBuf,

        /// Target directory (default: derived from the manifest path)
        #[arg(long, short = 't')]
        target: Option<PathBuf>,
    },

    /// Remove an installation
    Uninstall {
        /// Installation manifest
        manifest: PathBuf,

        /// Target directory (default: derived from the manifest path)
        #[arg(long, short = 't')]
        target: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // RELINST_LOG wins over -v
    let filter = EnvFilter::try_from_env("RELINST_LOG").unwrap_or_else(|_| {
        let level = match cli.verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        };
        EnvFilter::new(format!(
            "relinst={level},relinst_index={level},relinst_blobstore={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            let mut source = e.source();
            while let Some(cause) = source {
                eprintln!("  caused by: {}", cause);
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let config = match &cli.config {
        Some(path) => InstallerConfig::load(path)?,
        None => InstallerConfig::load_default()?,
    };
    debug!(?config, "loaded installer config");

    match cli.command {
        Commands::Install {
            manifest,
            target,
            clean,
            start_registry,
        } => run_install(config, &manifest, target, clean, start_registry),
        Commands::Compile { manifest, target } => run_compile(config, &manifest, target),
        Commands::Uninstall { manifest, target } => run_uninstall(config, &manifest, target),
    }
}

fn resolve_target(config: &InstallerConfig, manifest: &Path, target: Option<PathBuf>) -> Target {
    match target {
        Some(path) => Target::new(path),
        None => config.target_for(manifest),
    }
}

fn run_install(
    config: InstallerConfig,
    manifest_path: &Path,
    target: Option<PathBuf>,
    clean: bool,
    start_registry: bool,
) -> Result<(), Box<dyn Error>> {
    let manifest = InstallationManifest::load(manifest_path)?;
    let target = resolve_target(&config, manifest_path, target);
    let installer = Installer::new(config)?;

    if clean {
        installer.uninstall(&target)?;
    }

    let mut installation = installer.install(&manifest, &target)?;

    println!(
        "Installed {} ({} {}) into {}",
        installation.name(),
        installation.release().name(),
        installation.release().version(),
        target.path().display()
    );
    for package in installation.packages().iter() {
        println!("  package {}: {}", package.name, package.record.blob_sha1);
    }
    for job in installation.jobs() {
        println!("  job {}: {}", job.name, job.path.display());
    }

    if start_registry && installation.has_registry() {
        installation.with_running_registry(|_| -> Result<(), Box<dyn Error>> {
            println!("Registry running, press Enter to stop");
            let mut line = String::new();
            std::io::stdin().read_line(&mut line)?;
            Ok(())
        })?;
    }

    Ok(())
}

fn run_compile(
    config: InstallerConfig,
    manifest_path: &Path,
    target: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    let manifest = InstallationManifest::load(manifest_path)?;
    let target = resolve_target(&config, manifest_path, target);
    let installer = Installer::new(config)?;

    let compiled = installer.compile(&manifest, &target)?;
    for package in compiled.iter() {
        println!(
            "{} {} {}",
            package.name, package.fingerprint, package.record.blob_sha1
        );
    }
    Ok(())
}

fn run_uninstall(
    config: InstallerConfig,
    manifest_path: &Path,
    target: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    let target = resolve_target(&config, manifest_path, target);
    let installer = Installer::new(config)?;
    installer.uninstall(&target)?;
    println!("Removed {}", target.path().display());
    Ok(())
}

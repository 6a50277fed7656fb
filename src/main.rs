mod backup;
mod config;
mod coordinator;
mod diff;
mod error;
mod fetcher;
mod logging;
mod manifest;
mod metadata;
mod model;
mod protocol;
mod reconcile;
mod registry;
mod resolver;
mod util;
mod version;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::coordinator::{InstallationState, PatchCoordinator};
use crate::error::PatchError;
use crate::fetcher::Credentials;
use crate::metadata::{HttpMetadata, MetadataSource};
use crate::protocol::CodePrompt;
use crate::version::PeVersionInspector;

#[derive(Parser)]
#[command(name = "downpatcher", about = "Downgrade a game installation to an earlier build and back")]
struct Cli {
    /// Path to the config file (default: ./downpatcher.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Base URL of the patch metadata service
    #[arg(long, global = true)]
    metadata_url: Option<String>,
    /// Directory for download/, manifests/, backup/ and the log file
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download the files that differ and replace them in the game directory
    Patch {
        /// Game installation directory
        #[arg(long)]
        game: PathBuf,
        /// Version to downgrade to
        #[arg(long)]
        target: u32,
        /// Account name passed to the fetcher
        #[arg(long)]
        username: String,
        /// Account password; prompted for when omitted
        #[arg(long)]
        password: Option<String>,
        /// Skip reading the version from the game executable
        #[arg(long)]
        installed_version: Option<u32>,
        /// Language depot to keep
        #[arg(long)]
        language: Option<String>,
    },
    /// Undo the last patch using the saved backup
    Restore {
        /// Game installation directory
        #[arg(long)]
        game: PathBuf,
    },
    /// Back up and apply an already downloaded file tree
    Apply {
        /// Game installation directory
        #[arg(long)]
        game: PathBuf,
        /// Downloaded tree to copy over the game directory
        #[arg(long)]
        download: PathBuf,
        /// Where to save the files about to be overwritten
        #[arg(long)]
        backup: Option<PathBuf>,
    },
    /// Print the paths that differ between two depot manifests
    Diff {
        /// Manifest of the installed build
        #[arg(long)]
        current: PathBuf,
        /// Manifest of the wanted build
        #[arg(long)]
        target: PathBuf,
    },
    /// List every known version, newest first
    Versions {
        /// Game directory used to mark the installed version
        #[arg(long)]
        game: Option<PathBuf>,
    },
}

/// Reads two-factor codes from the terminal. An empty line cancels.
struct TerminalPrompt;

impl CodePrompt for TerminalPrompt {
    fn request_code(&self) -> Option<String> {
        eprint!("Enter the two-factor code (empty to cancel): ");
        std::io::stderr().flush().ok()?;
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).ok()?;
        let code = line.trim();
        (!code.is_empty()).then(|| code.to_string())
    }
}

fn metadata_source(config: &Config) -> Result<HttpMetadata, PatchError> {
    if config.metadata_url.is_empty() {
        return Err(PatchError::Precondition(
            "no metadata service configured; set metadata_url or pass --metadata-url".into(),
        ));
    }
    HttpMetadata::new(&config.metadata_url)
}

fn installation(config: &Config, game: &Path, installed_version: Option<u32>) -> Result<InstallationState, PatchError> {
    let mut state = InstallationState::default();
    match installed_version {
        Some(version) => state.set_game_dir_with_version(game, &config.game_executable, version)?,
        None => {
            state.set_game_dir(game, &config.game_executable, &PeVersionInspector)?;
        }
    }
    Ok(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(url) = cli.metadata_url {
        config.metadata_url = url;
    }
    if let Some(dir) = cli.work_dir {
        config.work_dir = dir;
    }

    let log_guard = logging::init(&config.work_dir)?;

    match cli.command {
        Commands::Patch {
            game,
            target,
            username,
            password,
            installed_version,
            language,
        } => {
            if let Some(language) = language {
                config.language = language;
            }
            let state = installation(&config, &game, installed_version)?;
            let metadata = metadata_source(&config)?;

            println!("Patching...");
            println!("  Game: {}", game.display());
            if let Some(installed) = state.installed_version() {
                println!("  Installed: {}", installed);
            }
            println!("  Target: {}", target);

            let password = match password {
                Some(p) => p,
                None => rpassword::prompt_password(format!("Password for {username}: "))
                    .context("Failed to read password")?,
            };
            let credentials = Credentials { username, password };

            let coordinator = Arc::new(PatchCoordinator::new(
                config,
                Arc::new(metadata),
                Arc::new(TerminalPrompt),
            ));

            let start = Instant::now();
            let mut run = {
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move { coordinator.run(&state, target, credentials).await })
            };
            let mut interrupted = false;
            let result = tokio::select! {
                result = &mut run => result?,
                _ = tokio::signal::ctrl_c() => {
                    interrupted = true;
                    tracing::warn!("Interrupted during phase: {}", coordinator.phase());
                    coordinator.cancel_downloads();
                    tokio::select! {
                        result = &mut run => result?,
                        _ = tokio::signal::ctrl_c() => {
                            tracing::warn!("Interrupted again, not waiting for the run to stop");
                            Err(PatchError::Cancelled)
                        }
                    }
                }
            };
            if interrupted {
                if let Err(e) = &result {
                    // An open two-factor prompt still holds a thread blocked on stdin.
                    eprintln!("Error: {}", e.reason());
                    drop(log_guard);
                    std::process::exit(130);
                }
            }
            let report = result?;
            let elapsed = start.elapsed();

            println!("\nPatch applied successfully!");
            println!("  Depots downloaded: {}", report.depots);
            println!("  Files requested: {}", report.files_requested);
            println!("  Files backed up: {}", report.backup.files_copied);
            println!("  Files applied: {}", report.files_applied);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Restore { game } => {
            println!("Restoring...");
            println!("  Game: {}", game.display());
            println!("  Backup: {}", config.backup_dir().display());

            let start = Instant::now();
            let summary = coordinator::restore(&config, &game).await?;
            let elapsed = start.elapsed();

            println!("\nRestore finished!");
            println!("  Files removed: {}", summary.files_removed);
            println!("  Directories removed: {}", summary.dirs_removed);
            println!("  Files restored: {}", summary.files_restored);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Apply { game, download, backup } => {
            let backup = backup.unwrap_or_else(|| config.backup_dir());
            println!("Applying...");
            println!("  Game: {}", game.display());
            println!("  Download: {}", download.display());
            println!("  Backup: {}", backup.display());

            let start = Instant::now();
            let (saved, applied) = coordinator::apply_offline(&game, &download, &backup).await?;
            let elapsed = start.elapsed();

            println!("\nApplied successfully!");
            println!("  Directories backed up: {}", saved.dirs_created);
            println!("  Files backed up: {}", saved.files_copied);
            println!("  Files applied: {}", applied);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Diff { current, target } => {
            let current = manifest::read_manifest(&current)?;
            let target = manifest::read_manifest(&target)?;
            let changes = diff::classify(&current, &target);
            tracing::info!(
                modified = changes.modified.len(),
                removed = changes.removed.len(),
                extra = changes.extra.len(),
                "Compared manifest {} with {}",
                current.manifest_id,
                target.manifest_id
            );
            if changes.is_empty() {
                tracing::info!("Nothing to download");
            }
            for path in changes.changed_paths() {
                println!("{}", path);
            }
        }
        Commands::Versions { game } => {
            let installed = match game {
                Some(game) => match installation(&config, &game, None) {
                    Ok(state) => state.installed_version(),
                    Err(e) => {
                        tracing::warn!("Cannot determine installed version: {}", e);
                        None
                    }
                },
                None => None,
            };

            let history = metadata_source(&config)?.patch_history().await?;
            if history.is_empty() {
                println!("No versions published");
            }
            for record in history.records().iter().rev() {
                let marker = if Some(record.version) == installed { "*" } else { " " };
                println!(
                    "{} {:>8}  {}  {} depots",
                    marker,
                    record.version,
                    record.date.format("%Y-%m-%d"),
                    record.depots.len()
                );
            }
        }
    }

    Ok(())
}

use anyhow::Context;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backup::{self, BackupSummary};
use crate::config::Config;
use crate::error::PatchError;
use crate::fetcher::{Credentials, DepotFetcher, FETCHER_STATE_DIR};
use crate::metadata::MetadataSource;
use crate::protocol::CodePrompt;
use crate::reconcile::{self, RestoreSummary};
use crate::registry::ProcessRegistry;
use crate::resolver::{self, DepotFilter};
use crate::util;
use crate::version::{self, VersionInspector};

/// The installation being patched. Both fields are re-derived together
/// whenever the game directory is set.
#[derive(Debug, Clone, Default)]
pub struct InstallationState {
    game_dir: Option<PathBuf>,
    installed_version: Option<u32>,
}

impl InstallationState {
    /// Accept `dir` only if it holds `executable`, and read the installed
    /// version from that executable.
    pub fn set_game_dir(
        &mut self,
        dir: &Path,
        executable: &str,
        inspector: &dyn VersionInspector,
    ) -> Result<u32, PatchError> {
        self.clear();
        let exe = validate_game_dir(dir, executable)?;
        let installed = version::installed_version(inspector, &exe).map_err(|e| {
            PatchError::Precondition(format!("cannot read the version of {}: {e:#}", exe.display()))
        })?;
        self.game_dir = Some(dir.to_path_buf());
        self.installed_version = Some(installed);
        tracing::info!(version = installed, "Game directory set to {}", dir.display());
        Ok(installed)
    }

    /// Like [`set_game_dir`](Self::set_game_dir), with the version supplied by the operator.
    pub fn set_game_dir_with_version(&mut self, dir: &Path, executable: &str, installed: u32) -> Result<(), PatchError> {
        self.clear();
        validate_game_dir(dir, executable)?;
        self.game_dir = Some(dir.to_path_buf());
        self.installed_version = Some(installed);
        tracing::info!(version = installed, "Game directory set to {} (version given)", dir.display());
        Ok(())
    }

    pub fn game_dir(&self) -> Option<&Path> {
        self.game_dir.as_deref()
    }

    pub fn installed_version(&self) -> Option<u32> {
        self.installed_version
    }

    fn clear(&mut self) {
        self.game_dir = None;
        self.installed_version = None;
    }
}

fn validate_game_dir(dir: &Path, executable: &str) -> Result<PathBuf, PatchError> {
    let exe = dir.join(executable);
    if !exe.is_file() {
        return Err(PatchError::Precondition(format!(
            "{} is not a game directory: {} not found",
            dir.display(),
            executable
        )));
    }
    Ok(exe)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchPhase {
    Idle,
    ValidatingPreconditions,
    ResolvingDepots,
    Downloading,
    BackingUp,
    Applying,
    Done,
    Failed(String),
}

impl fmt::Display for PatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchPhase::Idle => write!(f, "Idle"),
            PatchPhase::ValidatingPreconditions => write!(f, "Validating preconditions"),
            PatchPhase::ResolvingDepots => write!(f, "Resolving depots"),
            PatchPhase::Downloading => write!(f, "Downloading"),
            PatchPhase::BackingUp => write!(f, "Backing up"),
            PatchPhase::Applying => write!(f, "Applying"),
            PatchPhase::Done => write!(f, "Done"),
            PatchPhase::Failed(reason) => write!(f, "Failed: {reason}"),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PatchReport {
    pub depots: usize,
    pub files_requested: usize,
    pub backup: BackupSummary,
    pub files_applied: usize,
}

/// Runs a downgrade end to end: validate, resolve, download, back up, apply.
/// Steps are strictly sequential; the first failure ends the run without
/// rolling back what already happened.
pub struct PatchCoordinator {
    config: Config,
    metadata: Arc<dyn MetadataSource>,
    prompt: Arc<dyn CodePrompt>,
    registry: Arc<ProcessRegistry>,
    phase: Mutex<PatchPhase>,
}

impl PatchCoordinator {
    pub fn new(config: Config, metadata: Arc<dyn MetadataSource>, prompt: Arc<dyn CodePrompt>) -> Self {
        Self {
            config,
            metadata,
            prompt,
            registry: ProcessRegistry::new(),
            phase: Mutex::new(PatchPhase::Idle),
        }
    }

    pub fn phase(&self) -> PatchPhase {
        self.phase.lock().clone()
    }

    /// Force-terminate every running fetcher and stop the run before its next
    /// step. Safe to call from any thread, at any phase; whatever was already
    /// written to disk stays there. Every later run of this coordinator fails
    /// with [`PatchError::Cancelled`].
    pub fn cancel_downloads(&self) -> usize {
        let cancelled = self.registry.cancel_all();
        tracing::warn!(processes = cancelled, "Cancelling downloads");
        cancelled
    }

    fn check_cancelled(&self) -> Result<(), PatchError> {
        if self.registry.is_cancelled() {
            return Err(PatchError::Cancelled);
        }
        Ok(())
    }

    /// Drive `work` unless the run is cancelled first.
    async fn unless_cancelled<T>(&self, work: impl Future<Output = Result<T, PatchError>>) -> Result<T, PatchError> {
        tokio::select! {
            biased;
            _ = self.registry.cancelled() => Err(PatchError::Cancelled),
            result = work => result,
        }
    }

    fn enter(&self, phase: PatchPhase) {
        match &phase {
            PatchPhase::Failed(_) => tracing::error!("{}", phase),
            _ => tracing::info!("{}", phase),
        }
        *self.phase.lock() = phase;
    }

    pub async fn run(
        &self,
        installation: &InstallationState,
        target: u32,
        credentials: Credentials,
    ) -> Result<PatchReport, PatchError> {
        let result = self.execute(installation, target, credentials).await;
        match &result {
            Ok(_) => self.enter(PatchPhase::Done),
            Err(e) => self.enter(PatchPhase::Failed(e.reason())),
        }
        result
    }

    async fn execute(
        &self,
        installation: &InstallationState,
        target: u32,
        credentials: Credentials,
    ) -> Result<PatchReport, PatchError> {
        self.enter(PatchPhase::ValidatingPreconditions);
        let (game_dir, installed, filter) = self.validate(installation, target, &credentials)?;

        self.enter(PatchPhase::ResolvingDepots);
        let history = self.unless_cancelled(self.metadata.patch_history()).await?;
        let manifest_dir = self.config.manifest_dir();
        util::purge_dir(&manifest_dir).map_err(PatchError::Filesystem)?;

        let fetcher = DepotFetcher::new(
            self.config.fetcher.clone(),
            self.config.app_id,
            self.config.response_timeout(),
            credentials,
            Arc::clone(&self.prompt),
            Arc::clone(&self.registry),
            manifest_dir,
        );

        let changesets = self
            .unless_cancelled(resolver::resolve(
                installed,
                target,
                &history,
                self.metadata.as_ref(),
                &fetcher,
                &filter,
            ))
            .await?;
        let mut report = PatchReport {
            depots: changesets.len(),
            files_requested: changesets.iter().map(|cs| cs.changed_paths.len()).sum(),
            ..PatchReport::default()
        };
        tracing::info!(
            depots = report.depots,
            files = report.files_requested,
            "Resolved {} -> {}",
            installed,
            target
        );

        self.enter(PatchPhase::Downloading);
        let download_dir = self.config.download_dir();
        util::purge_dir(&download_dir).map_err(PatchError::Filesystem)?;
        for changeset in &changesets {
            self.check_cancelled()?;
            fetcher
                .fetch_changeset(changeset, &download_dir)
                .await
                .map_err(|e| PatchError::from_fetch(changeset.depot_id, changeset.target_manifest_id, e))?;
        }
        remove_fetcher_state(&download_dir)?;

        let (backup, applied) = self.back_up_and_apply(game_dir, download_dir).await?;
        report.backup = backup;
        report.files_applied = applied;
        Ok(report)
    }

    fn validate(
        &self,
        installation: &InstallationState,
        target: u32,
        credentials: &Credentials,
    ) -> Result<(PathBuf, u32, DepotFilter), PatchError> {
        let game_dir = installation
            .game_dir()
            .ok_or_else(|| PatchError::Precondition("game directory is not set".into()))?;
        if !game_dir.is_dir() {
            return Err(PatchError::Precondition(format!(
                "game directory {} does not exist",
                game_dir.display()
            )));
        }
        if credentials.username.is_empty() {
            return Err(PatchError::Precondition("username is empty".into()));
        }
        if credentials.password.is_empty() {
            return Err(PatchError::Precondition("password is empty".into()));
        }
        let installed = installation
            .installed_version()
            .ok_or_else(|| PatchError::Precondition("installed version is unknown".into()))?;
        resolver::check_direction(installed, target)?;

        let filter = DepotFilter::new(
            &self.config.ignored_depots,
            &self.config.language_depots,
            &self.config.language,
        )?;
        Ok((game_dir.to_path_buf(), installed, filter))
    }

    async fn back_up_and_apply(&self, game_dir: PathBuf, download_dir: PathBuf) -> Result<(BackupSummary, usize), PatchError> {
        self.check_cancelled()?;
        self.enter(PatchPhase::BackingUp);
        let backup = back_up(game_dir.clone(), download_dir.clone(), self.config.backup_dir()).await?;

        self.check_cancelled()?;
        self.enter(PatchPhase::Applying);
        let applied = blocking(move || reconcile::apply(&download_dir, &game_dir)).await?;
        Ok((backup, applied))
    }
}

async fn back_up(game_dir: PathBuf, download_dir: PathBuf, backup_dir: PathBuf) -> Result<BackupSummary, PatchError> {
    blocking(move || backup::backup(&game_dir, &download_dir, &backup_dir)).await
}

/// Back up and apply an already downloaded tree, without contacting any service.
/// Backup completes before apply starts.
pub async fn apply_offline(
    game_dir: &Path,
    download_dir: &Path,
    backup_dir: &Path,
) -> Result<(BackupSummary, usize), PatchError> {
    for (label, dir) in [("game directory", game_dir), ("download directory", download_dir)] {
        if !dir.is_dir() {
            return Err(PatchError::Precondition(format!("{label} {} does not exist", dir.display())));
        }
    }
    let backup = back_up(game_dir.to_path_buf(), download_dir.to_path_buf(), backup_dir.to_path_buf()).await?;
    let (game, download) = (game_dir.to_path_buf(), download_dir.to_path_buf());
    let applied = blocking(move || reconcile::apply(&download, &game)).await?;
    Ok((backup, applied))
}

/// Undo the last apply using the work directory's download and backup trees.
pub async fn restore(config: &Config, game_dir: &Path) -> Result<RestoreSummary, PatchError> {
    validate_game_dir(game_dir, &config.game_executable)?;
    let game = game_dir.to_path_buf();
    let download = config.download_dir();
    let backup_dir = config.backup_dir();
    blocking(move || reconcile::restore(&game, &download, &backup_dir)).await
}

fn remove_fetcher_state(download_dir: &Path) -> Result<(), PatchError> {
    let state = download_dir.join(FETCHER_STATE_DIR);
    if state.exists() {
        std::fs::remove_dir_all(&state)
            .with_context(|| format!("Failed to remove fetcher state: {}", state.display()))
            .map_err(PatchError::Filesystem)?;
    }
    Ok(())
}

async fn blocking<T, F>(f: F) -> Result<T, PatchError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, PatchError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PatchError::Filesystem(anyhow::Error::new(e)))?
}

use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use walkdir::WalkDir;

use crate::error::{FetchError, ManifestError, PatchError};
use crate::manifest;
use crate::model::{ChangeSet, Manifest};
use crate::protocol::{CodePrompt, Handshake};
use crate::registry::ProcessRegistry;
use crate::resolver::ManifestSource;

/// Private bookkeeping directory the fetcher leaves inside its destination.
pub const FETCHER_STATE_DIR: &str = ".DepotDownloader";

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One invocation of the fetcher.
struct FetchRequest<'a> {
    depot_id: u32,
    manifest_id: u64,
    dest: &'a Path,
    filelist: Option<&'a Path>,
    manifest_only: bool,
}

/// Drives the external content fetcher, one depot at a time.
pub struct DepotFetcher {
    command: Vec<String>,
    app_id: u32,
    timeout: Duration,
    credentials: Credentials,
    prompt: Arc<dyn CodePrompt>,
    registry: Arc<ProcessRegistry>,
    manifest_dir: PathBuf,
}

impl DepotFetcher {
    pub fn new(
        command: Vec<String>,
        app_id: u32,
        timeout: Duration,
        credentials: Credentials,
        prompt: Arc<dyn CodePrompt>,
        registry: Arc<ProcessRegistry>,
        manifest_dir: PathBuf,
    ) -> Self {
        Self {
            command,
            app_id,
            timeout,
            credentials,
            prompt,
            registry,
            manifest_dir,
        }
    }

    /// Download exactly the changed paths of one depot into `dest`.
    /// The filelist is a temporary file removed when this returns.
    pub async fn fetch_changeset(&self, changeset: &ChangeSet, dest: &Path) -> Result<(), FetchError> {
        let mut filelist = tempfile::Builder::new()
            .prefix(&format!("filelist_{}_", changeset.depot_id))
            .suffix(".txt")
            .tempfile()?;
        filelist.write_all(changeset.filelist().as_bytes())?;
        filelist.flush()?;

        tracing::info!(
            depot_id = changeset.depot_id,
            manifest_id = changeset.target_manifest_id,
            files = changeset.changed_paths.len(),
            "Downloading depot"
        );

        self.run(FetchRequest {
            depot_id: changeset.depot_id,
            manifest_id: changeset.target_manifest_id,
            dest,
            filelist: Some(filelist.path()),
            manifest_only: false,
        })
        .await
    }

    /// Download only the manifest of one depot build into `dest`.
    pub async fn fetch_manifest_only(&self, depot_id: u32, manifest_id: u64, dest: &Path) -> Result<(), FetchError> {
        tracing::info!(depot_id, manifest_id, "Downloading manifest");
        self.run(FetchRequest {
            depot_id,
            manifest_id,
            dest,
            filelist: None,
            manifest_only: true,
        })
        .await
    }

    fn arguments(&self, req: &FetchRequest<'_>) -> Vec<String> {
        let mut args = vec![
            "-app".to_string(),
            self.app_id.to_string(),
            "-depot".to_string(),
            req.depot_id.to_string(),
            "-manifest".to_string(),
            req.manifest_id.to_string(),
            "-username".to_string(),
            self.credentials.username.clone(),
            "-dir".to_string(),
            req.dest.display().to_string(),
        ];
        if let Some(filelist) = req.filelist {
            args.push("-filelist".to_string());
            args.push(filelist.display().to_string());
        }
        if req.manifest_only {
            args.push("-manifest-only".to_string());
        }
        args
    }

    async fn run(&self, req: FetchRequest<'_>) -> Result<(), FetchError> {
        if self.registry.is_cancelled() {
            tracing::warn!(
                depot_id = req.depot_id,
                manifest_id = req.manifest_id,
                "Not starting fetcher, run cancelled"
            );
            return Err(FetchError::Cancelled);
        }

        let (program, lead) = self.command.split_first().ok_or_else(|| FetchError::Spawn {
            program: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "fetcher command is empty"),
        })?;

        let mut command = Command::new(program);
        command
            .args(lead)
            .args(self.arguments(&req))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| FetchError::Spawn {
            program: program.clone(),
            source,
        })?;

        // Registered before anything is awaited; the guard deregisters on every exit path.
        let registration = self
            .registry
            .register_process(format!("depot {} manifest {}", req.depot_id, req.manifest_id), child.id());

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("fetcher stdout not captured"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("fetcher stdin not captured"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!(target: "fetcher", "{}", line);
                }
            });
        }

        let mut handshake = Handshake::new(
            stdout,
            stdin,
            self.timeout,
            self.credentials.password.clone(),
            Arc::clone(&self.prompt),
        );

        let session = async {
            handshake.login().await?;
            tracing::info!(depot_id = req.depot_id, "Fetcher logged in");
            handshake.drain().await
        };

        let outcome = tokio::select! {
            result = session => result,
            _ = registration.cancelled() => Err(FetchError::Cancelled),
        };
        drop(handshake);

        if let Err(err) = outcome {
            if let Err(kill_err) = child.kill().await {
                tracing::debug!("Fetcher already exited: {}", kill_err);
            }
            return Err(err);
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(FetchError::ExitStatus(status));
        }
        Ok(())
    }
}

/// Find `manifest_<depot>_<manifest>.txt` anywhere below `dir`.
pub fn locate_manifest(dir: &Path, depot_id: u32, manifest_id: u64) -> Option<PathBuf> {
    let name = format!("manifest_{depot_id}_{manifest_id}.txt");
    let direct = dir.join(&name);
    if direct.is_file() {
        return Some(direct);
    }
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .find(|e| e.file_type().is_file() && e.file_name().to_str() == Some(name.as_str()))
        .map(|e| e.into_path())
}

#[async_trait]
impl ManifestSource for DepotFetcher {
    async fn manifest(&self, depot_id: u32, manifest_id: u64) -> Result<Manifest, PatchError> {
        self.fetch_manifest_only(depot_id, manifest_id, &self.manifest_dir)
            .await
            .map_err(|e| PatchError::from_fetch(depot_id, manifest_id, e))?;

        let path = locate_manifest(&self.manifest_dir, depot_id, manifest_id).ok_or_else(|| {
            PatchError::ManifestParse {
                depot_id,
                source: ManifestError::Read {
                    path: self
                        .manifest_dir
                        .join(format!("manifest_{depot_id}_{manifest_id}.txt"))
                        .display()
                        .to_string(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                },
            }
        })?;

        let manifest = manifest::read_manifest(&path).map_err(|source| PatchError::ManifestParse { depot_id, source })?;
        tracing::info!(
            depot_id,
            manifest_id,
            date = %manifest.date,
            files = manifest.files.len(),
            chunks = manifest.declared_chunk_count,
            bytes = manifest.size_on_disk,
            compressed = manifest.size_compressed,
            "Parsed manifest"
        );
        Ok(manifest)
    }
}

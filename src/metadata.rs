use async_trait::async_trait;
use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::PatchError;
use crate::model::{PatchHistory, PatchRecord};

/// Read-only source of patch history and pre-published per-version filelists.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Every known patch for the app, sorted ascending by version.
    async fn patch_history(&self) -> Result<PatchHistory, PatchError>;

    /// Paths changed by patch `version` in `depot_id`, relative to the patch before it.
    /// `None` when the service has no filelist for that pair.
    async fn filelist(&self, version: u32, depot_id: u32) -> Result<Option<BTreeSet<String>>, PatchError>;
}

/// HTTP client for the metadata service.
///
/// Layout below the base URL: `patches.json` and `<version>/<depot_id>.txt`.
pub struct HttpMetadata {
    base_url: String,
    http: reqwest::Client,
}

impl HttpMetadata {
    pub fn new(base_url: &str) -> Result<Self, PatchError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("downpatcher/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PatchError::Transport(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, PatchError> {
        let url = format!("{}/{}", self.base_url, path);
        tracing::debug!("GET {}", url);
        self.http
            .get(&url)
            .send()
            .await
            .map_err(|e| PatchError::Transport(format!("{url}: {e}")))
    }
}

#[async_trait]
impl MetadataSource for HttpMetadata {
    async fn patch_history(&self) -> Result<PatchHistory, PatchError> {
        let response = self.get("patches.json").await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PatchError::Transport(format!(
                "patch list request returned {status}"
            )));
        }

        let records: Vec<PatchRecord> = response
            .json()
            .await
            .map_err(|e| PatchError::Transport(format!("invalid patch list: {e}")))?;
        tracing::info!("Fetched {} patches from metadata service", records.len());
        Ok(PatchHistory::new(records))
    }

    async fn filelist(&self, version: u32, depot_id: u32) -> Result<Option<BTreeSet<String>>, PatchError> {
        let response = self.get(&format!("{version}/{depot_id}.txt")).await?;
        if !response.status().is_success() {
            tracing::debug!(
                version,
                depot_id,
                status = %response.status(),
                "No published filelist"
            );
            return Ok(None);
        }

        let text = response
            .text()
            .await
            .map_err(|e| PatchError::Transport(format!("filelist {version}/{depot_id}: {e}")))?;
        Ok(Some(parse_filelist(&text)))
    }
}

/// Newline-separated relative paths; blank lines ignored, separators normalised.
pub fn parse_filelist(text: &str) -> BTreeSet<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| line.replace('\\', "/"))
        .collect()
}

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "downpatcher.toml";

/// Settings loaded from `downpatcher.toml`. Every key is optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub app_id: u32,
    /// Base URL serving `patches.json` and `<version>/<depot>.txt` filelists.
    /// Has no default; must come from the file or `--metadata-url`.
    pub metadata_url: String,
    /// Program and leading arguments used to start the content fetcher.
    pub fetcher: Vec<String>,
    /// File that must exist in a directory for it to count as a game install.
    pub game_executable: String,
    /// Holds `download/`, `manifests/`, `backup/` and the log file.
    pub work_dir: PathBuf,
    pub response_timeout_secs: u64,
    pub ignored_depots: Vec<u32>,
    pub language_depots: BTreeMap<String, u32>,
    pub language: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_id: 813780,
            metadata_url: String::new(),
            fetcher: vec!["DepotDownloader".to_string()],
            game_executable: "AoE2DE_s.exe".to_string(),
            work_dir: PathBuf::from("."),
            response_timeout_secs: 30,
            ignored_depots: vec![
                228987,  // VC 2017 redistributable
                228990,  // DirectX
                1039811, // encrypted DLC
                1022220, // enhanced graphics
                1022226, // soundtrack
                1039810, // soundtrack
            ],
            language_depots: [
                ("br", 813785),
                ("de", 813786),
                ("en", 813787),
                ("fr", 813788),
                ("it", 813789),
                ("ko", 1022221),
                ("mx", 1022222),
                ("zh", 1022223),
                ("zh-hant", 1022224),
                ("es", 1022225),
            ]
            .into_iter()
            .map(|(code, depot)| (code.to_string(), depot))
            .collect(),
            language: "en".to_string(),
        }
    }
}

impl Config {
    /// Load from `path`, or from `downpatcher.toml` in the current directory.
    /// A missing default file yields defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        if !explicit && !path.exists() {
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&text)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn download_dir(&self) -> PathBuf {
        self.work_dir.join("download")
    }

    pub fn manifest_dir(&self) -> PathBuf {
        self.work_dir.join("manifests")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.work_dir.join("backup")
    }
}

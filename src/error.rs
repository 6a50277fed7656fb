use thiserror::Error;

/// Failure while parsing a fetcher text manifest. Any of these aborts the run.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("line {line}: expected {expected}, found {found:?}")]
    UnexpectedLine {
        line: usize,
        expected: &'static str,
        found: String,
    },
    #[error("line {line}: invalid number in {field}: {value:?}")]
    InvalidNumber {
        line: usize,
        field: &'static str,
        value: String,
    },
    #[error("line {line}: duplicate file row for {path:?}")]
    DuplicatePath { line: usize, path: String },
    #[error("manifest ended before {0}")]
    Truncated(&'static str),
    #[error("failed to read manifest {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of a single fetcher invocation that did not end in success.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetcher exited before logging in")]
    ConnectionError,
    #[error("invalid two-factor authentication code")]
    InvalidCode,
    #[error("no response from fetcher within {secs}s while {state}")]
    Timeout { state: &'static str, secs: u64 },
    #[error("failed to start fetcher `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o error talking to fetcher")]
    Io(#[from] std::io::Error),
    #[error("fetcher exited with {0}")]
    ExitStatus(std::process::ExitStatus),
    #[error("fetcher was cancelled")]
    Cancelled,
}

impl FetchError {
    /// Credentials or two-factor failures, as opposed to transport or process problems.
    pub fn is_authentication(&self) -> bool {
        matches!(self, FetchError::InvalidCode | FetchError::ConnectionError)
    }
}

/// Every failure the coordinator can report. Nothing below the coordinator
/// decides whether a run continues; errors are wrapped and raised to it.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("{0}")]
    Precondition(String),
    #[error("version {0} is already installed")]
    AlreadyInstalled(u32),
    #[error("cannot patch forward from {installed} to {target}; only downgrades are supported")]
    ForwardPatchUnsupported { installed: u32, target: u32 },
    #[error("no documented downgrade path: {0}")]
    UnsupportedDowngrade(String),
    #[error("authentication failed for depot {depot_id}")]
    Authentication {
        depot_id: u32,
        #[source]
        source: FetchError,
    },
    #[error("download of depot {depot_id} manifest {manifest_id} failed")]
    Fetch {
        depot_id: u32,
        manifest_id: u64,
        #[source]
        source: FetchError,
    },
    #[error("metadata service request failed: {0}")]
    Transport(String),
    #[error("malformed manifest for depot {depot_id}")]
    ManifestParse {
        depot_id: u32,
        #[source]
        source: ManifestError,
    },
    #[error("backup failed")]
    Backup(#[source] anyhow::Error),
    #[error("filesystem operation failed")]
    Filesystem(#[source] anyhow::Error),
    #[error("downloads were cancelled")]
    Cancelled,
}

impl PatchError {
    /// The message followed by each of its causes, separated by `: `.
    pub fn reason(&self) -> String {
        let mut reason = self.to_string();
        let mut cause = std::error::Error::source(self);
        while let Some(err) = cause {
            reason.push_str(": ");
            reason.push_str(&err.to_string());
            cause = std::error::Error::source(err);
        }
        reason
    }

    /// Wrap a fetcher failure for one depot, keeping authentication failures distinct.
    pub fn from_fetch(depot_id: u32, manifest_id: u64, source: FetchError) -> Self {
        match source {
            FetchError::Cancelled => PatchError::Cancelled,
            source if source.is_authentication() => PatchError::Authentication { depot_id, source },
            source => PatchError::Fetch {
                depot_id,
                manifest_id,
                source,
            },
        }
    }
}

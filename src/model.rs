use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One content unit's exact build at a given patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepotRef {
    pub depot_id: u32,
    pub manifest_id: u64,
}

/// A published game patch. Depot lists of consecutive records are positionally
/// comparable: the same index refers to the same logical depot slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchRecord {
    pub version: u32,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub date: DateTime<Utc>,
    pub depots: Vec<DepotRef>,
}

/// Every known patch, sorted ascending by version.
#[derive(Debug, Clone, Default)]
pub struct PatchHistory {
    records: Vec<PatchRecord>,
}

impl PatchHistory {
    pub fn new(mut records: Vec<PatchRecord>) -> Self {
        records.sort_by_key(|r| r.version);
        records.dedup_by_key(|r| r.version);
        Self { records }
    }

    pub fn records(&self) -> &[PatchRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, version: u32) -> Option<&PatchRecord> {
        self.records
            .binary_search_by_key(&version, |r| r.version)
            .ok()
            .map(|i| &self.records[i])
    }

    /// Records with `lower <= version <= upper`, ascending.
    pub fn chain(&self, lower: u32, upper: u32) -> Vec<&PatchRecord> {
        self.records
            .iter()
            .filter(|r| r.version >= lower && r.version <= upper)
            .collect()
    }
}

/// A dated snapshot of every file in one depot at one build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub depot_id: u32,
    pub manifest_id: u64,
    pub date: NaiveDateTime,
    pub declared_file_count: u64,
    pub declared_chunk_count: u64,
    pub size_on_disk: u64,
    pub size_compressed: u64,
    /// relative path -> declared content hash, trusted verbatim
    pub files: BTreeMap<String, String>,
}

impl Manifest {
    /// (path, hash) pairs, the unit the diff engine's set difference operates on.
    pub fn entries(&self) -> BTreeSet<(&str, &str)> {
        self.files
            .iter()
            .map(|(path, hash)| (path.as_str(), hash.as_str()))
            .collect()
    }
}

/// The paths that must be fetched for one depot to reach the target build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub depot_id: u32,
    pub target_manifest_id: u64,
    pub changed_paths: BTreeSet<String>,
}

impl ChangeSet {
    /// Newline-separated filelist in the format the fetcher consumes.
    pub fn filelist(&self) -> String {
        let mut out = String::new();
        for path in &self.changed_paths {
            out.push_str(path);
            out.push('\n');
        }
        out
    }
}

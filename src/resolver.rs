use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};

use crate::diff;
use crate::error::PatchError;
use crate::metadata::MetadataSource;
use crate::model::{ChangeSet, DepotRef, Manifest, PatchHistory, PatchRecord};

/// Supplies full manifests when no published filelist covers a depot.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn manifest(&self, depot_id: u32, manifest_id: u64) -> Result<Manifest, PatchError>;
}

/// Which depots take part in a run at all.
#[derive(Debug, Clone, Default)]
pub struct DepotFilter {
    excluded: BTreeSet<u32>,
}

impl DepotFilter {
    /// Exclude `ignored` depots and every language depot except the one for `language`.
    pub fn new(
        ignored: &[u32],
        language_depots: &BTreeMap<String, u32>,
        language: &str,
    ) -> Result<Self, PatchError> {
        let keep = language_depots.get(language).copied().ok_or_else(|| {
            let known: Vec<&str> = language_depots.keys().map(String::as_str).collect();
            PatchError::Precondition(format!(
                "unknown language '{language}', expected one of: {}",
                known.join(", ")
            ))
        })?;

        let mut excluded: BTreeSet<u32> = ignored.iter().copied().collect();
        excluded.extend(language_depots.values().copied().filter(|&d| d != keep));
        Ok(Self { excluded })
    }

    pub fn allows(&self, depot_id: u32) -> bool {
        !self.excluded.contains(&depot_id)
    }
}

/// Only backward patches are supported.
pub fn check_direction(installed: u32, target: u32) -> Result<(), PatchError> {
    if installed == target {
        return Err(PatchError::AlreadyInstalled(installed));
    }
    if target > installed {
        return Err(PatchError::ForwardPatchUnsupported { installed, target });
    }
    Ok(())
}

/// Build one change set per depot that has to move from `installed` to `target`.
///
/// Depot slots are paired by position between the two bounding patches. A slot
/// whose depot id differs between them is skipped with a warning. Published
/// filelists are unioned across every step of the span; if any step is
/// undocumented, that depot falls back to diffing both full manifests.
pub async fn resolve(
    installed: u32,
    target: u32,
    history: &PatchHistory,
    metadata: &dyn MetadataSource,
    manifests: &dyn ManifestSource,
    filter: &DepotFilter,
) -> Result<Vec<ChangeSet>, PatchError> {
    check_direction(installed, target)?;

    let current = history.get(installed).ok_or_else(|| {
        PatchError::UnsupportedDowngrade(format!(
            "installed version {installed} is not in the patch history"
        ))
    })?;
    let wanted = history.get(target).ok_or_else(|| {
        PatchError::UnsupportedDowngrade(format!(
            "target version {target} is not in the patch history"
        ))
    })?;
    let chain = history.chain(target, installed);

    let mut changesets = Vec::new();

    for (slot, (cur, tgt)) in current.depots.iter().zip(&wanted.depots).enumerate() {
        if cur.depot_id != tgt.depot_id {
            tracing::warn!(
                slot,
                current = cur.depot_id,
                target = tgt.depot_id,
                "Depot changed between versions, skipping"
            );
            continue;
        }
        let depot_id = tgt.depot_id;

        if !filter.allows(depot_id) {
            tracing::debug!(depot_id, "Depot excluded by filter");
            continue;
        }

        if cur.manifest_id == tgt.manifest_id {
            tracing::debug!(depot_id, "Depot unchanged between versions");
            continue;
        }

        let changed_paths = match documented_changes(slot, depot_id, &chain, metadata).await? {
            Some(paths) => {
                tracing::info!(depot_id, files = paths.len(), "Using published filelists");
                paths
            }
            None => {
                tracing::info!(depot_id, "Filelist undocumented, diffing manifests");
                manifest_changes(cur, tgt, manifests).await?
            }
        };

        if changed_paths.is_empty() {
            tracing::debug!(depot_id, "No file differences");
            continue;
        }

        changesets.push(ChangeSet {
            depot_id,
            target_manifest_id: tgt.manifest_id,
            changed_paths,
        });
    }

    Ok(changesets)
}

/// Union of the published filelists for every step in `chain` where this slot's
/// manifest changed. `None` as soon as one such step is undocumented or the
/// slot holds a different depot somewhere in between.
async fn documented_changes(
    slot: usize,
    depot_id: u32,
    chain: &[&PatchRecord],
    metadata: &dyn MetadataSource,
) -> Result<Option<BTreeSet<String>>, PatchError> {
    let mut union = BTreeSet::new();

    // Walk newest first: installed -> ... -> target.
    for pair in chain.windows(2).rev() {
        let (older, newer) = (pair[0], pair[1]);
        let (Some(before), Some(after)) = (older.depots.get(slot), newer.depots.get(slot)) else {
            return Ok(None);
        };
        if before.depot_id != depot_id || after.depot_id != depot_id {
            return Ok(None);
        }
        if before.manifest_id == after.manifest_id {
            continue;
        }

        match metadata.filelist(newer.version, depot_id).await? {
            Some(paths) => union.extend(paths),
            None => {
                tracing::debug!(depot_id, version = newer.version, "Step undocumented");
                return Ok(None);
            }
        }
    }

    Ok(Some(union))
}

async fn manifest_changes(
    current: &DepotRef,
    target: &DepotRef,
    manifests: &dyn ManifestSource,
) -> Result<BTreeSet<String>, PatchError> {
    let current_manifest = manifests.manifest(current.depot_id, current.manifest_id).await?;
    let target_manifest = manifests.manifest(target.depot_id, target.manifest_id).await?;
    Ok(diff::diff(&current_manifest, &target_manifest))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{DateTime, NaiveDateTime};
    use std::collections::HashMap;
    use std::sync::Mutex;

    pub(crate) struct FakeMetadata {
        pub history: Vec<PatchRecord>,
        pub filelists: HashMap<(u32, u32), Vec<&'static str>>,
    }

    #[async_trait]
    impl MetadataSource for FakeMetadata {
        async fn patch_history(&self) -> Result<PatchHistory, PatchError> {
            Ok(PatchHistory::new(self.history.clone()))
        }

        async fn filelist(&self, version: u32, depot_id: u32) -> Result<Option<BTreeSet<String>>, PatchError> {
            Ok(self
                .filelists
                .get(&(version, depot_id))
                .map(|paths| paths.iter().map(|p| p.to_string()).collect()))
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeManifests {
        pub manifests: HashMap<u64, Vec<(&'static str, &'static str)>>,
        pub requested: Mutex<Vec<(u32, u64)>>,
    }

    #[async_trait]
    impl ManifestSource for FakeManifests {
        async fn manifest(&self, depot_id: u32, manifest_id: u64) -> Result<Manifest, PatchError> {
            self.requested.lock().unwrap().push((depot_id, manifest_id));
            let files = self.manifests.get(&manifest_id).cloned().unwrap_or_default();
            Ok(Manifest {
                depot_id,
                manifest_id,
                date: NaiveDateTime::default(),
                declared_file_count: files.len() as u64,
                declared_chunk_count: 0,
                size_on_disk: 0,
                size_compressed: 0,
                files: files
                    .into_iter()
                    .map(|(p, h)| (p.to_string(), h.to_string()))
                    .collect(),
            })
        }
    }

    pub(crate) fn record(version: u32, depots: &[(u32, u64)]) -> PatchRecord {
        PatchRecord {
            version,
            date: DateTime::from_timestamp(1_600_000_000 + i64::from(version), 0).unwrap(),
            depots: depots
                .iter()
                .map(|&(depot_id, manifest_id)| DepotRef {
                    depot_id,
                    manifest_id,
                })
                .collect(),
        }
    }

    /// Three depot slots that change at every patch.
    pub(crate) fn three_patch_history() -> Vec<PatchRecord> {
        vec![
            record(100, &[(1, 11), (2, 21), (3, 31)]),
            record(200, &[(1, 12), (2, 22), (3, 32)]),
            record(300, &[(1, 13), (2, 23), (3, 33)]),
        ]
    }

    fn documented(history: Vec<PatchRecord>) -> FakeMetadata {
        let mut filelists = HashMap::new();
        for depot in 1..=3 {
            filelists.insert((300, depot), vec!["common.dat", "v300.dat"]);
            filelists.insert((200, depot), vec!["common.dat", "v200.dat"]);
        }
        FakeMetadata { history, filelists }
    }

    fn set(paths: &[&str]) -> BTreeSet<String> {
        paths.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_direction() {
        assert!(matches!(check_direction(5, 5), Err(PatchError::AlreadyInstalled(5))));
        assert!(matches!(
            check_direction(5, 6),
            Err(PatchError::ForwardPatchUnsupported { installed: 5, target: 6 })
        ));
        assert!(check_direction(6, 5).is_ok());
    }

    #[test]
    fn test_filter_keeps_selected_language() {
        let languages: BTreeMap<String, u32> =
            [("en".to_string(), 10), ("de".to_string(), 11)].into_iter().collect();
        let filter = DepotFilter::new(&[99], &languages, "de").unwrap();
        assert!(filter.allows(11));
        assert!(!filter.allows(10));
        assert!(!filter.allows(99));
        assert!(filter.allows(1));
        assert!(matches!(
            DepotFilter::new(&[], &languages, "xx"),
            Err(PatchError::Precondition(_))
        ));
    }

    #[tokio::test]
    async fn test_same_version_already_installed() {
        let meta = documented(three_patch_history());
        let history = PatchHistory::new(meta.history.clone());
        let result = resolve(200, 200, &history, &meta, &FakeManifests::default(), &DepotFilter::default()).await;
        assert!(matches!(result, Err(PatchError::AlreadyInstalled(200))));
    }

    #[tokio::test]
    async fn test_forward_unsupported() {
        let meta = documented(three_patch_history());
        let history = PatchHistory::new(meta.history.clone());
        let result = resolve(100, 300, &history, &meta, &FakeManifests::default(), &DepotFilter::default()).await;
        assert!(matches!(result, Err(PatchError::ForwardPatchUnsupported { .. })));
    }

    #[tokio::test]
    async fn test_unknown_installed_version() {
        let meta = documented(three_patch_history());
        let history = PatchHistory::new(meta.history.clone());
        let result = resolve(250, 100, &history, &meta, &FakeManifests::default(), &DepotFilter::default()).await;
        assert!(matches!(result, Err(PatchError::UnsupportedDowngrade(_))));
    }

    #[tokio::test]
    async fn test_documented_span_is_unioned() {
        let meta = documented(three_patch_history());
        let history = PatchHistory::new(meta.history.clone());
        let manifests = FakeManifests::default();

        let sets = resolve(300, 100, &history, &meta, &manifests, &DepotFilter::default())
            .await
            .unwrap();

        assert_eq!(sets.len(), 3);
        for (cs, (depot, manifest)) in sets.iter().zip([(1, 11), (2, 21), (3, 31)]) {
            assert_eq!(cs.depot_id, depot);
            assert_eq!(cs.target_manifest_id, manifest);
            assert_eq!(cs.changed_paths, set(&["common.dat", "v200.dat", "v300.dat"]));
        }
        assert!(manifests.requested.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_undocumented_step_falls_back_for_that_depot_only() {
        let mut meta = documented(three_patch_history());
        meta.filelists.remove(&(200, 2));
        let history = PatchHistory::new(meta.history.clone());

        let mut manifests = FakeManifests::default();
        manifests.manifests.insert(23, vec![("a.dat", "new"), ("only_new.dat", "x"), ("same.dat", "s")]);
        manifests.manifests.insert(21, vec![("a.dat", "old"), ("only_old.dat", "y"), ("same.dat", "s")]);

        let sets = resolve(300, 100, &history, &meta, &manifests, &DepotFilter::default())
            .await
            .unwrap();

        assert_eq!(sets.len(), 3);
        assert_eq!(sets[0].changed_paths, set(&["common.dat", "v200.dat", "v300.dat"]));
        assert_eq!(sets[1].depot_id, 2);
        assert_eq!(sets[1].target_manifest_id, 21);
        assert_eq!(sets[1].changed_paths, set(&["a.dat", "only_old.dat"]));
        assert_eq!(sets[2].changed_paths, set(&["common.dat", "v200.dat", "v300.dat"]));
        assert_eq!(*manifests.requested.lock().unwrap(), vec![(2, 23), (2, 21)]);
    }

    #[tokio::test]
    async fn test_rotated_depot_is_skipped() {
        let mut history = three_patch_history();
        history[0].depots[2].depot_id = 4;
        let meta = documented(history);
        let history = PatchHistory::new(meta.history.clone());

        let sets = resolve(300, 100, &history, &meta, &FakeManifests::default(), &DepotFilter::default())
            .await
            .unwrap();
        let depots: Vec<u32> = sets.iter().map(|cs| cs.depot_id).collect();
        assert_eq!(depots, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_unchanged_depot_dropped_and_static_steps_skipped() {
        let history = vec![
            record(100, &[(1, 11), (2, 21)]),
            record(200, &[(1, 12), (2, 21)]),
            record(300, &[(1, 12), (2, 21)]),
        ];
        // Only the 100 -> 200 step changed depot 1; no filelist exists for 300.
        let mut filelists = HashMap::new();
        filelists.insert((200, 1), vec!["x.dat"]);
        let meta = FakeMetadata { history, filelists };
        let history = PatchHistory::new(meta.history.clone());

        let sets = resolve(300, 100, &history, &meta, &FakeManifests::default(), &DepotFilter::default())
            .await
            .unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].depot_id, 1);
        assert_eq!(sets[0].changed_paths, set(&["x.dat"]));
    }

    #[tokio::test]
    async fn test_filtered_depots_not_resolved() {
        let meta = documented(three_patch_history());
        let history = PatchHistory::new(meta.history.clone());
        let languages: BTreeMap<String, u32> =
            [("en".to_string(), 2), ("de".to_string(), 3)].into_iter().collect();
        let filter = DepotFilter::new(&[1], &languages, "de").unwrap();

        let sets = resolve(300, 100, &history, &meta, &FakeManifests::default(), &filter)
            .await
            .unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].depot_id, 3);
    }
}

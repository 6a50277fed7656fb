use std::collections::BTreeSet;

use crate::model::Manifest;

/// Classified difference between an installed manifest and a target manifest.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ManifestDiff {
    /// In both manifests under the same name with a different hash.
    pub modified: BTreeSet<String>,
    /// In the target but missing from the installed build; must be fetched back.
    pub removed: BTreeSet<String>,
    /// Only in the installed build. Left alone on disk, never fetched.
    pub extra: BTreeSet<String>,
}

impl ManifestDiff {
    /// Paths the fetcher has to download: modified plus removed.
    pub fn changed_paths(&self) -> BTreeSet<String> {
        self.modified.union(&self.removed).cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.removed.is_empty()
    }
}

/// Classify every path that differs between `current` and `target`.
///
/// The set difference runs on (name, hash) pairs but classification is by name,
/// so a changed hash is one modification and never an add plus a remove.
pub fn classify(current: &Manifest, target: &Manifest) -> ManifestDiff {
    if current.manifest_id == target.manifest_id {
        return ManifestDiff::default();
    }

    let current_entries = current.entries();
    let target_entries = target.entries();

    // A = target - current, B = current - target
    let a_names: BTreeSet<&str> = target_entries
        .difference(&current_entries)
        .map(|(path, _)| *path)
        .collect();
    let b_names: BTreeSet<&str> = current_entries
        .difference(&target_entries)
        .map(|(path, _)| *path)
        .collect();

    let mut diff = ManifestDiff::default();
    for path in &a_names {
        if b_names.contains(path) {
            diff.modified.insert(path.to_string());
        } else {
            diff.removed.insert(path.to_string());
        }
    }
    diff.extra = b_names
        .difference(&a_names)
        .map(|path| path.to_string())
        .collect();
    diff
}

/// The minimal filelist needed to move `current` to `target`.
/// Empty when both manifests are the same build.
pub fn diff(current: &Manifest, target: &Manifest) -> BTreeSet<String> {
    classify(current, target).changed_paths()
}

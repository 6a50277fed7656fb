use anyhow::{Context, Result};
use rayon::prelude::*;
use std::path::{Path, PathBuf};

use crate::error::PatchError;
use crate::util::{self, EntryKind};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BackupSummary {
    pub dirs_created: usize,
    pub files_copied: usize,
}

/// Snapshot every live entry that the incoming tree is about to overwrite.
///
/// `backup_dir` is purged first. Only names present in both `game_dir` and
/// `incoming_dir` are copied, mirroring the directory structure, so a later
/// restore touches exactly what apply touched. A failed copy leaves the partial
/// snapshot in place.
pub fn backup(game_dir: &Path, incoming_dir: &Path, backup_dir: &Path) -> Result<BackupSummary, PatchError> {
    snapshot(game_dir, incoming_dir, backup_dir).map_err(PatchError::Backup)
}

fn snapshot(game_dir: &Path, incoming_dir: &Path, backup_dir: &Path) -> Result<BackupSummary> {
    util::purge_dir(backup_dir)?;

    let incoming = util::walk_directory(incoming_dir)?;

    let mut dirs: Vec<String> = Vec::new();
    let mut copies: Vec<(PathBuf, PathBuf)> = Vec::new();

    for entry in &incoming {
        let live = game_dir.join(&entry.relative_path);
        let Ok(meta) = std::fs::symlink_metadata(&live) else {
            continue;
        };
        let saved = backup_dir.join(&entry.relative_path);

        match (&entry.kind, meta.is_dir()) {
            // Shared directory: mirror it; its shared children are visited on their own.
            (EntryKind::Dir, true) => dirs.push(entry.relative_path.clone()),
            // Shared name with a file on the live side, or a live directory about to be
            // replaced by a file: keep the whole live entry.
            _ => copies.push((live, saved)),
        }
    }

    util::sort_dirs_parent_first(&mut dirs);
    for dir in &dirs {
        let full = backup_dir.join(dir);
        std::fs::create_dir_all(&full)
            .with_context(|| format!("Failed to create backup directory: {}", full.display()))?;
    }

    let files_copied = copies
        .par_iter()
        .map(|(live, saved)| util::copy_entry(live, saved))
        .collect::<Result<Vec<usize>>>()?
        .into_iter()
        .sum();

    let summary = BackupSummary {
        dirs_created: dirs.len(),
        files_copied,
    };
    tracing::info!(
        dirs = summary.dirs_created,
        files = summary.files_copied,
        "Backed up {}",
        game_dir.display()
    );
    Ok(summary)
}

use anyhow::{Context, Result};
use std::path::Path;
use walkdir::WalkDir;

use crate::error::PatchError;
use crate::util;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreSummary {
    pub files_removed: usize,
    pub dirs_removed: usize,
    pub files_restored: usize,
}

/// Merge-copy the downloaded tree over the live installation. Name collisions
/// are overwritten; live files absent from the download stay as they are.
/// Returns the number of files written.
pub fn apply(download_dir: &Path, game_dir: &Path) -> Result<usize, PatchError> {
    let copied = util::merge_copy(download_dir, game_dir).map_err(PatchError::Filesystem)?;
    tracing::info!(files = copied, "Applied patch files to {}", game_dir.display());
    Ok(copied)
}

/// Undo [`apply`]: remove everything the download put into `game_dir`, then
/// copy the backup back. Removal always runs first so modified files round-trip.
pub fn restore(game_dir: &Path, download_dir: &Path, backup_dir: &Path) -> Result<RestoreSummary, PatchError> {
    for (label, dir) in [
        ("game directory", game_dir),
        ("download directory", download_dir),
        ("backup directory", backup_dir),
    ] {
        if !dir.is_dir() {
            return Err(PatchError::Precondition(format!(
                "{label} {} does not exist",
                dir.display()
            )));
        }
    }

    let mut summary = RestoreSummary::default();

    tracing::info!("Removing patched files");
    remove_mirrored(download_dir, game_dir, &mut summary).map_err(PatchError::Filesystem)?;

    tracing::info!("Restoring backup");
    summary.files_restored = util::merge_copy(backup_dir, game_dir).map_err(PatchError::Filesystem)?;

    tracing::info!(
        removed = summary.files_removed,
        dirs_removed = summary.dirs_removed,
        restored = summary.files_restored,
        "Restore finished"
    );
    Ok(summary)
}

/// Delete from `live` every path that exists under `pattern`, children before
/// parents. A directory is removed only once it is empty; anything else the
/// operator put there keeps it alive.
fn remove_mirrored(pattern: &Path, live: &Path, summary: &mut RestoreSummary) -> Result<()> {
    for entry in WalkDir::new(pattern).min_depth(1).contents_first(true) {
        let entry = entry.with_context(|| format!("Failed to read directory entry in {}", pattern.display()))?;
        let relative = entry
            .path()
            .strip_prefix(pattern)
            .with_context(|| "Failed to compute relative path")?;
        let target = live.join(relative);

        let Ok(meta) = std::fs::symlink_metadata(&target) else {
            continue;
        };

        if entry.file_type().is_dir() {
            if meta.is_dir() {
                let empty = std::fs::read_dir(&target)
                    .with_context(|| format!("Failed to list directory: {}", target.display()))?
                    .next()
                    .is_none();
                if empty {
                    std::fs::remove_dir(&target)
                        .with_context(|| format!("Failed to remove directory: {}", target.display()))?;
                    summary.dirs_removed += 1;
                }
            } else {
                remove_file(&target)?;
                summary.files_removed += 1;
            }
        } else if meta.is_dir() {
            std::fs::remove_dir_all(&target)
                .with_context(|| format!("Failed to remove directory tree: {}", target.display()))?;
            summary.dirs_removed += 1;
        } else {
            remove_file(&target)?;
            summary.files_removed += 1;
        }
    }
    Ok(())
}

fn remove_file(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow::Error::from(e))
            .with_context(|| format!("Failed to delete file: {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup;
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::PathBuf;

    fn write(root: &Path, rel: &str, content: &[u8]) {
        let full = root.join(rel);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, content).unwrap();
    }

    /// Every file and directory under `root`, with file contents.
    fn snapshot(root: &Path) -> BTreeMap<String, Option<Vec<u8>>> {
        WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .map(|e| e.unwrap())
            .map(|e| {
                let rel = e.path().strip_prefix(root).unwrap().to_str().unwrap().replace('\\', "/");
                let content = e.file_type().is_file().then(|| fs::read(e.path()).unwrap());
                (rel, content)
            })
            .collect()
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        game: PathBuf,
        download: PathBuf,
        backup: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let game = tmp.path().join("game");
        let download = tmp.path().join("download");
        let backup = tmp.path().join("backup");
        fs::create_dir_all(&game).unwrap();
        fs::create_dir_all(&download).unwrap();
        Fixture {
            _tmp: tmp,
            game,
            download,
            backup,
        }
    }

    #[test]
    fn test_apply_overwrites_and_keeps_untouched() {
        let f = fixture();
        write(&f.game, "a.txt", b"new");
        write(&f.game, "b.txt", b"untouched");
        write(&f.download, "a.txt", b"old");
        write(&f.download, "sub/c.txt", b"restored");

        assert_eq!(apply(&f.download, &f.game).unwrap(), 2);
        assert_eq!(fs::read(f.game.join("a.txt")).unwrap(), b"old");
        assert_eq!(fs::read(f.game.join("b.txt")).unwrap(), b"untouched");
        assert_eq!(fs::read(f.game.join("sub/c.txt")).unwrap(), b"restored");
    }

    #[test]
    fn test_backup_apply_restore_round_trip() {
        let f = fixture();
        write(&f.game, "AoE2DE_s.exe", b"exe 300");
        write(&f.game, "readme.txt", b"not in patch");
        write(&f.game, "resources/_common/dat/modified.dat", b"modified in 300");
        write(&f.game, "resources/_common/dat/kept.dat", b"kept");
        write(&f.game, "resources/other/o.dat", b"other");
        fs::create_dir_all(f.game.join("empty_dir")).unwrap();

        write(&f.download, "AoE2DE_s.exe", b"exe 100");
        write(&f.download, "resources/_common/dat/modified.dat", b"modified in 100");
        write(&f.download, "resources/_common/dat/removed.dat", b"removed after 100");
        write(&f.download, "resources/new_in_100/n.dat", b"n");

        let before = snapshot(&f.game);

        backup::backup(&f.game, &f.download, &f.backup).unwrap();
        apply(&f.download, &f.game).unwrap();
        assert_eq!(
            fs::read(f.game.join("resources/_common/dat/modified.dat")).unwrap(),
            b"modified in 100"
        );
        assert!(f.game.join("resources/new_in_100/n.dat").exists());

        restore(&f.game, &f.download, &f.backup).unwrap();
        assert_eq!(snapshot(&f.game), before);
    }

    #[test]
    fn test_round_trip_when_file_replaces_directory() {
        let f = fixture();
        write(&f.game, "AoE2DE_s.exe", b"exe 300");
        write(&f.game, "thing/inner.txt", b"inner");
        write(&f.download, "thing", b"a file in the old build");

        let before = snapshot(&f.game);

        let saved = backup::backup(&f.game, &f.download, &f.backup).unwrap();
        assert_eq!(saved.files_copied, 1);
        assert_eq!(apply(&f.download, &f.game).unwrap(), 1);
        assert_eq!(fs::read(f.game.join("thing")).unwrap(), b"a file in the old build");

        restore(&f.game, &f.download, &f.backup).unwrap();
        assert_eq!(snapshot(&f.game), before);
    }

    #[test]
    fn test_nested_subdirectory_scenario() {
        let f = fixture();
        write(&f.game, "data/sub/modified.bin", b"live version");
        write(&f.game, "data/sub/kept.bin", b"kept");

        write(&f.download, "data/sub/modified.bin", b"target version");
        write(&f.download, "data/sub/removed.bin", b"present in target only");

        backup::backup(&f.game, &f.download, &f.backup).unwrap();
        apply(&f.download, &f.game).unwrap();
        restore(&f.game, &f.download, &f.backup).unwrap();

        let mut names: Vec<String> = fs::read_dir(f.game.join("data/sub"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["kept.bin", "modified.bin"]);
        assert_eq!(fs::read(f.game.join("data/sub/modified.bin")).unwrap(), b"live version");
        assert_eq!(fs::read_dir(&f.game).unwrap().count(), 1);
    }

    #[test]
    fn test_restore_of_pure_additions_removes_created_dirs() {
        let f = fixture();
        write(&f.game, "keep.txt", b"keep");
        write(&f.download, "added/deep/file.txt", b"added");

        backup::backup(&f.game, &f.download, &f.backup).unwrap();
        apply(&f.download, &f.game).unwrap();
        let summary = restore(&f.game, &f.download, &f.backup).unwrap();

        assert!(!f.game.join("added").exists());
        assert_eq!(summary.files_removed, 1);
        assert_eq!(summary.dirs_removed, 2);
        assert_eq!(summary.files_restored, 0);
    }

    #[test]
    fn test_restore_leaves_foreign_content_in_shared_dirs() {
        let f = fixture();
        write(&f.download, "mods/patched.txt", b"p");
        fs::create_dir_all(&f.backup).unwrap();
        write(&f.game, "mods/patched.txt", b"p");
        write(&f.game, "mods/user_mod.txt", b"mine");

        restore(&f.game, &f.download, &f.backup).unwrap();
        assert!(!f.game.join("mods/patched.txt").exists());
        assert_eq!(fs::read(f.game.join("mods/user_mod.txt")).unwrap(), b"mine");
    }

    #[test]
    fn test_restore_requires_backup() {
        let f = fixture();
        assert!(matches!(
            restore(&f.game, &f.download, &f.backup),
            Err(PatchError::Precondition(_))
        ));
    }
}

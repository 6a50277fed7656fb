use anyhow::{Context, Result};
use memmap2::Mmap;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub relative_path: String,
    pub kind: EntryKind,
    pub full_path: PathBuf,
}

/// Walk a directory tree and collect all entries with relative paths.
/// Paths use forward slashes so they compare equal to manifest paths.
pub fn walk_directory(root: &Path) -> Result<Vec<DirEntry>> {
    let root = root
        .canonicalize()
        .with_context(|| format!("Failed to canonicalize path: {}", root.display()))?;

    let mut entries = Vec::new();

    for entry in WalkDir::new(&root).min_depth(1) {
        let entry = entry.with_context(|| format!("Failed to read directory entry in {}", root.display()))?;

        let full_path = entry.path().to_path_buf();
        let relative = full_path
            .strip_prefix(&root)
            .with_context(|| "Failed to compute relative path")?;

        let relative_str = relative
            .to_str()
            .with_context(|| format!("Non-UTF8 path: {}", relative.display()))?
            .replace('\\', "/");

        let kind = if entry.file_type().is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };

        entries.push(DirEntry {
            relative_path: relative_str,
            kind,
            full_path,
        });
    }

    Ok(entries)
}

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the `Mmap` is live.
pub fn mmap_file(path: &Path) -> Result<Mmap> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open file: {}", path.display()))?;
    // SAFETY: We only read from this mapping; no concurrent modification of these files.
    unsafe {
        Mmap::map(&file)
            .with_context(|| format!("Failed to memory-map file: {}", path.display()))
    }
}

/// Sort directory paths so parents come before children.
pub fn sort_dirs_parent_first(dirs: &mut [String]) {
    dirs.sort();
}

/// Remove `dir` with everything below it, then recreate it empty.
pub fn purge_dir(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(anyhow::Error::from(e))
                .with_context(|| format!("Failed to remove directory: {}", dir.display()))
        }
    }
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))
}

/// Copy every entry of `src` into `dst`, creating directories as needed and
/// overwriting files on name collision. Entries only in `dst` are left alone.
/// Returns the number of files copied.
pub fn merge_copy(src: &Path, dst: &Path) -> Result<usize> {
    let entries = walk_directory(src)?;

    let mut dirs: Vec<String> = entries
        .iter()
        .filter(|e| e.kind == EntryKind::Dir)
        .map(|e| e.relative_path.clone())
        .collect();
    let files: Vec<&DirEntry> = entries.iter().filter(|e| e.kind == EntryKind::File).collect();

    std::fs::create_dir_all(dst)
        .with_context(|| format!("Failed to create directory: {}", dst.display()))?;

    // Directories sequentially, parent-first.
    sort_dirs_parent_first(&mut dirs);
    for dir in &dirs {
        let full = dst.join(dir);
        if full.is_file() {
            std::fs::remove_file(&full)
                .with_context(|| format!("Failed to replace file with directory: {}", full.display()))?;
        }
        std::fs::create_dir_all(&full)
            .with_context(|| format!("Failed to create directory: {}", full.display()))?;
    }

    // Files touch disjoint paths, so copy them in parallel.
    files.par_iter().try_for_each(|entry| -> Result<()> {
        let target = dst.join(&entry.relative_path);
        if target.is_dir() {
            std::fs::remove_dir_all(&target)
                .with_context(|| format!("Failed to replace directory with file: {}", target.display()))?;
        }
        std::fs::copy(&entry.full_path, &target).with_context(|| {
            format!(
                "Failed to copy {} to {}",
                entry.full_path.display(),
                target.display()
            )
        })?;
        Ok(())
    })?;

    Ok(files.len())
}

/// Copy a single file or a whole directory tree from `src` to `dst`.
pub fn copy_entry(src: &Path, dst: &Path) -> Result<usize> {
    if src.is_dir() {
        merge_copy(src, dst)
    } else {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        std::fs::copy(src, dst)
            .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
        Ok(1)
    }
}

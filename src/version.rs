use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::util;

/// `VS_FIXEDFILEINFO.dwSignature`, little-endian.
const FIXED_FILE_INFO_SIGNATURE: [u8; 4] = [0xBD, 0x04, 0xEF, 0xFE];

/// Minor field of the first build that uses the linear numbering.
const MINOR_BASE: u16 = 101;

/// Reads the four-part file version of an executable.
pub trait VersionInspector: Send + Sync {
    fn file_version(&self, exe: &Path) -> Result<[u16; 4]>;
}

/// Scans a PE image for its fixed version resource.
#[derive(Debug, Default, Clone, Copy)]
pub struct PeVersionInspector;

impl VersionInspector for PeVersionInspector {
    fn file_version(&self, exe: &Path) -> Result<[u16; 4]> {
        let mmap = util::mmap_file(exe)?;
        fixed_file_version(&mmap)
            .with_context(|| format!("No version resource in {}", exe.display()))
    }
}

/// Locate `VS_FIXEDFILEINFO` in `image` and return
/// `(HIWORD(MS), LOWORD(MS), HIWORD(LS), LOWORD(LS))`.
pub fn fixed_file_version(image: &[u8]) -> Result<[u16; 4]> {
    let mut offset = 0;
    while let Some(pos) = find(&image[offset..], &FIXED_FILE_INFO_SIGNATURE) {
        let start = offset + pos;
        // signature, struct version, file version MS, file version LS
        if let Some(block) = image.get(start..start + 16) {
            let word = |i: usize| u32::from_le_bytes([block[i], block[i + 1], block[i + 2], block[i + 3]]);
            let struct_version = word(4);
            if struct_version == 0x0001_0000 {
                let ms = word(8);
                let ls = word(12);
                return Ok([(ms >> 16) as u16, ms as u16, (ls >> 16) as u16, ls as u16]);
            }
        }
        offset = start + 1;
    }
    bail!("VS_FIXEDFILEINFO signature not found")
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Map a file version onto the patch numbering used by the metadata service.
pub fn linear_version(parts: [u16; 4]) -> Result<u32> {
    let [_, minor, build, _] = parts;
    let Some(step) = minor.checked_sub(MINOR_BASE) else {
        bail!(
            "File version {}.{}.{}.{} predates the supported numbering",
            parts[0],
            parts[1],
            parts[2],
            parts[3]
        );
    };
    Ok(u32::from(step) * 65536 + u32::from(build))
}

/// Installed version of the game whose executable is `exe`.
pub fn installed_version(inspector: &dyn VersionInspector, exe: &Path) -> Result<u32> {
    let parts = inspector.file_version(exe)?;
    let version = linear_version(parts)?;
    tracing::debug!(?parts, version, "Read executable version");
    Ok(version)
}

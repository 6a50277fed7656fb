use chrono::NaiveDateTime;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use crate::error::ManifestError;
use crate::model::Manifest;

const DATE_FORMATS: &[&str] = &[
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %I:%M:%S %p",
    "%Y-%m-%d %H:%M:%S",
    "%d.%m.%Y %H:%M:%S",
];

struct Grammar {
    title: Regex,
    id_date: Regex,
    labeled: Regex,
    columns: Regex,
    row: Regex,
}

fn grammar() -> &'static Grammar {
    static GRAMMAR: OnceLock<Grammar> = OnceLock::new();
    GRAMMAR.get_or_init(|| Grammar {
        title: Regex::new(r"^Content Manifest for Depot (\d+)\s*$").unwrap(),
        id_date: Regex::new(r"^Manifest ID / date\s*:\s*(\d+)\s*/\s*(.+?)\s*$").unwrap(),
        labeled: Regex::new(r"^Total (number of files|number of chunks|bytes on disk|bytes compressed)\s*:\s*(\d+)\s*$").unwrap(),
        columns: Regex::new(r"^\s*Size\s+Chunks\s+File SHA\s+Flags\s+Name\s*$").unwrap(),
        row: Regex::new(r"^\s*(\d+)\s+(\d+)\s+([0-9a-fA-F]{40})\s+(\d+)\s+(\S.*?)\s*$").unwrap(),
    })
}

/// Line cursor that skips blank lines and remembers 1-based positions for errors.
struct Lines<'a> {
    inner: std::iter::Enumerate<std::str::Lines<'a>>,
}

impl<'a> Lines<'a> {
    fn next_nonblank(&mut self, expected: &'static str) -> Result<(usize, &'a str), ManifestError> {
        for (i, line) in self.inner.by_ref() {
            if !line.trim().is_empty() {
                return Ok((i + 1, line));
            }
        }
        Err(ManifestError::Truncated(expected))
    }
}

fn number(line: usize, field: &'static str, value: &str) -> Result<u64, ManifestError> {
    value.parse().map_err(|_| ManifestError::InvalidNumber {
        line,
        field,
        value: value.to_string(),
    })
}

fn unexpected(line: usize, expected: &'static str, found: &str) -> ManifestError {
    ManifestError::UnexpectedLine {
        line,
        expected,
        found: found.to_string(),
    }
}

fn parse_date(line: usize, value: &str) -> Result<NaiveDateTime, ManifestError> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .ok_or_else(|| unexpected(line, "manifest date", value))
}

/// Parse the fetcher's text manifest for one depot build.
///
/// Either every header field and every file row is recovered, or the call fails.
/// Hashes are kept verbatim (lowercased); nothing is recomputed locally.
pub fn parse(text: &str) -> Result<Manifest, ManifestError> {
    let g = grammar();
    let mut lines = Lines {
        inner: text.lines().enumerate(),
    };

    let (n, line) = lines.next_nonblank("depot title")?;
    let caps = g
        .title
        .captures(line)
        .ok_or_else(|| unexpected(n, "`Content Manifest for Depot <id>`", line))?;
    let depot_id = number(n, "depot id", &caps[1])?;
    let depot_id = u32::try_from(depot_id).map_err(|_| ManifestError::InvalidNumber {
        line: n,
        field: "depot id",
        value: caps[1].to_string(),
    })?;

    let (n, line) = lines.next_nonblank("manifest id and date")?;
    let caps = g
        .id_date
        .captures(line)
        .ok_or_else(|| unexpected(n, "`Manifest ID / date : <id> / <date>`", line))?;
    let manifest_id = number(n, "manifest id", &caps[1])?;
    let date = parse_date(n, &caps[2])?;

    // Four labeled totals, in fixed order.
    let mut totals = [0u64; 4];
    const LABELS: [&str; 4] = [
        "number of files",
        "number of chunks",
        "bytes on disk",
        "bytes compressed",
    ];
    for (slot, label) in totals.iter_mut().zip(LABELS) {
        let (n, line) = lines.next_nonblank(label)?;
        let caps = g
            .labeled
            .captures(line)
            .filter(|c| &c[1] == label)
            .ok_or_else(|| unexpected(n, label, line))?;
        *slot = number(n, label, &caps[2])?;
    }

    let (n, line) = lines.next_nonblank("column header")?;
    if !g.columns.is_match(line) {
        return Err(unexpected(n, "column header", line));
    }

    let mut files = BTreeMap::new();
    while let Ok((n, line)) = lines.next_nonblank("file row") {
        let caps = g
            .row
            .captures(line)
            .ok_or_else(|| unexpected(n, "`<size> <chunks> <sha> <flags> <name>` row", line))?;
        number(n, "file size", &caps[1])?;
        let path = caps[5].replace('\\', "/");
        if files.contains_key(&path) {
            return Err(ManifestError::DuplicatePath { line: n, path });
        }
        files.insert(path, caps[3].to_ascii_lowercase());
    }

    let manifest = Manifest {
        depot_id,
        manifest_id,
        date,
        declared_file_count: totals[0],
        declared_chunk_count: totals[1],
        size_on_disk: totals[2],
        size_compressed: totals[3],
        files,
    };

    if manifest.files.len() as u64 != manifest.declared_file_count {
        tracing::warn!(
            depot_id,
            manifest_id,
            declared = manifest.declared_file_count,
            parsed = manifest.files.len(),
            "Manifest file count differs from its header"
        );
    }

    Ok(manifest)
}

/// Read and parse a manifest file written by the fetcher.
pub fn read_manifest(path: &Path) -> Result<Manifest, ManifestError> {
    let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse(&text)
}

#[cfg(test)]
pub(crate) fn render(manifest_id: u64, depot_id: u32, files: &[(&str, &str)]) -> String {
    let mut out = format!(
        "Content Manifest for Depot {depot_id}\n\n\
         Manifest ID / date     : {manifest_id} / 11/17/2020 19:44:30\n\
         Total number of files  : {}\n\
         Total number of chunks : {}\n\
         Total bytes on disk    : 1000\n\
         Total bytes compressed : 500\n\n\n\
         {:>14} Chunks File SHA                                 Flags Name\n",
        files.len(),
        files.len(),
        "Size"
    );
    for (name, hash) in files {
        out.push_str(&format!("{:>14} {:>6} {} {:>5} {}\n", 100, 1, hash, 0, name));
    }
    out
}

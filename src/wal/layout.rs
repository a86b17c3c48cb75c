//! Naming and enumeration of segment files on disk.
//!
//! Shared between the file manager (which creates segments) and the reader
//! (which enumerates them), so the two never disagree about what a segment
//! file is called.

use std::path::{Path, PathBuf};

const SEGMENT_PREFIX: &str = "wal-";
const SEGMENT_SUFFIX: &str = ".log";

/// Path of segment `segment_number` inside `dir`.
pub fn segment_path(dir: &Path, segment_number: u64) -> PathBuf {
    dir.join(format!("{SEGMENT_PREFIX}{segment_number}{SEGMENT_SUFFIX}"))
}

/// Parse a segment number out of a `wal-<N>.log` file name, if it matches.
pub fn parse_segment_number(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

/// Every `wal-*.log` file directly inside `dir`, sorted by segment number.
/// Non-matching entries (the archive subdirectory, lock files) are ignored.
pub fn list_segment_files(dir: &Path) -> std::io::Result<Vec<(u64, PathBuf)>> {
    let mut found = Vec::new();
    if !dir.exists() {
        return Ok(found);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if let Some(number) = parse_segment_number(file_name) {
            found.push((number, entry.path()));
        }
    }
    found.sort_by_key(|(number, _)| *number);
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_segment_numbers() {
        let dir = Path::new("/tmp/example");
        let path = segment_path(dir, 7);
        assert_eq!(path, Path::new("/tmp/example/wal-7.log"));
        assert_eq!(
            parse_segment_number(path.file_name().unwrap().to_str().unwrap()),
            Some(7)
        );
    }

    #[test]
    fn rejects_non_segment_names() {
        assert_eq!(parse_segment_number("archive"), None);
        assert_eq!(parse_segment_number("wal-abc.log"), None);
        assert_eq!(parse_segment_number("wal-7.tmp"), None);
    }

    #[test]
    fn lists_and_sorts_segments() {
        let dir = tempfile::tempdir().unwrap();
        for n in [3u64, 1, 2] {
            std::fs::write(segment_path(dir.path(), n), b"").unwrap();
        }
        std::fs::create_dir(dir.path().join("archive")).unwrap();

        let found = list_segment_files(dir.path()).unwrap();
        let numbers: Vec<u64> = found.iter().map(|(n, _)| *n).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }
}

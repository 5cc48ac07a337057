//! `/proc/<pid>/maps` parsing for runtime discovery
//!
//! A runtime is "loaded" in a process when its core library is mapped into
//! the process's address space. Each distinct mapped path is reported once,
//! with the full address range covered by all of its segments.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

/// Memory range of a loaded library in a process's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
}

impl MemoryRange {
    /// Check if an address falls within this memory range
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// A library mapped by the process, merged over all of its segments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedLibrary {
    pub path: PathBuf,
    pub range: MemoryRange,
}

/// Read `/proc/<pid>/maps` and return every mapping whose file name is `library`
///
/// # Errors
/// Returns an error if the maps file cannot be read or a range is malformed
pub fn find_mapped_library(pid: u32, library: &str) -> Result<Vec<MappedLibrary>> {
    let maps_path = format!("/proc/{pid}/maps");
    let maps = fs::read_to_string(&maps_path).context(format!("Failed to read {maps_path}"))?;
    parse_mapped_library(&maps, library)
}

/// Parse maps content: "start-end perms offset dev inode pathname"
///
/// # Errors
/// Returns an error if a matching line carries a malformed address range
pub fn parse_mapped_library(maps: &str, library: &str) -> Result<Vec<MappedLibrary>> {
    let mut ranges: BTreeMap<PathBuf, MemoryRange> = BTreeMap::new();

    for line in maps.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 6 {
            // Anonymous mapping
            continue;
        }
        // Paths may contain spaces
        let path = PathBuf::from(parts[5..].join(" "));
        if path.file_name().and_then(|n| n.to_str()) != Some(library) {
            continue;
        }

        let (start, end) = parts[0].split_once('-').context("Malformed address range")?;
        let start = u64::from_str_radix(start, 16).context("Failed to parse range start")?;
        let end = u64::from_str_radix(end, 16).context("Failed to parse range end")?;

        ranges
            .entry(path)
            .and_modify(|r| {
                r.start = r.start.min(start);
                r.end = r.end.max(end);
            })
            .or_insert(MemoryRange { start, end });
    }

    Ok(ranges.into_iter().map(|(path, range)| MappedLibrary { path, range }).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const CORECLR: &str = "/usr/share/dotnet/shared/Microsoft.NETCore.App/8.0.4/libcoreclr.so";

    fn maps() -> String {
        format!(
            "55d4c8a00000-55d4c8a02000 r--p 00000000 08:01 1234 /usr/share/dotnet/dotnet\n\
             7f1a20000000-7f1a20100000 r--p 00000000 08:01 5678 {CORECLR}\n\
             7f1a20100000-7f1a20500000 r-xp 00100000 08:01 5678 {CORECLR}\n\
             7f1a20600000-7f1a20700000 rw-p 00000000 00:00 0\n\
             7f1a30000000-7f1a30010000 r--p 00000000 08:01 9999 /opt/my apps/libcoreclr.so\n"
        )
    }

    #[test]
    fn test_memory_range_contains() {
        let range = MemoryRange { start: 0x1000, end: 0x2000 };

        assert!(range.contains(0x1000));
        assert!(range.contains(0x1FFF));
        assert!(!range.contains(0x0FFF));
        assert!(!range.contains(0x2000));
    }

    #[test]
    fn test_segments_are_merged_per_path() {
        let libs = parse_mapped_library(&maps(), "libcoreclr.so").unwrap();
        assert_eq!(libs.len(), 2);

        let coreclr = libs.iter().find(|l| l.path.to_string_lossy().contains("8.0.4")).unwrap();
        assert_eq!(coreclr.range, MemoryRange { start: 0x7f1a_2000_0000, end: 0x7f1a_2050_0000 });

        assert!(libs.iter().any(|l| l.path == Path::new("/opt/my apps/libcoreclr.so")));
    }

    #[test]
    fn test_no_match() {
        assert!(parse_mapped_library(&maps(), "libmono.so").unwrap().is_empty());
    }

    #[test]
    fn test_own_maps_are_readable() {
        let libs = find_mapped_library(std::process::id(), "no-such-library.so").unwrap();
        assert!(libs.is_empty());
    }
}

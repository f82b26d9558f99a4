/// Memory map parsing
///
/// Accepts either `/proc/<pid>/maps` text or a raw memory dump. Text input
/// yields one typed region per well-formed line; raw input is split into
/// `data` regions at page-sized zero/non-zero boundaries.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ParseError;

/// Largest input either mode accepts
pub const MAX_INPUT_SIZE: u64 = 500 * 1024 * 1024;

const RAW_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub shared: bool,
}

impl Permissions {
    pub fn parse(raw: &str) -> Option<Self> {
        let bytes = raw.as_bytes();
        if bytes.len() < 3 {
            return None;
        }
        let flag = |idx: usize, set: u8| -> Option<bool> {
            match bytes[idx] {
                b if b == set => Some(true),
                b'-' => Some(false),
                _ => None,
            }
        };
        Some(Self {
            read: flag(0, b'r')?,
            write: flag(1, b'w')?,
            execute: flag(2, b'x')?,
            shared: bytes.get(3) == Some(&b's'),
        })
    }

    fn read_only() -> Self {
        Self {
            read: true,
            ..Default::default()
        }
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}{}",
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            if self.execute { 'x' } else { '-' },
            if self.shared { 's' } else { 'p' }
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RegionType {
    Stack,
    Heap,
    SharedLibrary,
    MappedFile,
    Vdso,
    Vvar,
    Anonymous,
    Data,
    Unknown,
}

impl RegionType {
    pub fn classify(pathname: Option<&str>) -> Self {
        let Some(path) = pathname else {
            return RegionType::Anonymous;
        };

        if path == "[stack]" || path.starts_with("[stack:") {
            RegionType::Stack
        } else if path == "[heap]" {
            RegionType::Heap
        } else if path == "[vdso]" {
            RegionType::Vdso
        } else if path == "[vvar]" {
            RegionType::Vvar
        } else if path.starts_with('[') {
            RegionType::Unknown
        } else if Self::is_shared_library(path) {
            RegionType::SharedLibrary
        } else {
            RegionType::MappedFile
        }
    }

    fn is_shared_library(path: &str) -> bool {
        let path = path.trim_end_matches(" (deleted)");
        let name = path.rsplit('/').next().unwrap_or(path);
        name.ends_with(".so") || name.contains(".so.")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryRegion {
    pub start: u64,
    pub end: u64,
    pub size: u64,
    pub permissions: Permissions,
    pub region_type: RegionType,
    pub path: Option<String>,
}

impl MemoryRegion {
    fn new(
        start: u64,
        end: u64,
        permissions: Permissions,
        region_type: RegionType,
        path: Option<String>,
    ) -> Option<Self> {
        (end > start).then(|| Self {
            start,
            end,
            size: end - start,
            permissions,
            region_type,
            path,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    WritableExecutable,
    ExecutableHeap,
    ExecutableStack,
}

impl FindingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingKind::WritableExecutable => "writable_executable",
            FindingKind::ExecutableHeap => "executable_heap",
            FindingKind::ExecutableStack => "executable_stack",
        }
    }
}

/// A mapping whose permissions suggest injected or unpacked code
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegionFinding {
    pub kind: FindingKind,
    pub start: u64,
    pub end: u64,
    pub description: String,
}

pub struct MemoryRegionParser;

impl MemoryRegionParser {
    pub fn parse(input: &[u8]) -> Result<Vec<MemoryRegion>, ParseError> {
        let size = input.len() as u64;
        if size > MAX_INPUT_SIZE {
            return Err(ParseError::InputTooLarge {
                size,
                max: MAX_INPUT_SIZE,
            });
        }
        if input.is_empty() {
            return Ok(Vec::new());
        }

        if let Ok(text) = std::str::from_utf8(input) {
            let regions = Self::parse_maps(text);
            if !regions.is_empty() {
                return Ok(regions);
            }
        }

        Ok(Self::parse_raw(input))
    }

    pub async fn parse_file(path: &Path) -> Result<Vec<MemoryRegion>, ParseError> {
        let size = tokio::fs::metadata(path).await?.len();
        if size > MAX_INPUT_SIZE {
            return Err(ParseError::InputTooLarge {
                size,
                max: MAX_INPUT_SIZE,
            });
        }
        let data = tokio::fs::read(path).await?;
        Self::parse(&data)
    }

    /// Parse `/proc/<pid>/maps` text, skipping malformed lines
    pub fn parse_maps(text: &str) -> Vec<MemoryRegion> {
        let mut regions = Vec::new();
        for (line_num, line) in text.lines().enumerate() {
            match Self::parse_maps_line(line) {
                Some(region) => regions.push(region),
                None if !line.trim().is_empty() => {
                    debug!(line = line_num + 1, "Skipping malformed memory map line");
                }
                None => {}
            }
        }
        regions
    }

    fn parse_maps_line(line: &str) -> Option<MemoryRegion> {
        // start-end perms offset dev inode [pathname]
        let mut fields = line.splitn(6, char::is_whitespace).filter(|f| !f.is_empty());
        let range = fields.next()?;
        let perms = Permissions::parse(fields.next()?)?;
        let offset = fields.next()?;
        let device = fields.next()?;
        let inode = fields.next()?;
        if u64::from_str_radix(offset, 16).is_err() || !device.contains(':') || inode.parse::<u64>().is_err() {
            return None;
        }

        let (start, end) = range.split_once('-')?;
        let start = u64::from_str_radix(start, 16).ok()?;
        let end = u64::from_str_radix(end, 16).ok()?;

        let path = fields
            .next()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string);
        let region_type = RegionType::classify(path.as_deref());

        MemoryRegion::new(start, end, perms, region_type, path)
    }

    /// Split a raw dump into contiguous non-zero page runs
    pub fn parse_raw(data: &[u8]) -> Vec<MemoryRegion> {
        let mut regions = Vec::new();
        let mut run_start: Option<u64> = None;
        let mut offset = 0u64;

        for chunk in data.chunks(RAW_CHUNK) {
            let has_data = chunk.iter().any(|&b| b != 0);
            match (has_data, run_start) {
                (true, None) => run_start = Some(offset),
                (false, Some(start)) => {
                    regions.extend(MemoryRegion::new(
                        start,
                        offset,
                        Permissions::read_only(),
                        RegionType::Data,
                        None,
                    ));
                    run_start = None;
                }
                _ => {}
            }
            offset += chunk.len() as u64;
        }

        if let Some(start) = run_start {
            regions.extend(MemoryRegion::new(
                start,
                offset,
                Permissions::read_only(),
                RegionType::Data,
                None,
            ));
        }

        if regions.is_empty() {
            regions.extend(MemoryRegion::new(
                0,
                offset,
                Permissions::read_only(),
                RegionType::Unknown,
                None,
            ));
        }

        regions
    }
}

/// Flag writable+executable mappings and executable heap or stack
pub fn analyze_regions(regions: &[MemoryRegion]) -> Vec<RegionFinding> {
    let mut findings = Vec::new();

    for region in regions.iter().filter(|r| r.permissions.execute) {
        if region.permissions.write {
            findings.push(RegionFinding {
                kind: FindingKind::WritableExecutable,
                start: region.start,
                end: region.end,
                description: format!(
                    "{} mapping at 0x{:x}-0x{:x} ({} bytes)",
                    region.permissions, region.start, region.end, region.size
                ),
            });
        }

        let kind = match region.region_type {
            RegionType::Heap => FindingKind::ExecutableHeap,
            RegionType::Stack => FindingKind::ExecutableStack,
            _ => continue,
        };
        findings.push(RegionFinding {
            kind,
            start: region.start,
            end: region.end,
            description: format!(
                "Executable {} at 0x{:x}-0x{:x}",
                region.path.as_deref().unwrap_or("region"),
                region.start,
                region.end
            ),
        });
    }

    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MAPS: &str = "\
55d0c0a00000-55d0c0a21000 rw-p 00000000 00:00 0                          [heap]
7f1e2a000000-7f1e2a1c5000 r-xp 00000000 08:01 1835018                    /usr/lib/x86_64-linux-gnu/libc.so.6
7f1e2a400000-7f1e2a401000 rw-p 00000000 00:00 0
7fffd1e00000-7fffd1e21000 rw-p 00000000 00:00 0                          [stack]
7fffd1f00000-7fffd1f02000 r-xp 00000000 00:00 0                          [vdso]
7fffd1efc000-7fffd1f00000 r--p 00000000 00:00 0                          [vvar]
55d0bfe00000-55d0bfe02000 r-xp 00000000 08:01 2097183                    /sandbox/input/sample
";

    #[test]
    fn test_region_types() {
        let regions = MemoryRegionParser::parse(MAPS.as_bytes()).unwrap();
        let types: Vec<RegionType> = regions.iter().map(|r| r.region_type).collect();
        assert_eq!(
            types,
            vec![
                RegionType::Heap,
                RegionType::SharedLibrary,
                RegionType::Anonymous,
                RegionType::Stack,
                RegionType::Vdso,
                RegionType::Vvar,
                RegionType::MappedFile,
            ]
        );
        for r in &regions {
            assert!(r.end > r.start);
            assert_eq!(r.size, r.end - r.start);
        }
        assert_eq!(regions[1].permissions.to_string(), "r-xp");
        assert_eq!(regions[2].path, None);
    }

    #[test]
    fn test_parse_is_idempotent() {
        let first = MemoryRegionParser::parse(MAPS.as_bytes()).unwrap();
        let second = MemoryRegionParser::parse(MAPS.as_bytes()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let text = "\
garbage line
00400000-00452000 r-xp 00000000 08:01 1234 /bin/sample
00500000-00400000 r--p 00000000 08:01 1234 /bin/sample
zzzz-00452000 r-xp 00000000 08:01 1234
00600000-00601000 rw-p 00000000 00:00 0
";
        let regions = MemoryRegionParser::parse(text.as_bytes()).unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].start, 0x400000);
        assert_eq!(regions[1].region_type, RegionType::Anonymous);
    }

    #[test]
    fn test_path_with_spaces_and_deleted() {
        let text = "7f0000000000-7f0000001000 r-xp 00000000 08:01 99 /tmp/my lib.so (deleted)\n";
        let regions = MemoryRegionParser::parse(text.as_bytes()).unwrap();
        assert_eq!(regions[0].path.as_deref(), Some("/tmp/my lib.so (deleted)"));
        assert_eq!(regions[0].region_type, RegionType::SharedLibrary);
    }

    #[test]
    fn test_raw_dump_regions() {
        let mut dump = vec![0u8; RAW_CHUNK * 5];
        dump[RAW_CHUNK + 10] = 0x90;
        dump[RAW_CHUNK * 2 + 1] = 0xcc;
        dump[RAW_CHUNK * 4] = 0x41;

        let regions = MemoryRegionParser::parse(&dump).unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!((regions[0].start, regions[0].end), (RAW_CHUNK as u64, 3 * RAW_CHUNK as u64));
        assert_eq!((regions[1].start, regions[1].end), (4 * RAW_CHUNK as u64, 5 * RAW_CHUNK as u64));
        assert!(regions.iter().all(|r| r.region_type == RegionType::Data));
    }

    #[test]
    fn test_all_zero_dump_is_single_unknown_region() {
        let regions = MemoryRegionParser::parse(&vec![0u8; 100]).unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].region_type, RegionType::Unknown);
        assert_eq!(regions[0].size, 100);
        assert!(MemoryRegionParser::parse(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_analyze_regions() {
        let text = "\
00600000-00601000 rwxp 00000000 00:00 0
55d0c0a00000-55d0c0a21000 r-xp 00000000 00:00 0 [heap]
7fffd1e00000-7fffd1e21000 rwxp 00000000 00:00 0 [stack]
7f1e2a000000-7f1e2a1c5000 r-xp 00000000 08:01 1835018 /usr/lib/libc.so.6
";
        let regions = MemoryRegionParser::parse_maps(text);
        let kinds: Vec<FindingKind> = analyze_regions(&regions).into_iter().map(|f| f.kind).collect();
        assert_eq!(
            kinds,
            vec![
                FindingKind::WritableExecutable,
                FindingKind::ExecutableHeap,
                FindingKind::WritableExecutable,
                FindingKind::ExecutableStack,
            ]
        );
    }

    #[tokio::test]
    async fn test_parse_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("maps_1_0.txt");
        tokio::fs::write(&path, MAPS).await.unwrap();
        let regions = MemoryRegionParser::parse_file(&path).await.unwrap();
        assert_eq!(regions.len(), 7);
        assert!(MemoryRegionParser::parse_file(&dir.path().join("missing")).await.is_err());
    }
}

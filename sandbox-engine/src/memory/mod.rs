/// Memory forensics for sandboxed processes
///
/// - Trigger-based snapshot acquisition during a run
/// - `/proc/<pid>/maps` and raw dump region parsing
/// - ASCII and UTF-16LE string extraction with suspicion flags
/// - Volatility 3 plugin runs over full memory images

pub mod capture;
pub mod regions;
pub mod strings;
pub mod volatility;

pub use capture::{DumpTrigger, MemoryCaptureConfig, MemoryCaptureController, MemoryDump};
pub use regions::{
    analyze_regions, FindingKind, MemoryRegion, MemoryRegionParser, Permissions, RegionFinding,
    RegionType,
};
pub use strings::{
    ExtractedString, FoundEncoding, StringCategory, StringEncoding, StringExtractor,
};
pub use volatility::{
    MalfindHit, VolatilityAnalysis, VolatilityPlugin, VolatilityRunner, VolatilityStatus,
};

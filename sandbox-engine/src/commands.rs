//! Commands exposed to the hosting application.
//!
//! Every command resolves its path inside the configured dumps directory
//! before anything else, so symlinks and `..` segments cannot reach other
//! host files. Region and string commands also check the size ceiling
//! before reading, so a rejected request never loads a large dump.

use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::CommandError;
use crate::memory::regions::MAX_INPUT_SIZE;
use crate::memory::{
    ExtractedString, MemoryRegion, MemoryRegionParser, StringEncoding, StringExtractor,
    VolatilityAnalysis, VolatilityRunner, VolatilityStatus,
};

/// Shortest string length the extraction command accepts
pub const MIN_STRING_LENGTH: usize = 4;

/// Canonicalize `file_path` (relative paths are taken from `dumps_dir`) and
/// require the result to be a regular file under the canonical `dumps_dir`.
async fn resolve_dump(dumps_dir: &Path, file_path: &Path) -> Result<(PathBuf, u64), CommandError> {
    let display = || file_path.display().to_string();
    let root = tokio::fs::canonicalize(dumps_dir).await?;

    let resolved = match tokio::fs::canonicalize(root.join(file_path)).await {
        Ok(resolved) => resolved,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(CommandError::FileNotFound { path: display() })
        }
        Err(e) => return Err(CommandError::Io(e)),
    };
    if !resolved.starts_with(&root) {
        warn!("Rejected path outside dumps directory: {}", file_path.display());
        return Err(CommandError::PathOutsideRoot { path: display() });
    }

    let metadata = tokio::fs::metadata(&resolved).await?;
    if !metadata.is_file() {
        return Err(CommandError::FileNotFound { path: display() });
    }
    Ok((resolved, metadata.len()))
}

/// Resolution plus the size ceiling shared by the region and string commands
async fn check_file(dumps_dir: &Path, file_path: &Path) -> Result<(PathBuf, u64), CommandError> {
    let (path, size) = resolve_dump(dumps_dir, file_path).await?;
    if size > MAX_INPUT_SIZE {
        return Err(CommandError::FileTooLarge {
            size,
            max: MAX_INPUT_SIZE,
        });
    }
    Ok((path, size))
}

fn join_error(e: tokio::task::JoinError) -> CommandError {
    CommandError::Io(io::Error::new(io::ErrorKind::Other, e))
}

/// Parse a textual process map or raw memory dump into regions
pub async fn get_memory_regions(
    dumps_dir: impl AsRef<Path>,
    file_path: impl AsRef<Path>,
) -> Result<Vec<MemoryRegion>, CommandError> {
    let (path, size) = check_file(dumps_dir.as_ref(), file_path.as_ref()).await?;
    let data = tokio::fs::read(&path).await?;

    let regions = tokio::task::spawn_blocking(move || MemoryRegionParser::parse(&data))
        .await
        .map_err(join_error)??;

    info!("Parsed {} memory regions from {} ({} bytes)", regions.len(), path.display(), size);
    Ok(regions)
}

/// Extract strings from a dump file. `encoding` must be `ascii`, `unicode`
/// or `both`; `min_length` below 4 is raised to 4.
pub async fn extract_strings_from_dump(
    dumps_dir: impl AsRef<Path>,
    file_path: impl AsRef<Path>,
    min_length: usize,
    encoding: &str,
) -> Result<Vec<ExtractedString>, CommandError> {
    let (path, _) = check_file(dumps_dir.as_ref(), file_path.as_ref()).await?;
    let encoding: StringEncoding = encoding.parse()?;
    let min_length = min_length.max(MIN_STRING_LENGTH);

    let data = tokio::fs::read(&path).await?;
    debug!(
        "Extracting {:?} strings (min length {}) from {} bytes",
        encoding,
        min_length,
        data.len()
    );
    let strings = tokio::task::spawn_blocking(move || {
        StringExtractor::extract_with(&data, min_length, encoding)
    })
    .await
    .map_err(join_error)?;

    info!(
        "Extracted {} strings ({} suspicious) from {}",
        strings.len(),
        strings.iter().filter(|s| s.suspicious).count(),
        path.display()
    );
    Ok(strings)
}

/// Run Volatility 3 plugins over a memory image. No size ceiling applies;
/// full images routinely exceed it.
pub async fn analyze_memory_with_volatility(
    runner: &VolatilityRunner,
    dumps_dir: impl AsRef<Path>,
    file_path: impl AsRef<Path>,
    plugins: &[String],
) -> Result<VolatilityAnalysis, CommandError> {
    let (path, size) = resolve_dump(dumps_dir.as_ref(), file_path.as_ref()).await?;
    debug!("Volatility analysis of {} ({} bytes)", path.display(), size);
    Ok(runner.analyze(&path, plugins).await?)
}

pub async fn check_volatility_available(runner: &VolatilityRunner) -> VolatilityStatus {
    runner.status().await
}

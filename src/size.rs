//! Allocated-size resolution with a prioritized fallback chain.

use crate::fs::{EntryMetadata, FileSystem};
use std::path::Path;
use tracing::warn;

/// Which attribute produced a resolved size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeSource {
    TotalAllocated,
    Allocated,
    Logical,
    LegacyStat,
    Unavailable,
}

/// Resolve the size of an entry, trying in order: sparse-aware allocated
/// size, plain allocated size, logical length, then a fresh stat.
///
/// Never fails. An entry with no size information counts as 0 bytes.
pub fn resolve_size(fs: &dyn FileSystem, path: &Path, meta: &EntryMetadata) -> u64 {
    resolve_size_with_source(fs, path, meta).0
}

pub fn resolve_size_with_source(
    fs: &dyn FileSystem,
    path: &Path,
    meta: &EntryMetadata,
) -> (u64, SizeSource) {
    if let Some(size) = meta.total_allocated_size {
        return (size, SizeSource::TotalAllocated);
    }
    if let Some(size) = meta.allocated_size {
        return (size, SizeSource::Allocated);
    }
    if let Some(size) = meta.logical_size {
        return (size, SizeSource::Logical);
    }
    match fs.stat_size(path) {
        Ok(size) => (size, SizeSource::LegacyStat),
        Err(err) => {
            warn!(path = %path.display(), %err, "no size information available, counting as 0");
            (0, SizeSource::Unavailable)
        }
    }
}

/// Format bytes as a human readable string (SI units).
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    if bytes < 1000 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

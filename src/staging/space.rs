//! Free space estimation.

use std::path::Path;

/// Multiplier for albums converted straight from their files:
/// staging copy, converted output and archive copy.
pub const STANDARD_SPACE_MULTIPLIER: u64 = 3;

/// Multiplier for albums holding disc images, where extracted tracks
/// coexist with the other copies.
pub const CONTAINER_SPACE_MULTIPLIER: u64 = 5;

/// Reports free space on the filesystem holding a path.
pub trait SpaceMeter: Send + Sync {
    fn available_space(&self, path: &Path) -> std::io::Result<u64>;
}

/// Space meter backed by the real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsSpaceMeter;

impl SpaceMeter for FsSpaceMeter {
    fn available_space(&self, path: &Path) -> std::io::Result<u64> {
        // The working root may not exist yet; ask its closest existing ancestor
        let existing = path
            .ancestors()
            .find(|p| p.exists())
            .unwrap_or_else(|| Path::new("/"));
        fs2::available_space(existing)
    }
}

/// Bytes needed to process an album of `total_size` bytes, before any safety margin.
pub fn estimate_required_space(total_size: u64, has_container: bool) -> u64 {
    let multiplier = if has_container {
        CONTAINER_SPACE_MULTIPLIER
    } else {
        STANDARD_SPACE_MULTIPLIER
    };
    total_size.saturating_mul(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_estimate_uses_format_multiplier() {
        assert_eq!(estimate_required_space(100, false), 300);
        assert_eq!(estimate_required_space(100, true), 500);
        assert_eq!(estimate_required_space(0, true), 0);
        assert_eq!(estimate_required_space(u64::MAX, false), u64::MAX);
    }

    #[test]
    fn test_fs_meter_handles_missing_directories() {
        let temp = TempDir::new().unwrap();
        let meter = FsSpaceMeter;
        let missing = temp.path().join("not/yet/created");
        assert!(meter.available_space(&missing).unwrap() > 0);
    }
}

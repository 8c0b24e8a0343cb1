//! Album units and their discovery on disk.

mod models;
mod scanner;

pub use models::{AlbumUnit, FileClass, FormatPolicy, MediaFile};
pub use scanner::{AlbumScanError, AlbumScanner};

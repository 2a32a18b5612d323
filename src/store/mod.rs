//! Block storage
//!
//! Concrete references resolve to files in a block store. A block that is
//! still being written carries a `<id>.partial` marker next to it, so
//! readers can tell a growing stream from a finished block.

mod local;

pub use local::*;

use std::fs::File;
use std::path::PathBuf;

use crate::error::Result;

/// Size and completion of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStatus {
    pub size: u64,
    pub done: bool,
}

pub trait BlockStore: Send + Sync {
    /// Where the block for `id` lives (whether or not it exists)
    fn path_for(&self, id: &str) -> PathBuf;

    /// Store a finished block in one go
    fn write(&self, id: &str, bytes: &[u8]) -> Result<PathBuf>;

    /// Create an empty block for incremental writing, marked partial
    fn begin(&self, id: &str) -> Result<(PathBuf, File)>;

    /// Clear the partial marker; returns the final size
    fn finish(&self, id: &str) -> Result<u64>;

    /// `None` when no block exists
    fn stream_status(&self, id: &str) -> Option<StreamStatus>;
}

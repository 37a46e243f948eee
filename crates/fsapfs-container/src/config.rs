//! Container configuration

use fsapfs_core::{MAX_DIRECTORY_ENTRIES, MAX_TRAVERSAL_DEPTH};
use fsapfs_pipeline::OpenOptions;

/// Configuration for opening a container
///
/// Volumes and walkers derived from the container inherit it.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Use memory mapping when opening by path
    pub use_mmap: bool,

    /// Verify the Fletcher-64 checksum of every metadata object read
    pub verify_checksums: bool,

    /// Maximum directory nesting followed by walkers
    pub max_traversal_depth: usize,

    /// Maximum number of records read from one directory
    pub max_directory_entries: usize,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            use_mmap: true,
            verify_checksums: true,
            max_traversal_depth: MAX_TRAVERSAL_DEPTH,
            max_directory_entries: MAX_DIRECTORY_ENTRIES,
        }
    }
}

impl ContainerConfig {
    /// Byte source options matching this configuration
    pub fn open_options(&self) -> OpenOptions {
        OpenOptions {
            use_mmap: self.use_mmap,
        }
    }
}

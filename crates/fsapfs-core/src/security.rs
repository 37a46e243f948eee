//! Security validation constants and helpers
//!
//! This module defines hard limits and validation functions applied while
//! decoding images that may be corrupted or hostile.

use crate::Error;
use std::path::{Path, PathBuf};

/// Smallest APFS block size
pub const MIN_BLOCK_SIZE: u32 = 4096;

/// Largest APFS block size
pub const MAX_BLOCK_SIZE: u32 = 65536;

/// Maximum allocation size for single buffer (256 MB)
pub const MAX_ALLOCATION_SIZE: usize = 256 * 1024 * 1024;

/// Maximum number of volume superblock pointers in a container superblock
pub const MAX_VOLUMES: usize = 100;

/// Maximum B-tree height followed during a lookup (prevents descent loops)
pub const MAX_BTREE_DEPTH: usize = 64;

/// Default bound on directory nesting during traversal
pub const MAX_TRAVERSAL_DEPTH: usize = 512;

/// Maximum directory entries to read in one operation
pub const MAX_DIRECTORY_ENTRIES: usize = 1_000_000;

/// Maximum file size to extract (1 GB)
pub const MAX_FILE_EXTRACT_SIZE: u64 = 1024 * 1024 * 1024;

/// Maximum key bag size (key bags span a handful of blocks)
pub const MAX_KEY_BAG_SIZE: u64 = 1024 * 1024;

/// Maximum file size for memory mapping (16 GB - practical limit for most systems)
pub const MAX_MMAP_SIZE: u64 = 16 * 1024 * 1024 * 1024;

/// Validate that a size is within allocation limits
///
/// # Security
/// Prevents memory exhaustion attacks from malicious disk images
pub fn validate_allocation_size(size: u64, limit: usize, context: &str) -> crate::Result<usize> {
    if size > limit as u64 {
        return Err(Error::corrupt(format!(
            "{} size {} exceeds limit {}",
            context, size, limit
        )));
    }

    size.try_into()
        .map_err(|_| Error::corrupt(format!("{} size exceeds platform limits", context)))
}

/// Safely multiply two u64 values with overflow checking
///
/// # Security
/// Prevents integer overflow in size calculations
pub fn checked_multiply_u64(a: u64, b: u64, context: &str) -> crate::Result<u64> {
    a.checked_mul(b)
        .ok_or_else(|| Error::corrupt(format!("{}: multiplication overflow", context)))
}

/// Safely convert u64 to usize with platform checking
pub fn u64_to_usize(value: u64, context: &str) -> crate::Result<usize> {
    value.try_into().map_err(|_| {
        Error::corrupt(format!(
            "{}: value {} exceeds platform usize limit",
            context, value
        ))
    })
}

/// Validate an APFS block size
pub fn validate_block_size(block_size: u32) -> crate::Result<()> {
    if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
        return Err(Error::corrupt(format!(
            "Invalid block size: {} (must be {}-{})",
            block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
        )));
    }

    if !block_size.is_power_of_two() {
        return Err(Error::corrupt(format!(
            "Block size {} is not a power of 2",
            block_size
        )));
    }

    Ok(())
}

/// Validate a path before opening it as a byte source
///
/// # Returns
/// Canonical absolute path if the path names a regular file
pub fn validate_file_path(path: &Path) -> crate::Result<PathBuf> {
    let text = path.to_string_lossy();

    if text.is_empty() {
        return Err(Error::invalid_argument("Empty path"));
    }

    if text.contains('\0') {
        return Err(Error::invalid_argument("Path contains null byte"));
    }

    let canonical = path.canonicalize().map_err(|e| {
        Error::not_found(format!("{}: {}", path.display(), e))
    })?;

    // Devices, pipes and directories have no stable size
    if !canonical.is_file() {
        return Err(Error::invalid_argument(format!(
            "Path is not a regular file: {}",
            canonical.display()
        )));
    }

    Ok(canonical)
}

/// Validate an index against a count
pub fn validate_index(index: usize, count: usize, context: &str) -> crate::Result<()> {
    if index >= count {
        return Err(Error::index_out_of_bounds(format!(
            "{} index {} out of range (count {})",
            context, index, count
        )));
    }
    Ok(())
}

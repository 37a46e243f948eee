//! Path based openers

use crate::{DataRange, FilePipeline, MmapPipeline};
use fsapfs_core::{validate_file_path, ByteSource, Result};
use std::fs::File;
use std::path::Path;

/// Options for opening an image file as a byte source
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Use memory mapping instead of buffered file reads
    pub use_mmap: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self { use_mmap: true }
    }
}

/// Open an image file as a byte source
///
/// Memory maps the file when `options.use_mmap` is set. Empty files and
/// files the platform refuses to map fall back to buffered reads.
///
/// # Errors
///
/// Path validation errors ([`fsapfs_core::Error::InvalidArgument`],
/// [`fsapfs_core::Error::NotFound`]) and I/O failures
pub fn open_source(path: &Path, options: &OpenOptions) -> Result<Box<dyn ByteSource>> {
    let path = validate_file_path(path)?;
    let file = File::open(&path)?;
    let length = file.metadata()?.len();

    if options.use_mmap && length > 0 {
        match MmapPipeline::from_file(&file) {
            Ok(pipeline) => return Ok(Box::new(pipeline)),
            Err(e) => {
                tracing::debug!("Falling back to buffered reads for {}: {}", path.display(), e);
            }
        }
    }

    Ok(Box::new(FilePipeline::from_file(file)?))
}

/// Open a data range of an image file as a byte source
///
/// The range offset becomes position 0 of the returned source.
pub fn open_range(
    path: &Path,
    range: DataRange,
    options: &OpenOptions,
) -> Result<Box<dyn ByteSource>> {
    let source = open_source(path, options)?;
    if range == DataRange::whole() {
        return Ok(source);
    }
    Ok(Box::new(range.apply(source)))
}

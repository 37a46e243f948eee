//! Memory-mapped pipeline

use fsapfs_core::{ByteSource, Error, Result, MAX_MMAP_SIZE};
use memmap2::Mmap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// A byte source backed by a read-only memory map of an image file.
///
/// # Example
///
/// ```rust,no_run
/// use fsapfs_pipeline::MmapPipeline;
/// use std::path::Path;
///
/// let pipeline = MmapPipeline::open(Path::new("container.raw")).unwrap();
/// ```
#[derive(Debug)]
pub struct MmapPipeline {
    mmap: Mmap,
    position: u64,
}

impl MmapPipeline {
    /// Map a file by path
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for non-regular files or files above
    /// [`MAX_MMAP_SIZE`], and [`Error::Io`] if the file cannot be mapped
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_file(&file)
    }

    /// Map an already open file
    ///
    /// # Safety
    ///
    /// Uses `unsafe` for memory mapping. The mapping is read-only and the
    /// file is checked to be a regular file first; the file must not be
    /// truncated by another process while mapped.
    pub fn from_file(file: &File) -> Result<Self> {
        let metadata = file.metadata()?;

        if !metadata.is_file() {
            return Err(Error::invalid_argument(
                "Only regular files can be memory-mapped",
            ));
        }

        if metadata.len() > MAX_MMAP_SIZE {
            return Err(Error::invalid_argument(format!(
                "File size {} exceeds memory mapping limit {}",
                metadata.len(),
                MAX_MMAP_SIZE
            )));
        }

        // SAFETY: regular file, bounded size, valid descriptor, read-only
        // private mapping.
        let mmap = unsafe { Mmap::map(file)? };
        Ok(Self { mmap, position: 0 })
    }

    /// Get the length of the mapped region
    pub fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Check if the mapped region is empty
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Get the current position
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Get remaining bytes from current position
    pub fn remaining(&self) -> u64 {
        self.len().saturating_sub(self.position)
    }

    /// Get a slice of the entire mapped data
    pub fn as_full_slice(&self) -> &[u8] {
        &self.mmap
    }
}

impl Read for MmapPipeline {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.remaining();
        if remaining == 0 {
            return Ok(0);
        }

        let to_read = (buf.len() as u64).min(remaining) as usize;
        let start = self.position as usize;

        buf[..to_read].copy_from_slice(&self.mmap[start..start + to_read]);
        self.position += to_read as u64;

        Ok(to_read)
    }
}

impl Seek for MmapPipeline {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::End(offset) => self.len() as i128 + offset as i128,
            SeekFrom::Current(offset) => self.position as i128 + offset as i128,
        };

        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Seek before beginning of file",
            ));
        }

        // Past EOF is allowed, reads there return nothing
        self.position = u64::try_from(new_pos).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "Seek offset overflows")
        })?;
        Ok(self.position)
    }
}

impl ByteSource for MmapPipeline {
    fn size(&self) -> u64 {
        self.len()
    }
}

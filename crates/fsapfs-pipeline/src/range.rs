//! Range pipeline - provides a window into a subset of a stream

use fsapfs_core::{ByteSource, Error, Result};
use std::io::{self, Read, Seek, SeekFrom};

/// Validated offset/size pair describing a data range
///
/// Offsets and sizes arrive as signed values from callers (command line
/// arguments, foreign bindings); construction rejects negative values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRange {
    offset: u64,
    size: Option<u64>,
}

impl DataRange {
    /// Create a range starting at `offset`, `size` bytes long or running to
    /// the end of the parent when `size` is `None`
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRange`] if the offset or size is negative
    pub fn new(offset: i64, size: Option<i64>) -> Result<Self> {
        if offset < 0 {
            return Err(Error::invalid_range(format!(
                "range offset {} is negative",
                offset
            )));
        }
        if let Some(size) = size {
            if size < 0 {
                return Err(Error::invalid_range(format!("range size {} is negative", size)));
            }
        }

        Ok(Self {
            offset: offset as u64,
            size: size.map(|s| s as u64),
        })
    }

    /// The whole parent
    pub fn whole() -> Self {
        Self { offset: 0, size: None }
    }

    /// Offset of the range in the parent
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Size of the range, `None` if it runs to the end of the parent
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Apply this range to a parent source
    pub fn apply<R: ByteSource>(&self, inner: R) -> RangePipeline<R> {
        RangePipeline::new(inner, self.offset, self.size)
    }
}

/// A pipeline that exposes only a portion of an underlying stream.
///
/// Presents an APFS partition inside a larger image as an independent
/// source without copying the data. Reads are truncated at the end of the
/// window; seeking past the end is allowed and subsequent reads return no
/// data.
///
/// # Example
///
/// ```rust
/// use fsapfs_pipeline::RangePipeline;
/// use fsapfs_core::ByteSource;
/// use std::io::Cursor;
///
/// let data = vec![0u8; 1024];
///
/// // View of bytes 512-767
/// let partial = RangePipeline::new(Cursor::new(data), 512, Some(256));
/// assert_eq!(partial.size(), 256);
/// ```
pub struct RangePipeline<R> {
    inner: R,
    start: u64,
    length: u64,
    bounded: bool,
    position: u64,
}

impl<R: ByteSource> RangePipeline<R> {
    /// Create a new range pipeline
    ///
    /// # Arguments
    ///
    /// * `inner` - The underlying stream
    /// * `start` - Offset from the beginning of the stream
    /// * `length` - Length of the window, or `None` to run to the end of
    ///   the stream
    pub fn new(inner: R, start: u64, length: Option<u64>) -> Self {
        let (length, bounded) = match length {
            Some(length) => (length, true),
            None => (inner.size().saturating_sub(start), false),
        };

        Self {
            inner,
            start,
            length,
            bounded,
            position: 0,
        }
    }

    /// Get the start offset of this window in the parent
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Get the length of this window
    pub fn length(&self) -> u64 {
        self.length
    }

    /// True if the length was configured rather than derived from the parent
    pub fn is_bounded(&self) -> bool {
        self.bounded
    }

    /// Get the current position within this window
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Get the remaining bytes from current position to end
    pub fn remaining(&self) -> u64 {
        self.length.saturating_sub(self.position)
    }

    /// Release the window and return the parent stream
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: ByteSource> Read for RangePipeline<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.remaining();
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }

        let to_read = (buf.len() as u64).min(remaining) as usize;

        let absolute_pos = self.start.checked_add(self.position).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "Range position overflows")
        })?;
        self.inner.seek(SeekFrom::Start(absolute_pos))?;

        let bytes_read = self.inner.read(&mut buf[..to_read])?;
        self.position += bytes_read as u64;

        Ok(bytes_read)
    }
}

impl<R: ByteSource> Seek for RangePipeline<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::End(offset) => self.length as i128 + offset as i128,
            SeekFrom::Current(offset) => self.position as i128 + offset as i128,
        };

        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Seek before beginning of range",
            ));
        }

        self.position = u64::try_from(new_pos).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "Seek offset overflows")
        })?;
        Ok(self.position)
    }
}

impl<R: ByteSource> ByteSource for RangePipeline<R> {
    fn size(&self) -> u64 {
        self.length
    }
}

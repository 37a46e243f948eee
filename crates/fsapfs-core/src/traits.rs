//! Core traits

use crate::{error::Result, types::Whence, Error};
use std::io::{self, Cursor, Read, Seek, SeekFrom};

/// Random-access byte range backing every parser
///
/// Implemented over whole files, memory maps and windows into other
/// sources. Reads at or past the end return no data rather than failing.
pub trait ByteSource: Read + Seek + Send {
    /// Size of the addressable range in bytes
    fn size(&self) -> u64;

    /// Read up to `max_bytes` from the current position
    ///
    /// Returns fewer bytes at the end of the range and an empty buffer at
    /// or past it.
    fn read_bytes(&mut self, max_bytes: usize) -> io::Result<Vec<u8>> {
        let mut data = Vec::new();
        Read::take(&mut *self, max_bytes as u64).read_to_end(&mut data)?;
        Ok(data)
    }

    /// Fill `buf` from an absolute offset
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf)
    }

    /// Seek relative to `whence`
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOffset`] if the resulting absolute offset
    /// would be negative or overflows.
    fn seek_to(&mut self, offset: i64, whence: Whence) -> Result<u64> {
        let base = match whence {
            Whence::Start => 0i128,
            Whence::Current => self.stream_position()? as i128,
            Whence::End => self.size() as i128,
        };
        let target = base + offset as i128;

        if target < 0 {
            return Err(Error::invalid_offset(format!(
                "offset {} relative to {:?} resolves to {}",
                offset, whence, target
            )));
        }
        let target = u64::try_from(target)
            .map_err(|_| Error::invalid_offset(format!("offset {} overflows", target)))?;

        Ok(self.seek(SeekFrom::Start(target))?)
    }
}

impl<T: AsRef<[u8]> + Send> ByteSource for Cursor<T> {
    fn size(&self) -> u64 {
        self.get_ref().as_ref().len() as u64
    }
}

impl<B: ByteSource + ?Sized> ByteSource for Box<B> {
    fn size(&self) -> u64 {
        (**self).size()
    }
}

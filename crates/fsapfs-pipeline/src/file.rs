//! Plain file pipeline

use fsapfs_core::{ByteSource, Result};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

/// A byte source reading through a buffered file handle
///
/// Used where memory mapping is disabled or unavailable. The length is
/// captured when the file is opened.
pub struct FilePipeline {
    reader: BufReader<File>,
    length: u64,
}

impl FilePipeline {
    /// Open a file by path
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_file(file)
    }

    /// Wrap an already open file
    pub fn from_file(file: File) -> Result<Self> {
        let length = file.metadata()?.len();
        Ok(Self {
            reader: BufReader::new(file),
            length,
        })
    }
}

impl Read for FilePipeline {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for FilePipeline {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl ByteSource for FilePipeline {
    fn size(&self) -> u64 {
        self.length
    }
}

//! Signature checks
//!
//! Cheap checks for the superblock magic that do not decode anything else.

use crate::superblock::{APFS_MAGIC, MAGIC_OFFSET, NX_MAGIC};
use fsapfs_core::{ByteSource, Result};
use fsapfs_pipeline::{open_source, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::Path;

fn has_magic<S: ByteSource + ?Sized>(source: &mut S, magic: &[u8; 4]) -> Result<bool> {
    if source.size() < (MAGIC_OFFSET + magic.len()) as u64 {
        return Ok(false);
    }

    let position = source.stream_position()?;
    source.seek(SeekFrom::Start(MAGIC_OFFSET as u64))?;
    let found = source.read_bytes(magic.len());
    source.seek(SeekFrom::Start(position))?;

    Ok(found? == magic)
}

/// Check whether a source starts with an APFS container superblock
///
/// Sources too small to hold the magic are not containers. The position of
/// the source is left unchanged.
pub fn check_signature<S: ByteSource + ?Sized>(source: &mut S) -> Result<bool> {
    has_magic(source, NX_MAGIC)
}

/// Check whether a file starts with an APFS container superblock
pub fn check_signature_path(path: impl AsRef<Path>) -> Result<bool> {
    let mut source = open_source(path.as_ref(), &OpenOptions { use_mmap: false })?;
    check_signature(&mut source)
}

/// Check whether a source starts with an APFS volume superblock
pub fn check_volume_signature<S: ByteSource + ?Sized>(source: &mut S) -> Result<bool> {
    has_magic(source, APFS_MAGIC)
}

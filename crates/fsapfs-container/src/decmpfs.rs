//! Transparently compressed file content
//!
//! A compressed inode carries the `UF_COMPRESSED` flag and a
//! `com.apple.decmpfs` attribute starting with a 16-byte header: the
//! signature "fpmc", the compression method and the uncompressed size.
//! Small files keep the compressed bytes after the header; larger ones
//! keep them in the `com.apple.ResourceFork` attribute as a table of
//! independently compressed 64 KiB chunks.

use crate::object::{le_u32, le_u64, slice};
use flate2::read::ZlibDecoder;
use fsapfs_core::{u64_to_usize, Error, Result};
use std::io::Read;

pub const DECMPFS_SIGNATURE: &[u8; 4] = b"fpmc";

/// Attribute holding the chunks of resource fork compressed content
pub const RESOURCE_FORK_XATTR_NAME: &str = "com.apple.ResourceFork";

/// zlib data following the header
pub const COMPRESSION_ZLIB_INLINE: u32 = 3;
/// zlib chunks in the resource fork
pub const COMPRESSION_ZLIB_RESOURCE: u32 = 4;

pub const DECMPFS_HEADER_SIZE: usize = 16;

/// Uncompressed size of every resource fork chunk but the last
pub const CHUNK_SIZE: usize = 65536;

/// Header of the `com.apple.decmpfs` attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionHeader {
    pub method: u32,
    pub uncompressed_size: u64,
}

impl CompressionHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let header = slice(data, 0, DECMPFS_HEADER_SIZE, "Compression header")?;
        if &header[..4] != DECMPFS_SIGNATURE {
            return Err(Error::signature("Compression header signature is not fpmc"));
        }
        Ok(Self {
            method: le_u32(header, 4),
            uncompressed_size: le_u64(header, 8),
        })
    }

    pub fn in_resource_fork(&self) -> bool {
        self.method == COMPRESSION_ZLIB_RESOURCE
    }

    /// Fail for methods other than the zlib ones
    pub fn check_supported(&self) -> Result<()> {
        match self.method {
            COMPRESSION_ZLIB_INLINE | COMPRESSION_ZLIB_RESOURCE => Ok(()),
            7 | 8 => Err(Error::not_supported("LZVN compressed content")),
            11 | 12 => Err(Error::not_supported("LZFSE compressed content")),
            other => Err(Error::not_supported(format!("Compression method {}", other))),
        }
    }
}

/// Decode content stored after the header of the decmpfs attribute
pub fn decompress_inline(header: &CompressionHeader, attribute: &[u8]) -> Result<Vec<u8>> {
    let size = u64_to_usize(header.uncompressed_size, "Compressed content size")?;
    let data = attribute.get(DECMPFS_HEADER_SIZE..).unwrap_or_default();
    let mut out = decode_block(data, size)?;
    if out.len() < size {
        return Err(Error::corrupt(format!(
            "Inline compressed content holds {} of {} bytes",
            out.len(),
            size
        )));
    }
    out.truncate(size);
    Ok(out)
}

/// Decode content stored as a chunk table in the resource fork
///
/// The fork starts with a big-endian offset to its resource data. The data
/// begins with a 32-bit length, followed by the chunk count and one
/// offset/size pair per chunk, with offsets relative to the count.
pub fn decompress_resource_fork(header: &CompressionHeader, fork: &[u8]) -> Result<Vec<u8>> {
    let size = u64_to_usize(header.uncompressed_size, "Compressed content size")?;
    let head = slice(fork, 0, 4, "Resource fork header")?;
    let data_offset = u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as usize;

    let table = data_offset
        .checked_add(4)
        .ok_or_else(|| Error::corrupt("Resource fork data offset overflows"))?;
    let count = le_u32(slice(fork, table, 4, "Chunk count")?, 0) as usize;
    let needed = size.div_ceil(CHUNK_SIZE);
    if count < needed {
        return Err(Error::corrupt(format!(
            "Resource fork has {} chunks for {} bytes of content",
            count, size
        )));
    }
    let entries = slice(fork, table + 4, needed * 8, "Chunk table")?;

    let mut out = Vec::with_capacity(size);
    for index in 0..needed {
        let offset = le_u32(entries, index * 8) as usize;
        let length = le_u32(entries, index * 8 + 4) as usize;
        let start = table
            .checked_add(offset)
            .ok_or_else(|| Error::corrupt("Chunk offset overflows"))?;
        let chunk = slice(fork, start, length, "Compressed chunk")?;

        let expected = CHUNK_SIZE.min(size - out.len());
        let data = decode_block(chunk, CHUNK_SIZE)?;
        if data.len() < expected {
            return Err(Error::corrupt(format!(
                "Chunk {} decodes to {} bytes, expected {}",
                index,
                data.len(),
                expected
            )));
        }
        out.extend_from_slice(&data[..expected]);
    }

    tracing::trace!("Decoded {} chunks into {} bytes", needed, out.len());
    Ok(out)
}

/// Decode one block, bounded by `limit` output bytes
///
/// A first byte with all low bits set marks data stored uncompressed.
fn decode_block(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    match data.first() {
        None => Ok(Vec::new()),
        Some(marker) if marker & 0x0f == 0x0f => {
            let raw = &data[1..];
            Ok(raw[..raw.len().min(limit)].to_vec())
        }
        Some(_) => {
            let mut out = Vec::new();
            ZlibDecoder::new(data)
                .take(limit as u64)
                .read_to_end(&mut out)
                .map_err(|e| Error::corrupt(format!("Unable to decompress zlib data: {}", e)))?;
            Ok(out)
        }
    }
}

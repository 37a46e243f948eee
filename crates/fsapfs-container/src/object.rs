//! Object header and checksum
//!
//! Every APFS metadata block starts with a 32-byte object header carrying a
//! Fletcher-64 checksum of the rest of the object.

use fsapfs_core::{Error, Result};

/// Size of the object header
pub const OBJECT_HEADER_SIZE: usize = 32;

/// Mask selecting the object type from the type field
pub const OBJECT_TYPE_MASK: u32 = 0x0000_ffff;

pub const OBJECT_TYPE_NX_SUPERBLOCK: u32 = 0x0001;
pub const OBJECT_TYPE_BTREE: u32 = 0x0002;
pub const OBJECT_TYPE_BTREE_NODE: u32 = 0x0003;
pub const OBJECT_TYPE_OMAP: u32 = 0x000b;
pub const OBJECT_TYPE_FS: u32 = 0x000d;
pub const OBJECT_TYPE_FSTREE: u32 = 0x000e;
pub const OBJECT_TYPE_SNAP_META_TREE: u32 = 0x0010;

/// Container key bag, "keys" as a big-endian tag
pub const OBJECT_TYPE_CONTAINER_KEYBAG: u32 = 0x6b65_7973;
/// Volume key bag, "recs" as a big-endian tag
pub const OBJECT_TYPE_VOLUME_KEYBAG: u32 = 0x7265_6373;

/// Decoded object header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    /// Stored Fletcher-64 checksum
    pub checksum: u64,
    /// Object identifier
    pub oid: u64,
    /// Transaction identifier of the last modification
    pub xid: u64,
    /// Type and storage flags
    pub object_type: u32,
    /// Subtype (tree contents for B-tree nodes)
    pub subtype: u32,
}

impl ObjectHeader {
    /// Parse an object header from the start of a block
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < OBJECT_HEADER_SIZE {
            return Err(Error::corrupt("Object header too short"));
        }

        Ok(Self {
            checksum: le_u64(data, 0),
            oid: le_u64(data, 8),
            xid: le_u64(data, 16),
            object_type: le_u32(data, 24),
            subtype: le_u32(data, 28),
        })
    }

    /// Object type without storage flags
    pub fn kind(&self) -> u32 {
        self.object_type & OBJECT_TYPE_MASK
    }
}

/// Compute the Fletcher-64 checksum of an object
///
/// The first eight bytes (the stored checksum) are skipped and the rest is
/// summed as little-endian 32-bit words.
pub fn fletcher64(data: &[u8]) -> u64 {
    const MODULUS: u64 = 0xffff_ffff;

    let mut lower: u64 = 0;
    let mut upper: u64 = 0;

    for word in data.get(8..).unwrap_or_default().chunks_exact(4) {
        lower = lower.wrapping_add(u32::from_le_bytes([word[0], word[1], word[2], word[3]]) as u64);
        upper = upper.wrapping_add(lower);
    }

    lower %= MODULUS;
    upper %= MODULUS;

    let check_low = MODULUS - ((lower + upper) % MODULUS);
    let check_high = MODULUS - ((lower + check_low) % MODULUS);

    (check_high << 32) | check_low
}

/// Verify the stored checksum of an object
pub fn verify_checksum(data: &[u8]) -> Result<()> {
    let header = ObjectHeader::parse(data)?;
    let calculated = fletcher64(data);

    if header.checksum != calculated {
        return Err(Error::ChecksumVerification(format!(
            "object {} (type 0x{:08x}): stored 0x{:016x}, calculated 0x{:016x}",
            header.oid, header.object_type, header.checksum, calculated
        )));
    }
    Ok(())
}

/// Compute and store the checksum of an object in place
#[cfg(test)]
pub fn seal_checksum(data: &mut [u8]) {
    if data.len() < OBJECT_HEADER_SIZE {
        return;
    }
    let checksum = fletcher64(data);
    data[0..8].copy_from_slice(&checksum.to_le_bytes());
}

/// Physical range of blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PhysicalRange {
    /// First block
    pub start: u64,
    /// Number of blocks
    pub count: u64,
}

impl PhysicalRange {
    pub const SIZE: usize = 16;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::corrupt("Physical range too short"));
        }
        Ok(Self {
            start: le_u64(data, 0),
            count: le_u64(data, 8),
        })
    }

    /// True if the range covers no blocks
    pub fn is_empty(&self) -> bool {
        self.start == 0 || self.count == 0
    }
}

// Little-endian readers. Callers check lengths before calling.

pub(crate) fn le_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

pub(crate) fn le_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

pub(crate) fn le_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

/// Bounds-checked sub-slice
pub(crate) fn slice<'a>(data: &'a [u8], offset: usize, len: usize, context: &str) -> Result<&'a [u8]> {
    offset
        .checked_add(len)
        .and_then(|end| data.get(offset..end))
        .ok_or_else(|| {
            Error::corrupt(format!(
                "{}: {} bytes at offset {} outside of {} byte buffer",
                context,
                len,
                offset,
                data.len()
            ))
        })
}

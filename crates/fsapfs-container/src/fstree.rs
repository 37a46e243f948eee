//! File system tree records
//!
//! Every record key starts with a 64-bit header: the object identifier in
//! the low 60 bits and the record type in the high 4 bits. Records of one
//! object sort together, ordered by type.

use crate::object::{le_u16, le_u32, le_u64, slice};
use crate::superblock::c_string;
use fsapfs_core::{Error, Result};
use std::cmp::Ordering;

pub const OBJ_ID_MASK: u64 = 0x0fff_ffff_ffff_ffff;
pub const OBJ_TYPE_SHIFT: u32 = 60;

pub const APFS_TYPE_SNAP_METADATA: u8 = 1;
pub const APFS_TYPE_INODE: u8 = 3;
pub const APFS_TYPE_XATTR: u8 = 4;
pub const APFS_TYPE_FILE_EXTENT: u8 = 8;
pub const APFS_TYPE_DIR_REC: u8 = 9;

/// Inode number of the root directory
pub const ROOT_DIR_INO_NUM: u64 = 2;

/// Inode extended field: file name
pub const INO_EXT_TYPE_NAME: u8 = 4;
/// Inode extended field: data stream
pub const INO_EXT_TYPE_DSTREAM: u8 = 8;

/// BSD flag: content is stored compressed
pub const UF_COMPRESSED: u32 = 0x0000_0020;

/// Extended attribute flag: data lives in a separate data stream
pub const XATTR_DATA_STREAM: u16 = 0x0001;
/// Extended attribute flag: data is embedded in the record
pub const XATTR_DATA_EMBEDDED: u16 = 0x0002;

/// Attribute holding the target of a symbolic link
pub const SYMLINK_XATTR_NAME: &str = "com.apple.fs.symlink";
/// Attribute holding compressed content
pub const DECMPFS_XATTR_NAME: &str = "com.apple.decmpfs";

const INODE_VALUE_SIZE: usize = 92;
const DIR_REC_VALUE_SIZE: usize = 18;
const FILE_EXTENT_LEN_MASK: u64 = 0x00ff_ffff_ffff_ffff;

/// Compose a record key header
#[cfg(test)]
pub fn key_header(oid: u64, kind: u8) -> u64 {
    (oid & OBJ_ID_MASK) | ((kind as u64) << OBJ_TYPE_SHIFT)
}

/// Split a record key header into identifier and type
pub fn split_key_header(key: &[u8]) -> Result<(u64, u8)> {
    if key.len() < 8 {
        return Err(Error::corrupt("File system record key too short"));
    }
    let header = le_u64(key, 0);
    Ok((header & OBJ_ID_MASK, (header >> OBJ_TYPE_SHIFT) as u8))
}

/// Order keys relative to all records of one type for one object
pub fn key_range(oid: u64, kind: u8) -> impl Fn(&[u8]) -> Ordering {
    move |key: &[u8]| match split_key_header(key) {
        Ok((key_oid, key_kind)) => (key_oid, key_kind).cmp(&(oid, kind)),
        // Malformed keys are skipped rather than matched
        Err(_) => Ordering::Less,
    }
}

/// Extended fields trailing inode and directory record values
fn parse_xfields(data: &[u8]) -> Result<Vec<(u8, &[u8])>> {
    if data.len() < 4 {
        return Ok(Vec::new());
    }
    let count = le_u16(data, 0) as usize;
    let mut fields = Vec::with_capacity(count);

    let headers = slice(data, 4, count * 4, "Extended field headers")?;
    let mut offset = 4 + count * 4;

    for index in 0..count {
        let kind = headers[index * 4];
        let size = le_u16(headers, index * 4 + 2) as usize;
        fields.push((kind, slice(data, offset, size, "Extended field")?));
        offset += (size + 7) & !7;
    }
    Ok(fields)
}

/// Data stream of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataStream {
    pub size: u64,
}

impl DataStream {
    fn parse(data: &[u8]) -> Result<Self> {
        let data = slice(data, 0, 8, "Data stream")?;
        Ok(Self { size: le_u64(data, 0) })
    }
}

/// Inode record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub identifier: u64,
    pub parent_identifier: u64,
    /// Identifier of the data stream (keys the file extents)
    pub private_identifier: u64,
    pub creation_time: u64,
    pub modification_time: u64,
    pub change_time: u64,
    pub access_time: u64,
    pub bsd_flags: u32,
    pub owner: u32,
    pub group: u32,
    pub mode: u16,
    pub name: Option<String>,
    pub data_stream: Option<DataStream>,
}

impl Inode {
    /// Parse an inode value
    pub fn parse(identifier: u64, value: &[u8]) -> Result<Self> {
        if value.len() < INODE_VALUE_SIZE {
            return Err(Error::corrupt(format!("Inode {} value too short", identifier)));
        }

        let mut inode = Self {
            identifier,
            parent_identifier: le_u64(value, 0),
            private_identifier: le_u64(value, 8),
            creation_time: le_u64(value, 16),
            modification_time: le_u64(value, 24),
            change_time: le_u64(value, 32),
            access_time: le_u64(value, 40),
            bsd_flags: le_u32(value, 68),
            owner: le_u32(value, 72),
            group: le_u32(value, 76),
            mode: le_u16(value, 80),
            name: None,
            data_stream: None,
        };

        for (kind, data) in parse_xfields(&value[INODE_VALUE_SIZE..])? {
            match kind {
                INO_EXT_TYPE_NAME => inode.name = Some(c_string(data)),
                INO_EXT_TYPE_DSTREAM => inode.data_stream = Some(DataStream::parse(data)?),
                _ => {}
            }
        }

        Ok(inode)
    }

    /// Logical size of the file data
    pub fn size(&self) -> u64 {
        self.data_stream.map(|s| s.size).unwrap_or(0)
    }

    pub fn is_compressed(&self) -> bool {
        self.bsd_flags & UF_COMPRESSED != 0
    }
}

/// Directory record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryRecord {
    pub name: String,
    pub file_identifier: u64,
    pub date_added: u64,
    /// `DT_*` type of the target
    pub dirent_type: u16,
}

impl DirectoryRecord {
    /// Parse a directory record
    ///
    /// Keys come in two forms: with a 32-bit length-and-hash field on
    /// case- or normalization-insensitive volumes (`hashed`), otherwise
    /// with a plain 16-bit length.
    pub fn parse(key: &[u8], value: &[u8], hashed: bool) -> Result<Self> {
        split_key_header(key)?;
        if key.len() < 10 {
            return Err(Error::corrupt("Directory record key too short"));
        }

        let (name_length, name_offset) = if hashed {
            let field = le_u32(slice(key, 8, 4, "Directory record name hash")?, 0);
            ((field & 0x0000_03ff) as usize, 12)
        } else {
            (le_u16(key, 8) as usize, 10)
        };
        let name = c_string(slice(key, name_offset, name_length, "Directory record name")?);

        if value.len() < DIR_REC_VALUE_SIZE {
            return Err(Error::corrupt("Directory record value too short"));
        }

        Ok(Self {
            name,
            file_identifier: le_u64(value, 0),
            date_added: le_u64(value, 8),
            dirent_type: le_u16(value, 16) & 0x000f,
        })
    }
}

/// File extent record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileExtent {
    /// Offset of the extent in the file
    pub logical_offset: u64,
    /// Length in bytes
    pub length: u64,
    /// First physical block, zero for a sparse extent
    pub physical_block: u64,
    /// Encryption tweak base
    pub crypto_id: u64,
}

impl FileExtent {
    pub fn parse(key: &[u8], value: &[u8]) -> Result<Self> {
        if key.len() < 16 || value.len() < 24 {
            return Err(Error::corrupt("File extent record too short"));
        }
        Ok(Self {
            logical_offset: le_u64(key, 8),
            length: le_u64(value, 0) & FILE_EXTENT_LEN_MASK,
            physical_block: le_u64(value, 8),
            crypto_id: le_u64(value, 16),
        })
    }

    pub fn is_sparse(&self) -> bool {
        self.physical_block == 0
    }
}

/// Extended attribute record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedAttribute {
    pub name: String,
    pub flags: u16,
    /// Embedded data, or the data stream reference for streamed attributes
    pub data: Vec<u8>,
}

impl ExtendedAttribute {
    pub fn parse(key: &[u8], value: &[u8]) -> Result<Self> {
        if key.len() < 10 || value.len() < 4 {
            return Err(Error::corrupt("Extended attribute record too short"));
        }
        let name_length = le_u16(key, 8) as usize;
        let name = c_string(slice(key, 10, name_length, "Extended attribute name")?);

        let flags = le_u16(value, 0);
        let data_length = le_u16(value, 2) as usize;
        let data = slice(value, 4, data_length, "Extended attribute data")?.to_vec();

        Ok(Self { name, flags, data })
    }

    pub fn is_embedded(&self) -> bool {
        self.flags & XATTR_DATA_EMBEDDED != 0
    }

    pub fn is_stream(&self) -> bool {
        self.flags & XATTR_DATA_STREAM != 0
    }
}

/// Data stream reference of a streamed extended attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XattrStream {
    /// Identifier keying the stream's file extents
    pub identifier: u64,
    pub size: u64,
}

impl XattrStream {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let data = slice(data, 0, 16, "Extended attribute stream")?;
        Ok(Self {
            identifier: le_u64(data, 0),
            size: le_u64(data, 8),
        })
    }
}

/// Snapshot metadata record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMetadata {
    /// Transaction identifier of the snapshot
    pub xid: u64,
    pub superblock_oid: u64,
    pub creation_time: u64,
    pub name: String,
}

impl SnapshotMetadata {
    pub fn parse(key: &[u8], value: &[u8]) -> Result<Self> {
        let (xid, _) = split_key_header(key)?;
        if value.len() < 50 {
            return Err(Error::corrupt("Snapshot metadata record too short"));
        }
        let name_length = le_u16(value, 48) as usize;
        let name = c_string(slice(value, 50, name_length, "Snapshot name")?);

        Ok(Self {
            xid,
            superblock_oid: le_u64(value, 8),
            creation_time: le_u64(value, 16),
            name,
        })
    }
}

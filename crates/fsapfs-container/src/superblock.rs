//! Container and volume superblocks

use crate::object::{le_u16, le_u32, le_u64, ObjectHeader, PhysicalRange};
use fsapfs_core::{validate_block_size, Error, Result, MAX_VOLUMES};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Container superblock magic "NXSB"
pub const NX_MAGIC: &[u8; 4] = b"NXSB";

/// Volume superblock magic "APSB"
pub const APFS_MAGIC: &[u8; 4] = b"APSB";

/// Offset of the magic in both superblocks
pub const MAGIC_OFFSET: usize = 32;

/// Size of the decoded part of the container superblock
pub const NX_SUPERBLOCK_SIZE: usize = 1320;

/// Size of the decoded part of the volume superblock
pub const APFS_SUPERBLOCK_SIZE: usize = 968;

/// Descriptor area block count flag: area is a B-tree, not contiguous
const XP_DESC_BLOCKS_NON_CONTIGUOUS: u32 = 0x8000_0000;

/// Decoded container superblock
#[derive(Debug, Clone)]
pub struct NxSuperblock {
    pub header: ObjectHeader,
    pub block_size: u32,
    pub block_count: u64,
    pub uuid: Uuid,
    pub xp_desc_blocks: u32,
    pub xp_desc_base: u64,
    pub omap_oid: u64,
    /// Virtual identifiers of the volume superblocks, in slot order
    pub volume_oids: Vec<u64>,
    pub keylocker: PhysicalRange,
}

impl NxSuperblock {
    /// Parse a container superblock
    ///
    /// # Errors
    ///
    /// [`Error::Signature`] if the magic does not match, [`Error::Corrupt`]
    /// for an implausible block size.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < MAGIC_OFFSET + 4 || &data[MAGIC_OFFSET..MAGIC_OFFSET + 4] != NX_MAGIC {
            return Err(Error::signature("Container superblock magic is not NXSB"));
        }
        if data.len() < NX_SUPERBLOCK_SIZE {
            return Err(Error::corrupt("Container superblock too short"));
        }

        let header = ObjectHeader::parse(data)?;
        let block_size = le_u32(data, 36);
        validate_block_size(block_size)?;

        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&data[72..88]);

        let max_file_systems = le_u32(data, 180) as usize;

        // Occupied slots are packed at the front of the array
        let volume_oids = (0..MAX_VOLUMES.min(max_file_systems))
            .map(|slot| le_u64(data, 184 + slot * 8))
            .take_while(|oid| *oid != 0)
            .collect::<Vec<_>>();

        Ok(Self {
            header,
            block_size,
            block_count: le_u64(data, 40),
            uuid: Uuid::from_bytes(uuid),
            xp_desc_blocks: le_u32(data, 104),
            xp_desc_base: le_u64(data, 112),
            omap_oid: le_u64(data, 160),
            volume_oids,
            keylocker: PhysicalRange::parse(&data[1296..1312])?,
        })
    }

    /// Transaction identifier of this superblock
    pub fn xid(&self) -> u64 {
        self.header.xid
    }

    /// Container size in bytes
    pub fn container_size(&self) -> u64 {
        self.block_count.saturating_mul(self.block_size as u64)
    }

    /// True if the checkpoint descriptor area is a contiguous block run
    pub fn has_contiguous_descriptor_area(&self) -> bool {
        self.xp_desc_blocks & XP_DESC_BLOCKS_NON_CONTIGUOUS == 0
    }

    /// Number of blocks in the checkpoint descriptor area
    pub fn descriptor_block_count(&self) -> u32 {
        self.xp_desc_blocks & !XP_DESC_BLOCKS_NON_CONTIGUOUS
    }
}

/// Volume flag: the volume is not encrypted
pub const APFS_FS_UNENCRYPTED: u64 = 0x0000_0001;

/// Incompatible feature: names compare case-insensitively
pub const APFS_INCOMPAT_CASE_INSENSITIVE: u64 = 0x0000_0001;
/// Incompatible feature: names compare normalization-insensitively
pub const APFS_INCOMPAT_NORMALIZATION_INSENSITIVE: u64 = 0x0000_0008;

/// Feature flags of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VolumeFeatures {
    pub compatible: u64,
    pub readonly_compatible: u64,
    pub incompatible: u64,
}

impl VolumeFeatures {
    pub fn is_case_insensitive(&self) -> bool {
        self.incompatible & APFS_INCOMPAT_CASE_INSENSITIVE != 0
    }

    pub fn is_normalization_insensitive(&self) -> bool {
        self.incompatible & APFS_INCOMPAT_NORMALIZATION_INSENSITIVE != 0
    }

    /// Directory record keys carry a name hash on these volumes
    pub fn has_hashed_names(&self) -> bool {
        self.is_case_insensitive() || self.is_normalization_insensitive()
    }
}

/// Role of a volume within the container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeRole {
    None,
    System,
    User,
    Recovery,
    VirtualMemory,
    Preboot,
    Installer,
    Data,
    Baseband,
    Update,
    Xart,
    Hardware,
    Backup,
    Other(u16),
}

impl VolumeRole {
    pub fn from_raw(role: u16) -> Self {
        match role {
            0x0000 => VolumeRole::None,
            0x0001 => VolumeRole::System,
            0x0002 => VolumeRole::User,
            0x0004 => VolumeRole::Recovery,
            0x0008 => VolumeRole::VirtualMemory,
            0x0010 => VolumeRole::Preboot,
            0x0020 => VolumeRole::Installer,
            0x0040 => VolumeRole::Data,
            0x0080 => VolumeRole::Baseband,
            0x00c0 => VolumeRole::Update,
            0x0100 => VolumeRole::Xart,
            0x0140 => VolumeRole::Hardware,
            0x0180 => VolumeRole::Backup,
            other => VolumeRole::Other(other),
        }
    }
}

/// Decoded volume superblock
#[derive(Debug, Clone)]
pub struct ApfsSuperblock {
    pub features: VolumeFeatures,
    /// Physical block of the volume object map
    pub omap_oid: u64,
    /// Virtual identifier of the file system tree root
    pub root_tree_oid: u64,
    /// Physical block of the snapshot metadata tree root
    pub snap_meta_tree_oid: u64,
    pub next_obj_id: u64,
    pub num_snapshots: u64,
    pub uuid: Uuid,
    pub last_modified_time: u64,
    pub fs_flags: u64,
    pub formatted_by: String,
    pub volume_name: String,
    pub role: u16,
}

impl ApfsSuperblock {
    /// Parse a volume superblock
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < MAGIC_OFFSET + 4 || &data[MAGIC_OFFSET..MAGIC_OFFSET + 4] != APFS_MAGIC {
            return Err(Error::signature("Volume superblock magic is not APSB"));
        }
        if data.len() < APFS_SUPERBLOCK_SIZE {
            return Err(Error::corrupt("Volume superblock too short"));
        }

        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&data[240..256]);

        Ok(Self {
            features: VolumeFeatures {
                compatible: le_u64(data, 40),
                readonly_compatible: le_u64(data, 48),
                incompatible: le_u64(data, 56),
            },
            omap_oid: le_u64(data, 128),
            root_tree_oid: le_u64(data, 136),
            snap_meta_tree_oid: le_u64(data, 152),
            next_obj_id: le_u64(data, 176),
            num_snapshots: le_u64(data, 216),
            uuid: Uuid::from_bytes(uuid),
            last_modified_time: le_u64(data, 256),
            fs_flags: le_u64(data, 264),
            formatted_by: c_string(&data[272..304]),
            volume_name: c_string(&data[704..960]),
            role: le_u16(data, 964),
        })
    }

    /// True unless the volume is flagged as unencrypted
    pub fn is_encrypted(&self) -> bool {
        self.fs_flags & APFS_FS_UNENCRYPTED == 0
    }
}

/// Decode a NUL-terminated UTF-8 field
pub(crate) fn c_string(data: &[u8]) -> String {
    let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

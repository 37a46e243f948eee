//! Object maps
//!
//! Virtual object identifiers resolve to physical blocks through an object
//! map: a B-tree keyed by (identifier, transaction) whose values give the
//! block address of each version of the object.

use crate::btree::{check_node_kind, collect_range, BTreeNode, FixedLayout, PhysicalNodes};
use crate::object::{le_u32, le_u64, OBJECT_TYPE_OMAP};
use crate::reader::BlockReader;
use fsapfs_core::{Error, Result};

/// Object map entry flag: the mapped object is encrypted
pub const OMAP_VAL_ENCRYPTED: u32 = 0x0000_0001;

const OMAP_LAYOUT: FixedLayout = FixedLayout {
    key_size: 16,
    value_size: 16,
};

/// Physical location of one version of a virtual object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OmapMapping {
    /// Transaction that wrote this version
    pub xid: u64,
    pub flags: u32,
    /// Block address of the object
    pub paddr: u64,
}

impl OmapMapping {
    pub fn is_encrypted(&self) -> bool {
        self.flags & OMAP_VAL_ENCRYPTED != 0
    }
}

/// Loaded object map header
#[derive(Debug, Clone)]
pub struct ObjectMap {
    pub snapshot_count: u32,
    /// Block of the mapping tree root
    pub tree_oid: u64,
}

impl ObjectMap {
    /// Read the object map header at a physical block
    pub fn load(reader: &BlockReader, paddr: u64) -> Result<Self> {
        let (_, data) = reader.read_object(paddr, Some(OBJECT_TYPE_OMAP))?;
        if data.len() < 56 {
            return Err(Error::corrupt("Object map too short"));
        }

        let map = Self {
            snapshot_count: le_u32(&data, 36),
            tree_oid: le_u64(&data, 48),
        };
        tracing::debug!(
            "Object map at block {} with tree at {} and {} snapshots",
            paddr,
            map.tree_oid,
            map.snapshot_count
        );
        Ok(map)
    }

    /// Resolve a virtual identifier as of a transaction
    ///
    /// Picks the newest version written at or before `xid`.
    pub fn lookup(&self, reader: &BlockReader, oid: u64, xid: u64) -> Result<Option<OmapMapping>> {
        let nodes = PhysicalNodes::new(reader, Some(OMAP_LAYOUT));
        let (header, data) = reader.read_object(self.tree_oid, None)?;
        check_node_kind(&header, self.tree_oid)?;
        let root = BTreeNode::parse(&data, Some(OMAP_LAYOUT))?;

        let versions = collect_range(&nodes, root, |key| le_u64(key, 0).cmp(&oid), usize::MAX)?;

        let mut best: Option<OmapMapping> = None;
        for record in versions {
            if record.key.len() < 16 || record.value.len() < 16 {
                return Err(Error::corrupt("Object map record too short"));
            }
            let version = le_u64(&record.key, 8);
            if version > xid {
                continue;
            }
            if best.map_or(true, |b| version > b.xid) {
                best = Some(OmapMapping {
                    xid: version,
                    flags: le_u32(&record.value, 0),
                    paddr: le_u64(&record.value, 8),
                });
            }
        }

        tracing::trace!("Object map lookup {} at xid {}: {:?}", oid, xid, best);
        Ok(best)
    }

    /// Resolve a virtual identifier, failing if it is not mapped
    pub fn resolve(&self, reader: &BlockReader, oid: u64, xid: u64) -> Result<OmapMapping> {
        self.lookup(reader, oid, xid)?.ok_or_else(|| {
            Error::corrupt(format!("Virtual object {} not in object map at xid {}", oid, xid))
        })
    }
}

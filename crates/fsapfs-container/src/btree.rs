//! B-tree nodes and range search
//!
//! Object maps, the snapshot metadata tree and the file system tree share
//! one on-disk node format. Nodes carry a table of contents pointing into a
//! key area growing up from the header and a value area growing down from
//! the end of the node (or from the start of the trailing tree info in the
//! root node).

use crate::object::{
    le_u16, le_u32, le_u64, slice, ObjectHeader, OBJECT_TYPE_BTREE, OBJECT_TYPE_BTREE_NODE,
};
use crate::reader::BlockReader;
use fsapfs_core::{Error, Result, MAX_BTREE_DEPTH};
use std::cmp::Ordering;

pub const BTNODE_ROOT: u16 = 0x0001;
pub const BTNODE_LEAF: u16 = 0x0002;
pub const BTNODE_FIXED_KV_SIZE: u16 = 0x0004;

/// Size of the node header including the object header
pub const BTREE_NODE_HEADER_SIZE: usize = 56;

/// Size of the tree info trailing the root node
pub const BTREE_INFO_SIZE: usize = 40;

/// Offset marking a record without value
const VALUE_OFFSET_INVALID: u16 = 0xffff;

/// Key and value sizes of trees using fixed-size records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedLayout {
    pub key_size: usize,
    pub value_size: usize,
}

/// One key/value pair from a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Decoded B-tree node
#[derive(Debug, Clone)]
pub struct BTreeNode {
    pub flags: u16,
    pub level: u16,
    pub records: Vec<Record>,
}

impl BTreeNode {
    /// Parse a node from a verified (and if needed decrypted) block
    ///
    /// `layout` supplies the record sizes for fixed-size trees; non-leaf
    /// values are always 8-byte child identifiers.
    pub fn parse(data: &[u8], layout: Option<FixedLayout>) -> Result<Self> {
        if data.len() < BTREE_NODE_HEADER_SIZE {
            return Err(Error::corrupt("B-tree node too short"));
        }

        let header = ObjectHeader::parse(data)?;
        let flags = le_u16(data, 32);
        let level = le_u16(data, 34);
        let nkeys = le_u32(data, 36) as usize;
        let toc_offset = le_u16(data, 40) as usize;
        let toc_length = le_u16(data, 42) as usize;

        let is_leaf = flags & BTNODE_LEAF != 0;
        if is_leaf != (level == 0) {
            return Err(Error::corrupt(format!(
                "B-tree node {} has flags 0x{:04x} at level {}",
                header.oid, flags, level
            )));
        }
        if level as usize >= MAX_BTREE_DEPTH {
            return Err(Error::corrupt(format!(
                "B-tree node {} level {} exceeds depth limit",
                header.oid, level
            )));
        }

        let fixed = flags & BTNODE_FIXED_KV_SIZE != 0;
        let entry_size = if fixed { 4 } else { 8 };
        let toc_start = BTREE_NODE_HEADER_SIZE + toc_offset;
        let toc = slice(data, toc_start, toc_length, "B-tree table of contents")?;

        if nkeys.checked_mul(entry_size).map_or(true, |size| size > toc_length) {
            return Err(Error::corrupt(format!(
                "B-tree node {} has {} keys for a {} byte table",
                header.oid, nkeys, toc_length
            )));
        }

        let key_start = toc_start + toc_length;
        let value_end = if flags & BTNODE_ROOT != 0 {
            data.len().checked_sub(BTREE_INFO_SIZE).ok_or_else(|| {
                Error::corrupt("B-tree root node too short for tree info")
            })?
        } else {
            data.len()
        };

        let mut records = Vec::with_capacity(nkeys);
        for index in 0..nkeys {
            let entry = &toc[index * entry_size..(index + 1) * entry_size];

            let (key_offset, key_length, value_offset, value_length) = if fixed {
                let layout = layout.ok_or_else(|| {
                    Error::corrupt(format!(
                        "B-tree node {} uses fixed-size records in a variable-size tree",
                        header.oid
                    ))
                })?;
                let value_length = if is_leaf { layout.value_size } else { 8 };
                (
                    le_u16(entry, 0) as usize,
                    layout.key_size,
                    le_u16(entry, 2),
                    value_length,
                )
            } else {
                (
                    le_u16(entry, 0) as usize,
                    le_u16(entry, 2) as usize,
                    le_u16(entry, 4),
                    le_u16(entry, 6) as usize,
                )
            };

            let key = slice(data, key_start + key_offset, key_length, "B-tree key")?.to_vec();

            let value = if value_offset == VALUE_OFFSET_INVALID {
                Vec::new()
            } else {
                let start = value_end.checked_sub(value_offset as usize).ok_or_else(|| {
                    Error::corrupt(format!("B-tree value offset {} out of node", value_offset))
                })?;
                slice(data, start, value_length, "B-tree value")?.to_vec()
            };

            records.push(Record { key, value });
        }

        Ok(Self {
            flags,
            level,
            records,
        })
    }

    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    pub fn is_root(&self) -> bool {
        self.flags & BTNODE_ROOT != 0
    }
}

/// Child identifier stored in a non-leaf record
pub fn child_identifier(record: &Record) -> Result<u64> {
    if record.value.len() < 8 {
        return Err(Error::corrupt("B-tree child pointer too short"));
    }
    Ok(le_u64(&record.value, 0))
}

/// Loads nodes of one tree by the identifiers stored in its parents
pub trait NodeSource {
    fn load_node(&self, oid: u64) -> Result<BTreeNode>;
}

/// Trees whose child pointers are physical block addresses
pub struct PhysicalNodes<'a> {
    reader: &'a BlockReader,
    layout: Option<FixedLayout>,
}

impl<'a> PhysicalNodes<'a> {
    pub fn new(reader: &'a BlockReader, layout: Option<FixedLayout>) -> Self {
        Self { reader, layout }
    }
}

impl NodeSource for PhysicalNodes<'_> {
    fn load_node(&self, oid: u64) -> Result<BTreeNode> {
        let (header, data) = self.reader.read_object(oid, None)?;
        check_node_kind(&header, oid)?;
        BTreeNode::parse(&data, self.layout)
    }
}

/// Reject objects that are not B-tree nodes
pub fn check_node_kind(header: &ObjectHeader, location: u64) -> Result<()> {
    match header.kind() {
        OBJECT_TYPE_BTREE | OBJECT_TYPE_BTREE_NODE => Ok(()),
        other => Err(Error::corrupt(format!(
            "Object {} is type 0x{:04x}, not a B-tree node",
            location, other
        ))),
    }
}

/// Fail unless a node belongs to a tree of the given object subtype
pub fn check_tree_subtype(header: &ObjectHeader, subtype: u32) -> Result<()> {
    if header.subtype != subtype {
        return Err(Error::corrupt(format!(
            "B-tree node {} has subtype 0x{:04x}, expected 0x{:04x}",
            header.oid, header.subtype, subtype
        )));
    }
    Ok(())
}

/// Collect the leaf records whose keys fall in a contiguous key range
///
/// `cmp` places a key relative to the range: `Less` before it, `Equal`
/// inside it, `Greater` after it. Subtrees that cannot hold keys in the
/// range are not read. At most `limit` records are returned.
pub fn collect_range<S, C>(source: &S, root: BTreeNode, cmp: C, limit: usize) -> Result<Vec<Record>>
where
    S: NodeSource + ?Sized,
    C: Fn(&[u8]) -> Ordering,
{
    let mut records = Vec::new();
    visit(source, root, &cmp, limit, &mut records)?;
    Ok(records)
}

/// Returns true once the search is complete
fn visit<S, C>(
    source: &S,
    node: BTreeNode,
    cmp: &C,
    limit: usize,
    out: &mut Vec<Record>,
) -> Result<bool>
where
    S: NodeSource + ?Sized,
    C: Fn(&[u8]) -> Ordering,
{
    if node.is_leaf() {
        for record in node.records {
            match cmp(&record.key) {
                Ordering::Less => continue,
                Ordering::Equal => {
                    if out.len() >= limit {
                        tracing::warn!("B-tree range truncated at {} records", limit);
                        return Ok(true);
                    }
                    out.push(record);
                }
                Ordering::Greater => return Ok(true),
            }
        }
        return Ok(false);
    }

    let count = node.records.len();
    for index in 0..count {
        let record = &node.records[index];
        if cmp(&record.key) == Ordering::Greater {
            return Ok(true);
        }
        // Child covers keys up to the next separator
        if index + 1 < count && cmp(&node.records[index + 1].key) == Ordering::Less {
            continue;
        }

        let child_oid = child_identifier(record)?;
        tracing::trace!("Descending from level {} into node {}", node.level, child_oid);
        let child = source.load_node(child_oid)?;

        // Levels strictly decrease, so descent always terminates
        if child.level + 1 != node.level {
            return Err(Error::corrupt(format!(
                "B-tree node {} at level {} below a level {} node",
                child_oid, child.level, node.level
            )));
        }

        if visit(source, child, cmp, limit, out)? {
            return Ok(true);
        }
    }

    Ok(false)
}

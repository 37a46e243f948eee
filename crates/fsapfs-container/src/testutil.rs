//! Synthetic container images for tests

use crate::btree::{FixedLayout, BTNODE_FIXED_KV_SIZE, BTNODE_LEAF, BTNODE_ROOT, BTREE_INFO_SIZE, BTREE_NODE_HEADER_SIZE};
use crate::container::Container;
use crate::crypto::{derive_password_key, wrap_key, VolumeKey};
use crate::decmpfs::{
    CHUNK_SIZE, COMPRESSION_ZLIB_INLINE, COMPRESSION_ZLIB_RESOURCE, DECMPFS_SIGNATURE, RESOURCE_FORK_XATTR_NAME,
};
use crate::fstree::{
    key_header, APFS_TYPE_FILE_EXTENT, APFS_TYPE_INODE, APFS_TYPE_SNAP_METADATA, APFS_TYPE_XATTR,
    DECMPFS_XATTR_NAME, INO_EXT_TYPE_DSTREAM, INO_EXT_TYPE_NAME, SYMLINK_XATTR_NAME, UF_COMPRESSED,
    XATTR_DATA_EMBEDDED, XATTR_DATA_STREAM,
};
use crate::keybag::{KeyBagEntry, KB_TAG_PASSPHRASE_HINT, KB_TAG_VOLUME_KEY, KB_TAG_VOLUME_UNLOCK_RECORDS, KB_TAG_WRAPPED_KEK};
use crate::object::{
    seal_checksum, PhysicalRange, OBJECT_TYPE_BTREE,
    OBJECT_TYPE_BTREE_NODE, OBJECT_TYPE_CONTAINER_KEYBAG, OBJECT_TYPE_FS, OBJECT_TYPE_FSTREE,
    OBJECT_TYPE_NX_SUPERBLOCK, OBJECT_TYPE_OMAP, OBJECT_TYPE_SNAP_META_TREE, OBJECT_TYPE_VOLUME_KEYBAG,
};
use crate::omap::OMAP_VAL_ENCRYPTED;
use crate::reader::SharedSource;
use crate::superblock::{APFS_FS_UNENCRYPTED, APFS_INCOMPAT_CASE_INSENSITIVE, APFS_MAGIC, NX_MAGIC};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use fsapfs_core::ByteSource;
use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use uuid::Uuid;

const OBJECT_FLAG_PHYSICAL: u32 = 0x4000_0000;
const OBJECT_FLAG_EPHEMERAL: u32 = 0x8000_0000;

const BLOCK_SIZE: u32 = 4096;
const FIXTURE_XID: u64 = 5;
const TIMESTAMP: u64 = 1_600_000_000_123_456_789;

pub const HELLO_CONTENT: &[u8] = b"Hello, APFS!\n";
pub const PASSWORD: &str = "apfs-TEST";
pub const RECOVERY_PASSWORD: &str = "AAAA-BBBB-CCCC-DDDD-EEEE-FFFF";
pub const PASSWORD_HINT: &str = "the usual";

const KDF_ITERATIONS: u64 = 1000;
const KEK: [u8; 32] = [0x11; 32];
const VEK: [u8; 32] = [0x22; 32];
const CONTAINER_UUID: [u8; 16] = [0xc0; 16];
const USER_KEK_UUID: [u8; 16] = [0xe1; 16];
const RECOVERY_KEK_UUID: [u8; 16] = [0xe2; 16];

pub fn shared_source(data: Vec<u8>) -> SharedSource {
    let source: Box<dyn ByteSource> = Box::new(Cursor::new(data));
    Arc::new(Mutex::new(Some(source)))
}

/// Open an in-memory image, panicking on failure
pub fn open_image(image: Vec<u8>) -> Container {
    let mut container = Container::new();
    container.open_source(Box::new(Cursor::new(image))).unwrap();
    container
}

pub fn write_image(data: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(data).unwrap();
    file.flush().unwrap();
    file
}

fn put_u16(block: &mut [u8], offset: usize, value: u16) {
    block[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(block: &mut [u8], offset: usize, value: u32) {
    block[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(block: &mut [u8], offset: usize, value: u64) {
    block[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn put_header(block: &mut [u8], oid: u64, xid: u64, object_type: u32, subtype: u32) {
    put_u64(block, 8, oid);
    put_u64(block, 16, xid);
    put_u32(block, 24, object_type);
    put_u32(block, 28, subtype);
}

pub struct NodeSpec<'a> {
    pub block_size: u32,
    pub oid: u64,
    pub xid: u64,
    pub subtype: u32,
    pub root: bool,
    pub level: u16,
    pub layout: Option<FixedLayout>,
    pub records: &'a [(Vec<u8>, Vec<u8>)],
}

/// Sealed B-tree node holding the records in the given order
pub fn build_node(spec: &NodeSpec<'_>) -> Vec<u8> {
    let size = spec.block_size as usize;
    let mut block = vec![0u8; size];

    let object_type = if spec.root { OBJECT_TYPE_BTREE } else { OBJECT_TYPE_BTREE_NODE };
    put_header(&mut block, spec.oid, spec.xid, object_type, spec.subtype);

    let mut flags = 0;
    if spec.root {
        flags |= BTNODE_ROOT;
    }
    if spec.level == 0 {
        flags |= BTNODE_LEAF;
    }
    if spec.layout.is_some() {
        flags |= BTNODE_FIXED_KV_SIZE;
    }

    let entry_size = if spec.layout.is_some() { 4 } else { 8 };
    let toc_length = spec.records.len() * entry_size;
    put_u16(&mut block, 32, flags);
    put_u16(&mut block, 34, spec.level);
    put_u32(&mut block, 36, spec.records.len() as u32);
    put_u16(&mut block, 40, 0);
    put_u16(&mut block, 42, toc_length as u16);

    let toc_start = BTREE_NODE_HEADER_SIZE;
    let key_start = toc_start + toc_length;
    let value_end = if spec.root { size - BTREE_INFO_SIZE } else { size };

    let mut key_offset = 0;
    let mut value_offset = 0;
    for (index, (key, value)) in spec.records.iter().enumerate() {
        value_offset += value.len();
        let entry = toc_start + index * entry_size;

        if spec.layout.is_some() {
            put_u16(&mut block, entry, key_offset as u16);
            put_u16(&mut block, entry + 2, value_offset as u16);
        } else {
            put_u16(&mut block, entry, key_offset as u16);
            put_u16(&mut block, entry + 2, key.len() as u16);
            put_u16(&mut block, entry + 4, value_offset as u16);
            put_u16(&mut block, entry + 6, value.len() as u16);
        }

        let key_at = key_start + key_offset;
        block[key_at..key_at + key.len()].copy_from_slice(key);
        let value_at = value_end - value_offset;
        block[value_at..value_at + value.len()].copy_from_slice(value);

        key_offset += key.len();
        assert!(key_start + key_offset <= value_end - value_offset, "node overflow");
    }

    if spec.root {
        let info = size - BTREE_INFO_SIZE;
        put_u32(&mut block, info + 4, spec.block_size);
        if let Some(layout) = spec.layout {
            put_u32(&mut block, info + 8, layout.key_size as u32);
            put_u32(&mut block, info + 12, layout.value_size as u32);
        }
        put_u64(&mut block, info + 24, spec.records.len() as u64);
        put_u64(&mut block, info + 32, 1);
    }

    seal_checksum(&mut block);
    block
}

/// Object map header block followed by its single-leaf tree block
pub fn omap_blocks(block_size: u32, header_paddr: u64, tree_paddr: u64, mappings: &[(u64, u64, u32, u64)]) -> Vec<u8> {
    let mut header = vec![0u8; block_size as usize];
    put_header(
        &mut header,
        header_paddr,
        FIXTURE_XID,
        OBJECT_TYPE_OMAP | OBJECT_FLAG_PHYSICAL,
        0,
    );
    put_u32(&mut header, 40, OBJECT_TYPE_BTREE | OBJECT_FLAG_PHYSICAL);
    put_u64(&mut header, 48, tree_paddr);
    seal_checksum(&mut header);

    let mut sorted = mappings.to_vec();
    sorted.sort_by_key(|(oid, xid, _, _)| (*oid, *xid));
    let records = sorted
        .iter()
        .map(|(oid, xid, flags, paddr)| {
            let key = [oid.to_le_bytes(), xid.to_le_bytes()].concat();
            let mut value = Vec::with_capacity(16);
            value.extend_from_slice(&flags.to_le_bytes());
            value.extend_from_slice(&block_size.to_le_bytes());
            value.extend_from_slice(&paddr.to_le_bytes());
            (key, value)
        })
        .collect::<Vec<_>>();

    let tree = build_node(&NodeSpec {
        block_size,
        oid: tree_paddr,
        xid: FIXTURE_XID,
        subtype: OBJECT_TYPE_OMAP,
        root: true,
        level: 0,
        layout: Some(FixedLayout { key_size: 16, value_size: 16 }),
        records: &records,
    });

    [header, tree].concat()
}

#[derive(Debug, Clone)]
pub struct NxSpec {
    pub block_size: u32,
    pub block_count: u64,
    pub xid: u64,
    pub omap_oid: u64,
    pub volume_oids: Vec<u64>,
    pub xp_desc_base: u64,
    pub xp_desc_blocks: u32,
    pub keylocker: PhysicalRange,
    pub uuid: [u8; 16],
}

impl Default for NxSpec {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            block_count: 64,
            xid: 1,
            omap_oid: 0,
            volume_oids: Vec::new(),
            xp_desc_base: 0,
            xp_desc_blocks: 0,
            keylocker: PhysicalRange::default(),
            uuid: CONTAINER_UUID,
        }
    }
}

pub fn nx_superblock_block(spec: &NxSpec) -> Vec<u8> {
    let mut block = vec![0u8; spec.block_size as usize];
    put_header(
        &mut block,
        1,
        spec.xid,
        OBJECT_TYPE_NX_SUPERBLOCK | OBJECT_FLAG_EPHEMERAL,
        0,
    );
    block[32..36].copy_from_slice(NX_MAGIC);
    put_u32(&mut block, 36, spec.block_size);
    put_u64(&mut block, 40, spec.block_count);
    block[72..88].copy_from_slice(&spec.uuid);
    put_u64(&mut block, 88, 1100);
    put_u64(&mut block, 96, spec.xid + 1);
    put_u32(&mut block, 104, spec.xp_desc_blocks);
    put_u64(&mut block, 112, spec.xp_desc_base);
    put_u64(&mut block, 160, spec.omap_oid);
    put_u32(&mut block, 180, 100);
    for (slot, oid) in spec.volume_oids.iter().enumerate() {
        put_u64(&mut block, 184 + slot * 8, *oid);
    }
    put_u64(&mut block, 1296, spec.keylocker.start);
    put_u64(&mut block, 1304, spec.keylocker.count);
    seal_checksum(&mut block);
    block
}

#[derive(Debug, Clone, Default)]
pub struct VolumeSpec {
    pub name: String,
    pub role: u16,
    pub case_insensitive: bool,
    pub encrypted: bool,
    pub uuid: [u8; 16],
    pub next_obj_id: u64,
    pub num_snapshots: u64,
    pub root_tree_oid: u64,
}

pub fn apfs_superblock_block(
    block_size: u32,
    oid: u64,
    xid: u64,
    spec: &VolumeSpec,
    omap_oid: u64,
    snap_meta_oid: u64,
) -> Vec<u8> {
    let mut block = vec![0u8; block_size as usize];
    put_header(&mut block, oid, xid, OBJECT_TYPE_FS, 0);
    block[32..36].copy_from_slice(APFS_MAGIC);
    if spec.case_insensitive {
        put_u64(&mut block, 56, APFS_INCOMPAT_CASE_INSENSITIVE);
    }
    put_u32(&mut block, 116, OBJECT_TYPE_BTREE);
    put_u64(&mut block, 128, omap_oid);
    put_u64(&mut block, 136, spec.root_tree_oid);
    put_u64(&mut block, 152, snap_meta_oid);
    put_u64(&mut block, 176, spec.next_obj_id);
    put_u64(&mut block, 216, spec.num_snapshots);
    block[240..256].copy_from_slice(&spec.uuid);
    put_u64(&mut block, 256, TIMESTAMP);
    if !spec.encrypted {
        put_u64(&mut block, 264, APFS_FS_UNENCRYPTED);
    }
    block[272..272 + 12].copy_from_slice(b"fsapfs tests");
    block[704..704 + spec.name.len()].copy_from_slice(spec.name.as_bytes());
    put_u16(&mut block, 964, spec.role);
    seal_checksum(&mut block);
    block
}

/// Unencrypted key bag object of one or more blocks
pub fn key_bag_object(block_size: u32, kind: u32, entries: &[KeyBagEntry]) -> Vec<u8> {
    let mut body = Vec::new();
    for entry in entries {
        let mut header = [0u8; 24];
        header[0..16].copy_from_slice(entry.uuid.as_bytes());
        put_u16(&mut header, 16, entry.tag);
        put_u16(&mut header, 18, entry.data.len() as u16);
        body.extend_from_slice(&header);
        body.extend_from_slice(&entry.data);
        while body.len() % 16 != 0 {
            body.push(0);
        }
    }

    let bs = block_size as usize;
    let size = (48 + body.len()).div_ceil(bs).max(1) * bs;
    let mut object = vec![0u8; size];
    put_header(&mut object, 0, FIXTURE_XID, kind, 0);
    put_u16(&mut object, 32, 2);
    put_u16(&mut object, 34, entries.len() as u16);
    put_u32(&mut object, 36, body.len() as u32);
    object[48..48 + body.len()].copy_from_slice(&body);
    seal_checksum(&mut object);
    object
}

fn tlv(tag: u8, value: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    match value.len() {
        len if len < 0x80 => out.push(len as u8),
        len if len < 0x100 => out.extend_from_slice(&[0x81, len as u8]),
        len => {
            out.push(0x82);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
    }
    out.extend_from_slice(value);
    out
}

/// Wrapped key blob; `kdf` adds the iteration count and salt
pub fn wrapped_key_blob(uuid: &Uuid, method: u32, wrapped: &[u8], kdf: Option<(u64, [u8; 16])>) -> Vec<u8> {
    let mut metadata = [0u8; 8];
    metadata[..4].copy_from_slice(&method.to_le_bytes());

    let mut object = Vec::new();
    object.extend(tlv(0x81, uuid.as_bytes()));
    object.extend(tlv(0x82, &metadata));
    object.extend(tlv(0x83, wrapped));
    if let Some((iterations, salt)) = kdf {
        object.extend(tlv(0x84, &iterations.to_be_bytes()));
        object.extend(tlv(0x85, &salt));
    }

    let mut body = Vec::new();
    body.extend(tlv(0x81, &[0u8; 32]));
    body.extend(tlv(0x82, &[0u8; 8]));
    body.extend(tlv(0xa3, &object));
    tlv(0x30, &body)
}

pub fn drec_key(parent: u64, name: &str, hashed: bool) -> Vec<u8> {
    let mut key = key_header(parent, crate::fstree::APFS_TYPE_DIR_REC).to_le_bytes().to_vec();
    let length = name.len() + 1;
    if hashed {
        let field = (length as u32 & 0x3ff) | (0x2a_b1c3 << 10);
        key.extend_from_slice(&field.to_le_bytes());
    } else {
        key.extend_from_slice(&(length as u16).to_le_bytes());
    }
    key.extend_from_slice(name.as_bytes());
    key.push(0);
    key
}

pub fn drec_value(file_identifier: u64, dirent_type: u16) -> Vec<u8> {
    let mut value = Vec::with_capacity(18);
    value.extend_from_slice(&file_identifier.to_le_bytes());
    value.extend_from_slice(&TIMESTAMP.to_le_bytes());
    value.extend_from_slice(&dirent_type.to_le_bytes());
    value
}

#[derive(Debug, Clone, Default)]
pub struct InodeSpec {
    pub identifier: u64,
    pub parent: u64,
    pub name: String,
    pub mode: u16,
    pub size: Option<u64>,
    pub children: i32,
    pub bsd_flags: u32,
}

pub fn inode_key(identifier: u64) -> Vec<u8> {
    key_header(identifier, APFS_TYPE_INODE).to_le_bytes().to_vec()
}

pub fn inode_value(spec: &InodeSpec) -> Vec<u8> {
    let mut value = vec![0u8; 92];
    put_u64(&mut value, 0, spec.parent);
    put_u64(&mut value, 8, spec.identifier);
    for offset in [16, 24, 32, 40] {
        put_u64(&mut value, offset, TIMESTAMP);
    }
    put_u32(&mut value, 56, spec.children as u32);
    put_u32(&mut value, 68, spec.bsd_flags);
    put_u32(&mut value, 72, 501);
    put_u32(&mut value, 76, 20);
    put_u16(&mut value, 80, spec.mode);

    let mut fields: Vec<(u8, Vec<u8>)> = Vec::new();
    if !spec.name.is_empty() {
        let mut name = spec.name.as_bytes().to_vec();
        name.push(0);
        fields.push((INO_EXT_TYPE_NAME, name));
    }
    if let Some(size) = spec.size {
        let mut stream = vec![0u8; 40];
        put_u64(&mut stream, 0, size);
        put_u64(&mut stream, 8, size.div_ceil(BLOCK_SIZE as u64) * BLOCK_SIZE as u64);
        fields.push((INO_EXT_TYPE_DSTREAM, stream));
    }

    let mut headers = Vec::new();
    let mut data = Vec::new();
    for (kind, field) in &fields {
        headers.push(*kind);
        headers.push(0);
        headers.extend_from_slice(&(field.len() as u16).to_le_bytes());
        data.extend_from_slice(field);
        while data.len() % 8 != 0 {
            data.push(0);
        }
    }

    value.extend_from_slice(&(fields.len() as u16).to_le_bytes());
    value.extend_from_slice(&(data.len() as u16).to_le_bytes());
    value.extend(headers);
    value.extend(data);
    value
}

pub fn file_extent_record(
    identifier: u64,
    logical_offset: u64,
    length_and_flags: u64,
    physical_block: u64,
    crypto_id: u64,
) -> (Vec<u8>, Vec<u8>) {
    let key = [
        key_header(identifier, APFS_TYPE_FILE_EXTENT).to_le_bytes(),
        logical_offset.to_le_bytes(),
    ]
    .concat();
    let value = [
        length_and_flags.to_le_bytes(),
        physical_block.to_le_bytes(),
        crypto_id.to_le_bytes(),
    ]
    .concat();
    (key, value)
}

/// Extended attribute with embedded data
pub fn xattr_record(identifier: u64, name: &str, data: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut key = key_header(identifier, APFS_TYPE_XATTR).to_le_bytes().to_vec();
    key.extend_from_slice(&(name.len() as u16 + 1).to_le_bytes());
    key.extend_from_slice(name.as_bytes());
    key.push(0);

    let mut value = Vec::new();
    value.extend_from_slice(&XATTR_DATA_EMBEDDED.to_le_bytes());
    value.extend_from_slice(&(data.len() as u16).to_le_bytes());
    value.extend_from_slice(data);
    (key, value)
}

/// Extended attribute whose data lives in stream `stream`
pub fn stream_xattr_record(identifier: u64, name: &str, stream: u64, size: u64) -> (Vec<u8>, Vec<u8>) {
    let mut key = key_header(identifier, APFS_TYPE_XATTR).to_le_bytes().to_vec();
    key.extend_from_slice(&(name.len() as u16 + 1).to_le_bytes());
    key.extend_from_slice(name.as_bytes());
    key.push(0);

    let mut dstream = vec![0u8; 48];
    put_u64(&mut dstream, 0, stream);
    put_u64(&mut dstream, 8, size);
    put_u64(&mut dstream, 16, size.div_ceil(BLOCK_SIZE as u64) * BLOCK_SIZE as u64);

    let mut value = Vec::new();
    value.extend_from_slice(&XATTR_DATA_STREAM.to_le_bytes());
    value.extend_from_slice(&(dstream.len() as u16).to_le_bytes());
    value.extend(dstream);
    (key, value)
}

pub fn zlib(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// `com.apple.decmpfs` attribute: header followed by `payload`
pub fn decmpfs_attribute(method: u32, uncompressed_size: u64, payload: &[u8]) -> Vec<u8> {
    let mut data = DECMPFS_SIGNATURE.to_vec();
    data.extend_from_slice(&method.to_le_bytes());
    data.extend_from_slice(&uncompressed_size.to_le_bytes());
    data.extend_from_slice(payload);
    data
}

/// Resource fork holding `content` as a chunk table
///
/// The first chunk is zlib compressed, later ones are stored raw.
pub fn resource_fork(content: &[u8]) -> Vec<u8> {
    let chunks = content
        .chunks(CHUNK_SIZE)
        .enumerate()
        .map(|(index, chunk)| {
            if index == 0 {
                zlib(chunk)
            } else {
                [&[0xff][..], chunk].concat()
            }
        })
        .collect::<Vec<_>>();

    let mut table = (chunks.len() as u32).to_le_bytes().to_vec();
    let mut offset = 4 + chunks.len() * 8;
    for chunk in &chunks {
        table.extend_from_slice(&(offset as u32).to_le_bytes());
        table.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
        offset += chunk.len();
    }
    let data = [table, chunks.concat()].concat();

    let map_length = 50u32;
    let mut fork = vec![0u8; 0x100];
    fork[0..4].copy_from_slice(&0x100u32.to_be_bytes());
    fork[4..8].copy_from_slice(&(0x104 + data.len() as u32).to_be_bytes());
    fork[8..12].copy_from_slice(&(4 + data.len() as u32).to_be_bytes());
    fork[12..16].copy_from_slice(&map_length.to_be_bytes());
    fork.extend_from_slice(&(data.len() as u32).to_be_bytes());
    fork.extend(data);
    fork.extend(vec![0u8; map_length as usize]);
    fork
}

/// Contents of `/compressed.txt`
pub fn inline_content() -> Vec<u8> {
    b"Inline compressed text in a decmpfs attribute.\n".repeat(20)
}

/// Contents of `/forked.bin`, one full chunk and part of another
pub fn forked_content() -> Vec<u8> {
    (0..CHUNK_SIZE + 4000).map(|i| (i % 251) as u8).collect()
}

pub fn snapshot_record(xid: u64, name: &str, superblock_oid: u64) -> (Vec<u8>, Vec<u8>) {
    let key = key_header(xid, APFS_TYPE_SNAP_METADATA).to_le_bytes().to_vec();
    let mut value = vec![0u8; 50];
    put_u64(&mut value, 8, superblock_oid);
    put_u64(&mut value, 16, TIMESTAMP);
    put_u64(&mut value, 24, TIMESTAMP);
    put_u16(&mut value, 48, name.len() as u16 + 1);
    value.extend_from_slice(name.as_bytes());
    value.push(0);
    (key, value)
}

/// Contents of `/Documents/notes.txt`, two blocks long
pub fn notes_content() -> Vec<u8> {
    let mut text = Vec::new();
    let mut line = 0;
    while text.len() < 5000 {
        text.extend_from_slice(format!("line {:04} of the notes file\n", line).as_bytes());
        line += 1;
    }
    text.truncate(5000);
    text
}

/// One volume in a fixture container
///
/// Every volume holds the same tree:
///
/// ```text
/// /              (2)
/// /Documents     (16)
/// /Documents/notes.txt (17)
/// /hello.txt     (18)
/// /link          (19) -> Documents/notes.txt
/// /sparse.bin    (20) 4 KiB hole then 4 KiB of 0xab
/// ```
///
/// With `compressed`, the root also holds `/compressed.txt` (21) with
/// inline zlib content and `/forked.bin` (22) with its chunks in a
/// resource fork kept in stream 23. Directory record keys carry name
/// hashes on case-insensitive volumes.
#[derive(Debug, Clone)]
pub struct FixtureVolume {
    pub name: &'static str,
    pub role: u16,
    pub case_insensitive: bool,
    /// Encrypt the volume and protect it with this password
    pub password: Option<&'static str>,
    pub recovery_password: Option<&'static str>,
    pub hint: Option<&'static str>,
    pub snapshot: Option<&'static str>,
    /// Add `/Documents/loop` pointing back at the root directory
    pub cycle: bool,
    pub compressed: bool,
}

impl FixtureVolume {
    pub fn plain(name: &'static str) -> Self {
        Self {
            name,
            role: 0,
            case_insensitive: false,
            password: None,
            recovery_password: None,
            hint: None,
            snapshot: None,
            cycle: false,
            compressed: false,
        }
    }
}

struct Blocks {
    block_size: usize,
    blocks: Vec<Vec<u8>>,
}

impl Blocks {
    fn alloc(&mut self, count: usize) -> u64 {
        let start = self.blocks.len() as u64;
        for _ in 0..count {
            self.blocks.push(vec![0u8; self.block_size]);
        }
        start
    }

    fn put(&mut self, paddr: u64, data: &[u8]) {
        for (index, chunk) in data.chunks(self.block_size).enumerate() {
            let block = &mut self.blocks[paddr as usize + index];
            block[..chunk.len()].copy_from_slice(chunk);
        }
    }
}

fn padded(data: &[u8], blocks: usize) -> Vec<u8> {
    let mut out = data.to_vec();
    out.resize(blocks * BLOCK_SIZE as usize, 0);
    out
}

fn dir(identifier: u64, parent: u64, name: &str, children: i32) -> (Vec<u8>, Vec<u8>) {
    let spec = InodeSpec {
        identifier,
        parent,
        name: name.to_string(),
        mode: 0o040755,
        children,
        ..InodeSpec::default()
    };
    (inode_key(identifier), inode_value(&spec))
}

fn file(identifier: u64, parent: u64, name: &str, mode: u16, size: Option<u64>) -> (Vec<u8>, Vec<u8>) {
    let spec = InodeSpec {
        identifier,
        parent,
        name: name.to_string(),
        mode,
        size,
        children: 1,
        ..InodeSpec::default()
    };
    (inode_key(identifier), inode_value(&spec))
}

fn add_volume(blocks: &mut Blocks, index: usize, spec: &FixtureVolume, container_bag: &mut Vec<KeyBagEntry>) -> u64 {
    let bs = BLOCK_SIZE as u64;
    let sectors = bs / 512;
    let uuid = Uuid::from_bytes([0x50 + index as u8; 16]);
    let key = spec.password.map(|_| VolumeKey::from_bytes(&VEK).unwrap());

    let superblock = blocks.alloc(1);
    let omap = blocks.alloc(2);
    let nodes = blocks.alloc(3);
    let notes = blocks.alloc(2);
    let hello = blocks.alloc(1);
    let sparse = blocks.alloc(1);
    let fork = spec.compressed.then(|| blocks.alloc(2));
    let snapshots = spec.snapshot.map(|_| blocks.alloc(1));
    let key_bag = spec.password.map(|_| blocks.alloc(1));

    let fork_data = resource_fork(&forked_content());
    let mut contents = vec![
        (notes, padded(&notes_content(), 2)),
        (hello, padded(HELLO_CONTENT, 1)),
        (sparse, vec![0xab; BLOCK_SIZE as usize]),
    ];
    if let Some(paddr) = fork {
        contents.push((paddr, padded(&fork_data, 2)));
    }

    // File data, encrypted with the extent's crypto identifier as tweak base
    for (paddr, mut data) in contents {
        if let Some(key) = &key {
            key.encrypt(&mut data, paddr * sectors).unwrap();
        }
        blocks.put(paddr, &data);
    }

    let hashed = spec.case_insensitive;
    let mut root_records = vec![
        dir(2, 1, "root", if spec.compressed { 6 } else { 4 }),
        (drec_key(2, "Documents", hashed), drec_value(16, 4)),
        (drec_key(2, "hello.txt", hashed), drec_value(18, 8)),
        (drec_key(2, "link", hashed), drec_value(19, 10)),
        (drec_key(2, "sparse.bin", hashed), drec_value(20, 8)),
    ];
    if spec.compressed {
        root_records.push((drec_key(2, "compressed.txt", hashed), drec_value(21, 8)));
        root_records.push((drec_key(2, "forked.bin", hashed), drec_value(22, 8)));
    }
    root_records.push(dir(16, 2, "Documents", if spec.cycle { 2 } else { 1 }));
    root_records.push((drec_key(16, "notes.txt", hashed), drec_value(17, 8)));
    if spec.cycle {
        root_records.push((drec_key(16, "loop", hashed), drec_value(2, 4)));
    }

    let mut file_records = vec![
        file(17, 16, "notes.txt", 0o100644, Some(notes_content().len() as u64)),
        file_extent_record(17, 0, 2 * bs, notes, notes),
        file(18, 2, "hello.txt", 0o100644, Some(HELLO_CONTENT.len() as u64)),
        file_extent_record(18, 0, bs, hello, hello),
        file(19, 2, "link", 0o120755, None),
        xattr_record(19, SYMLINK_XATTR_NAME, b"Documents/notes.txt\0"),
        file(20, 2, "sparse.bin", 0o100644, Some(2 * bs)),
        file_extent_record(20, 0, bs, 0, 0),
        file_extent_record(20, bs, bs, sparse, sparse),
    ];
    if let Some(paddr) = fork {
        file_records.extend(compressed_records(paddr, fork_data.len() as u64));
    }

    // Two leaves under one index node, all virtual
    let (root_oid, left_oid, right_oid) = (1030, 1031, 1032);
    let separators = vec![
        (root_records[0].0.clone(), child_pointer(left_oid)),
        (file_records[0].0.clone(), child_pointer(right_oid)),
    ];
    let tree = [
        (root_oid, true, 1, separators),
        (left_oid, false, 0, root_records),
        (right_oid, false, 0, file_records),
    ];
    let mut mappings = Vec::new();
    for (offset, (oid, root, level, records)) in tree.iter().enumerate() {
        let paddr = nodes + offset as u64;
        let mut node = build_node(&NodeSpec {
            block_size: BLOCK_SIZE,
            oid: *oid,
            xid: FIXTURE_XID,
            subtype: OBJECT_TYPE_FSTREE,
            root: *root,
            level: *level,
            layout: None,
            records,
        });
        let flags = match &key {
            Some(key) => {
                key.encrypt(&mut node, paddr * sectors).unwrap();
                OMAP_VAL_ENCRYPTED
            }
            None => 0,
        };
        blocks.put(paddr, &node);
        mappings.push((*oid, FIXTURE_XID, flags, paddr));
    }
    blocks.put(omap, &omap_blocks(BLOCK_SIZE, omap, omap + 1, &mappings));

    if let (Some(paddr), Some(name)) = (snapshots, spec.snapshot) {
        let records = vec![snapshot_record(3, name, superblock)];
        let node = build_node(&NodeSpec {
            block_size: BLOCK_SIZE,
            oid: paddr,
            xid: FIXTURE_XID,
            subtype: OBJECT_TYPE_SNAP_META_TREE,
            root: true,
            level: 0,
            layout: None,
            records: &records,
        });
        blocks.put(paddr, &node);
    }

    if let (Some(paddr), Some(password)) = (key_bag, spec.password) {
        let salt = [0x5a; 16];
        let mut entries = vec![kek_entry(USER_KEK_UUID, password, salt)];
        if let Some(recovery) = spec.recovery_password {
            entries.push(kek_entry(RECOVERY_KEK_UUID, recovery, [0x6b; 16]));
        }
        if let Some(hint) = spec.hint {
            entries.push(KeyBagEntry {
                uuid: Uuid::from_bytes(USER_KEK_UUID),
                tag: KB_TAG_PASSPHRASE_HINT,
                data: hint.as_bytes().to_vec(),
            });
        }
        let mut object = key_bag_object(BLOCK_SIZE, OBJECT_TYPE_VOLUME_KEYBAG, &entries);
        VolumeKey::from_uuid(&uuid).encrypt(&mut object, paddr * sectors).unwrap();
        blocks.put(paddr, &object);

        container_bag.push(KeyBagEntry {
            uuid,
            tag: KB_TAG_VOLUME_KEY,
            data: wrapped_key_blob(&uuid, 0, &wrap_key(&KEK, &VEK).unwrap(), None),
        });
        container_bag.push(KeyBagEntry {
            uuid,
            tag: KB_TAG_VOLUME_UNLOCK_RECORDS,
            data: [paddr.to_le_bytes(), 1u64.to_le_bytes()].concat(),
        });
    }

    let volume = VolumeSpec {
        name: spec.name.to_string(),
        role: spec.role,
        case_insensitive: spec.case_insensitive,
        encrypted: spec.password.is_some(),
        uuid: *uuid.as_bytes(),
        next_obj_id: 21,
        num_snapshots: spec.snapshot.map_or(0, |_| 1),
        root_tree_oid: root_oid,
    };
    blocks.put(
        superblock,
        &apfs_superblock_block(BLOCK_SIZE, 1026 + index as u64, FIXTURE_XID, &volume, omap, snapshots.unwrap_or(0)),
    );
    superblock
}

fn compressed_file(identifier: u64, name: &str) -> (Vec<u8>, Vec<u8>) {
    let spec = InodeSpec {
        identifier,
        parent: 2,
        name: name.to_string(),
        mode: 0o100644,
        children: 1,
        bsd_flags: UF_COMPRESSED,
        ..InodeSpec::default()
    };
    (inode_key(identifier), inode_value(&spec))
}

/// Records of `/compressed.txt` and `/forked.bin`
fn compressed_records(fork_paddr: u64, fork_size: u64) -> Vec<(Vec<u8>, Vec<u8>)> {
    let inline = inline_content();
    let forked = forked_content();
    vec![
        compressed_file(21, "compressed.txt"),
        xattr_record(
            21,
            DECMPFS_XATTR_NAME,
            &decmpfs_attribute(COMPRESSION_ZLIB_INLINE, inline.len() as u64, &zlib(&inline)),
        ),
        compressed_file(22, "forked.bin"),
        stream_xattr_record(22, RESOURCE_FORK_XATTR_NAME, 23, fork_size),
        xattr_record(
            22,
            DECMPFS_XATTR_NAME,
            &decmpfs_attribute(COMPRESSION_ZLIB_RESOURCE, forked.len() as u64, &[]),
        ),
        file_extent_record(23, 0, 2 * BLOCK_SIZE as u64, fork_paddr, fork_paddr),
    ]
}

fn child_pointer(oid: u64) -> Vec<u8> {
    oid.to_le_bytes().to_vec()
}

fn kek_entry(uuid: [u8; 16], password: &str, salt: [u8; 16]) -> KeyBagEntry {
    let uuid = Uuid::from_bytes(uuid);
    let password_key = derive_password_key(password, &salt, KDF_ITERATIONS, 32).unwrap();
    KeyBagEntry {
        uuid,
        tag: KB_TAG_WRAPPED_KEK,
        data: wrapped_key_blob(&uuid, 0, &wrap_key(&password_key, &KEK).unwrap(), Some((KDF_ITERATIONS, salt))),
    }
}

/// Complete container image holding the given volumes
pub fn build_container(volumes: &[FixtureVolume]) -> Vec<u8> {
    let mut blocks = Blocks {
        block_size: BLOCK_SIZE as usize,
        blocks: Vec::new(),
    };
    // Block zero and one checkpoint descriptor block
    blocks.alloc(2);
    let omap = blocks.alloc(2);

    let mut container_bag = Vec::new();
    let mut mappings = Vec::new();
    for (index, spec) in volumes.iter().enumerate() {
        let paddr = add_volume(&mut blocks, index, spec, &mut container_bag);
        mappings.push((1026 + index as u64, FIXTURE_XID, 0, paddr));
    }
    blocks.put(omap, &omap_blocks(BLOCK_SIZE, omap, omap + 1, &mappings));

    let mut keylocker = PhysicalRange::default();
    if !container_bag.is_empty() {
        let paddr = blocks.alloc(1);
        let mut object = key_bag_object(BLOCK_SIZE, OBJECT_TYPE_CONTAINER_KEYBAG, &container_bag);
        VolumeKey::from_uuid(&Uuid::from_bytes(CONTAINER_UUID))
            .encrypt(&mut object, paddr * (BLOCK_SIZE as u64 / 512))
            .unwrap();
        blocks.put(paddr, &object);
        keylocker = PhysicalRange { start: paddr, count: 1 };
    }

    let superblock = nx_superblock_block(&NxSpec {
        block_size: BLOCK_SIZE,
        block_count: blocks.blocks.len() as u64,
        xid: FIXTURE_XID,
        omap_oid: omap,
        volume_oids: (0..volumes.len() as u64).map(|i| 1026 + i).collect(),
        xp_desc_base: 1,
        xp_desc_blocks: 1,
        keylocker,
        uuid: CONTAINER_UUID,
    });
    blocks.put(0, &superblock);
    blocks.put(1, &superblock);

    blocks.blocks.concat()
}

/// Container with an unencrypted volume "Plain" and an encrypted "Secure"
pub fn encrypted_image() -> Vec<u8> {
    build_container(&[
        FixtureVolume::plain("Plain"),
        FixtureVolume {
            password: Some(PASSWORD),
            recovery_password: Some(RECOVERY_PASSWORD),
            hint: Some(PASSWORD_HINT),
            ..FixtureVolume::plain("Secure")
        },
    ])
}

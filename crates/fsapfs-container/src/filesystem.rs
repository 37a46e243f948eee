//! File system tree access for one opened volume

use crate::btree::{check_node_kind, check_tree_subtype, collect_range, BTreeNode, NodeSource, Record};
use crate::config::ContainerConfig;
use crate::crypto::{VolumeKey, SECTOR_SIZE};
use crate::decmpfs::{decompress_inline, decompress_resource_fork, CompressionHeader, RESOURCE_FORK_XATTR_NAME};
use crate::fstree::{
    key_range, DirectoryRecord, ExtendedAttribute, FileExtent, Inode, XattrStream, APFS_TYPE_DIR_REC,
    APFS_TYPE_FILE_EXTENT, APFS_TYPE_INODE, APFS_TYPE_XATTR, DECMPFS_XATTR_NAME,
};
use crate::object::OBJECT_TYPE_FSTREE;
use crate::omap::ObjectMap;
use crate::reader::BlockReader;
use crate::superblock::VolumeFeatures;
use fsapfs_core::{checked_multiply_u64, u64_to_usize, Error, Result, MAX_FILE_EXTRACT_SIZE};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

/// Shared state behind a volume's file entries
pub(crate) struct FileSystem {
    reader: BlockReader,
    omap: ObjectMap,
    xid: u64,
    root_tree_oid: u64,
    /// Set on open or by a later unlock
    key: OnceLock<VolumeKey>,
    encrypted: bool,
    features: VolumeFeatures,
    config: ContainerConfig,
    closed: AtomicBool,
}

impl FileSystem {
    pub fn new(
        reader: BlockReader,
        omap: ObjectMap,
        xid: u64,
        root_tree_oid: u64,
        encrypted: bool,
        features: VolumeFeatures,
        config: ContainerConfig,
    ) -> Self {
        Self {
            reader,
            omap,
            xid,
            root_tree_oid,
            key: OnceLock::new(),
            encrypted,
            features,
            config,
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn block_size(&self) -> u64 {
        self.reader.block_size() as u64
    }

    /// Install the volume key; entries already handed out can read from now on
    pub fn set_key(&self, key: VolumeKey) {
        if self.key.set(key).is_err() {
            tracing::debug!("Volume key already installed");
        }
    }

    fn volume_key(&self, what: impl FnOnce() -> String) -> Result<&VolumeKey> {
        self.key.get().ok_or_else(|| Error::locked(what()))
    }

    /// Invalidate every handle sharing this file system
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Fail with [`Error::NotOpen`] once the volume or container is closed
    pub fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::not_open("Volume has been closed"));
        }
        if !self.reader.is_open() {
            return Err(Error::not_open("Container has been closed"));
        }
        Ok(())
    }

    fn records(&self, oid: u64, kind: u8, limit: usize) -> Result<Vec<Record>> {
        self.ensure_open()?;
        let root = self.load_node(self.root_tree_oid)?;
        if !root.is_root() {
            return Err(Error::corrupt(format!(
                "File system tree {} does not start at a root node",
                self.root_tree_oid
            )));
        }
        collect_range(self, root, key_range(oid, kind), limit)
    }

    /// Inode of a file system object
    pub fn inode(&self, identifier: u64) -> Result<Inode> {
        let record = self
            .records(identifier, APFS_TYPE_INODE, 1)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found(format!("No inode with identifier {}", identifier)))?;
        Inode::parse(identifier, &record.value)
    }

    /// Directory records of a directory in on-disk order
    pub fn directory_records(&self, parent: u64) -> Result<Vec<DirectoryRecord>> {
        let limit = self.config.max_directory_entries;
        let hashed = self.features.has_hashed_names();
        let mut entries = Vec::new();

        for record in self.records(parent, APFS_TYPE_DIR_REC, limit)? {
            match DirectoryRecord::parse(&record.key, &record.value, hashed) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!("Skipping directory record of {}: {}", parent, e),
            }
        }
        Ok(entries)
    }

    /// File extents of a data stream ordered by logical offset
    pub fn file_extents(&self, stream: u64) -> Result<Vec<FileExtent>> {
        self.records(stream, APFS_TYPE_FILE_EXTENT, usize::MAX)?
            .iter()
            .map(|r| FileExtent::parse(&r.key, &r.value))
            .collect()
    }

    /// Extended attributes of an object
    pub fn extended_attributes(&self, identifier: u64) -> Result<Vec<ExtendedAttribute>> {
        self.records(identifier, APFS_TYPE_XATTR, usize::MAX)?
            .iter()
            .map(|r| ExtendedAttribute::parse(&r.key, &r.value))
            .collect()
    }

    pub fn extended_attribute(&self, identifier: u64, name: &str) -> Result<Option<ExtendedAttribute>> {
        Ok(self
            .extended_attributes(identifier)?
            .into_iter()
            .find(|x| x.name == name))
    }

    /// Content of an extended attribute, embedded or in its own data stream
    pub fn extended_attribute_data(&self, xattr: &ExtendedAttribute) -> Result<Vec<u8>> {
        if xattr.is_embedded() {
            return Ok(xattr.data.clone());
        }
        if !xattr.is_stream() {
            return Err(Error::corrupt(format!(
                "Extended attribute {} is neither embedded nor streamed",
                xattr.name
            )));
        }

        let stream = XattrStream::parse(&xattr.data)?;
        if stream.size > MAX_FILE_EXTRACT_SIZE {
            return Err(Error::invalid_argument(format!(
                "Extended attribute {} of {} bytes exceeds the {} byte read limit",
                xattr.name, stream.size, MAX_FILE_EXTRACT_SIZE
            )));
        }
        tracing::trace!("Reading attribute {} from stream {}", xattr.name, stream.identifier);
        self.read_stream(stream.identifier, stream.size, 0, stream.size)
    }

    fn required_attribute(&self, inode: &Inode, name: &str) -> Result<Vec<u8>> {
        let xattr = self.extended_attribute(inode.identifier, name)?.ok_or_else(|| {
            Error::corrupt(format!("Compressed inode {} has no {} attribute", inode.identifier, name))
        })?;
        self.extended_attribute_data(&xattr)
    }

    fn compression_header(&self, inode: &Inode) -> Result<(CompressionHeader, Vec<u8>)> {
        let attribute = self.required_attribute(inode, DECMPFS_XATTR_NAME)?;
        Ok((CompressionHeader::parse(&attribute)?, attribute))
    }

    /// Logical size of the file content
    ///
    /// Compressed files report the uncompressed size from their header.
    pub fn file_size(&self, inode: &Inode) -> Result<u64> {
        if inode.is_compressed() {
            return Ok(self.compression_header(inode)?.0.uncompressed_size);
        }
        Ok(inode.size())
    }

    fn decompress(&self, inode: &Inode) -> Result<Vec<u8>> {
        let (header, attribute) = self.compression_header(inode)?;
        header.check_supported()?;
        if header.uncompressed_size > MAX_FILE_EXTRACT_SIZE {
            return Err(Error::invalid_argument(format!(
                "Compressed content of {} bytes exceeds the {} byte read limit",
                header.uncompressed_size, MAX_FILE_EXTRACT_SIZE
            )));
        }

        tracing::debug!(
            "Decompressing inode {} (method {}, {} bytes)",
            inode.identifier,
            header.method,
            header.uncompressed_size
        );
        if header.in_resource_fork() {
            let fork = self.required_attribute(inode, RESOURCE_FORK_XATTR_NAME)?;
            decompress_resource_fork(&header, &fork)
        } else {
            decompress_inline(&header, &attribute)
        }
    }

    /// Compare names the way the volume does
    pub fn names_match(&self, stored: &str, wanted: &str) -> bool {
        if self.features.is_case_insensitive() {
            stored.to_lowercase() == wanted.to_lowercase()
        } else {
            stored == wanted
        }
    }

    /// Read part of a file's content
    ///
    /// The range is clipped to the file size; sparse extents read as zeros.
    pub fn read_file(&self, inode: &Inode, offset: u64, length: u64) -> Result<Vec<u8>> {
        self.ensure_open()?;
        if !inode.is_compressed() {
            return self.read_stream(inode.private_identifier, inode.size(), offset, length);
        }

        let content = self.decompress(inode)?;
        let size = content.len() as u64;
        if offset >= size {
            return Ok(Vec::new());
        }
        let end = offset.saturating_add(length).min(size);
        Ok(content[offset as usize..end as usize].to_vec())
    }

    /// Read part of a data stream of `size` bytes
    fn read_stream(&self, stream: u64, size: u64, offset: u64, length: u64) -> Result<Vec<u8>> {
        if offset >= size || length == 0 {
            return Ok(Vec::new());
        }
        let end = offset.saturating_add(length).min(size);
        let mut out = vec![0u8; u64_to_usize(end - offset, "Stream read length")?];

        let block_size = self.block_size();
        let sectors_per_block = block_size / SECTOR_SIZE as u64;

        for extent in self.file_extents(stream)? {
            let extent_end = extent.logical_offset.saturating_add(extent.length);
            let start = offset.max(extent.logical_offset);
            let stop = end.min(extent_end);
            if start >= stop || extent.is_sparse() {
                continue;
            }

            let first_block = (start - extent.logical_offset) / block_size;
            let last_block = (stop - extent.logical_offset - 1) / block_size;
            let paddr = extent
                .physical_block
                .checked_add(first_block)
                .ok_or_else(|| Error::corrupt("File extent block address overflows"))?;
            let mut data = self.reader.read_blocks(paddr, last_block - first_block + 1)?;

            if self.encrypted {
                let key = self.volume_key(|| format!("Data stream {} is encrypted", stream))?;
                for (index, block) in data.chunks_mut(block_size as usize).enumerate() {
                    let unit = extent
                        .crypto_id
                        .wrapping_add(first_block)
                        .wrapping_add(index as u64);
                    key.decrypt(block, checked_multiply_u64(unit, sectors_per_block, "Data tweak")?)?;
                }
            }

            let skip = (start - extent.logical_offset - first_block * block_size) as usize;
            let count = (stop - start) as usize;
            let target = (start - offset) as usize;
            out[target..target + count].copy_from_slice(&data[skip..skip + count]);
        }

        Ok(out)
    }
}

impl NodeSource for FileSystem {
    fn load_node(&self, oid: u64) -> Result<BTreeNode> {
        let mapping = self.omap.resolve(&self.reader, oid, self.xid)?;

        let (header, data) = if mapping.is_encrypted() {
            let key = self.volume_key(|| "File system tree is encrypted, unlock the volume first".to_string())?;
            self.reader.read_encrypted_object(mapping.paddr, key, None)?
        } else {
            self.reader.read_object(mapping.paddr, None)?
        };

        check_node_kind(&header, oid)?;
        check_tree_subtype(&header, OBJECT_TYPE_FSTREE)?;
        BTreeNode::parse(&data, None)
    }
}

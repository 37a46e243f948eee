//! File entries and directory traversal

use crate::filesystem::FileSystem;
use crate::fstree::{DirectoryRecord, Inode, SYMLINK_XATTR_NAME};
use crate::superblock::c_string;
use chrono::{DateTime, Utc};
use fsapfs_core::{
    apfs_time_to_datetime, checked_multiply_u64, Error, FileEntryInfo, FileEntryKind, Result,
    MAX_FILE_EXTRACT_SIZE,
};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Run of file data in the container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Offset of the run in the file
    pub logical_offset: u64,
    /// Byte offset in the container, zero for a sparse run
    pub physical_offset: u64,
    pub size: u64,
    /// No blocks are allocated; the run reads as zeros
    pub is_sparse: bool,
}

/// Handle to a file, directory or other object in a volume
///
/// Entries load their inode on first use. Every accessor fails with
/// [`Error::NotOpen`] once the owning volume or container is closed.
#[derive(Clone)]
pub struct FileEntry {
    fs: Arc<FileSystem>,
    identifier: u64,
    /// Directory record that led here
    record: Option<DirectoryRecord>,
    inode: OnceLock<Inode>,
}

impl fmt::Debug for FileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileEntry")
            .field("identifier", &self.identifier)
            .field("name", &self.record.as_ref().map(|r| &r.name))
            .finish()
    }
}

impl FileEntry {
    pub(crate) fn new(fs: Arc<FileSystem>, identifier: u64, record: Option<DirectoryRecord>) -> Self {
        Self {
            fs,
            identifier,
            record,
            inode: OnceLock::new(),
        }
    }

    pub(crate) fn with_inode(fs: Arc<FileSystem>, inode: Inode) -> Self {
        let entry = Self::new(fs, inode.identifier, None);
        let _ = entry.inode.set(inode);
        entry
    }

    fn inode(&self) -> Result<&Inode> {
        self.fs.ensure_open()?;
        if let Some(inode) = self.inode.get() {
            return Ok(inode);
        }
        let inode = self.fs.inode(self.identifier)?;
        Ok(self.inode.get_or_init(|| inode))
    }

    /// File system object identifier
    pub fn identifier(&self) -> u64 {
        self.identifier
    }

    pub fn parent_identifier(&self) -> Result<u64> {
        Ok(self.inode()?.parent_identifier)
    }

    /// Name of the entry
    ///
    /// Entries reached through a directory use the directory record name;
    /// others fall back to the name stored in the inode.
    pub fn name(&self) -> Result<String> {
        let inode = self.inode()?;
        Ok(self
            .record
            .as_ref()
            .map(|r| r.name.clone())
            .or_else(|| inode.name.clone())
            .unwrap_or_default())
    }

    pub fn kind(&self) -> Result<FileEntryKind> {
        Ok(FileEntryKind::from_mode(self.inode()?.mode))
    }

    /// True for directories
    ///
    /// The type in the directory record answers this without reading the
    /// inode when it is known.
    pub fn is_directory(&self) -> Result<bool> {
        let hint = self
            .record
            .as_ref()
            .map(|r| FileEntryKind::from_dirent_type(r.dirent_type))
            .filter(|kind| *kind != FileEntryKind::Unknown);
        match hint {
            Some(kind) => {
                self.fs.ensure_open()?;
                Ok(kind == FileEntryKind::Directory)
            }
            None => Ok(self.kind()? == FileEntryKind::Directory),
        }
    }

    /// Logical size of the content in bytes
    ///
    /// Compressed files report their uncompressed size.
    pub fn size(&self) -> Result<u64> {
        let inode = self.inode()?;
        self.fs.file_size(inode)
    }

    pub fn mode(&self) -> Result<u16> {
        Ok(self.inode()?.mode)
    }

    pub fn owner(&self) -> Result<u32> {
        Ok(self.inode()?.owner)
    }

    pub fn group(&self) -> Result<u32> {
        Ok(self.inode()?.group)
    }

    pub fn creation_time(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(apfs_time_to_datetime(self.inode()?.creation_time))
    }

    pub fn modification_time(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(apfs_time_to_datetime(self.inode()?.modification_time))
    }

    pub fn change_time(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(apfs_time_to_datetime(self.inode()?.change_time))
    }

    pub fn access_time(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(apfs_time_to_datetime(self.inode()?.access_time))
    }

    /// Time the entry was added to its directory
    ///
    /// Only entries reached through a directory record carry one.
    pub fn added_time(&self) -> Result<Option<DateTime<Utc>>> {
        self.fs.ensure_open()?;
        Ok(self
            .record
            .as_ref()
            .and_then(|r| apfs_time_to_datetime(r.date_added)))
    }

    fn directory_records(&self) -> Result<Vec<DirectoryRecord>> {
        self.fs.ensure_open()?;
        self.fs.directory_records(self.identifier)
    }

    /// Number of entries in this directory, zero for other kinds
    pub fn number_of_children(&self) -> Result<usize> {
        Ok(self.directory_records()?.len())
    }

    /// Entries of this directory in on-disk order
    ///
    /// Each call reads the directory again and returns a fresh iterator.
    pub fn children(&self) -> Result<Children> {
        Ok(Children {
            fs: self.fs.clone(),
            records: self.directory_records()?.into_iter(),
        })
    }

    /// Find a direct child by name
    ///
    /// Case-insensitive volumes match names without regard to case.
    pub fn child_by_name(&self, name: &str) -> Result<Option<FileEntry>> {
        Ok(self
            .children()?
            .find(|child| {
                child
                    .record
                    .as_ref()
                    .is_some_and(|r| self.fs.names_match(&r.name, name))
            }))
    }

    /// Read the whole data stream
    pub fn read_data(&self) -> Result<Vec<u8>> {
        let size = self.size()?;
        if size > MAX_FILE_EXTRACT_SIZE {
            return Err(Error::invalid_argument(format!(
                "File of {} bytes exceeds the {} byte read limit",
                size, MAX_FILE_EXTRACT_SIZE
            )));
        }
        self.read_range(0, size)
    }

    /// Read up to `length` bytes of the data stream starting at `offset`
    ///
    /// Reads are clipped at the end of the file.
    pub fn read_range(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        if length > MAX_FILE_EXTRACT_SIZE {
            return Err(Error::invalid_argument(format!(
                "Read of {} bytes exceeds the {} byte read limit",
                length, MAX_FILE_EXTRACT_SIZE
            )));
        }
        let inode = self.inode()?;
        self.fs.read_file(inode, offset, length)
    }

    /// Target of a symbolic link, `None` for other kinds
    pub fn symlink_target(&self) -> Result<Option<String>> {
        if self.kind()? != FileEntryKind::Symlink {
            return Ok(None);
        }
        match self.extended_attribute_data(SYMLINK_XATTR_NAME)? {
            Some(data) => Ok(Some(c_string(&data))),
            None => Err(Error::corrupt(format!(
                "Symbolic link {} has no target attribute",
                self.identifier
            ))),
        }
    }

    fn extents(&self) -> Result<Vec<Extent>> {
        let inode = self.inode()?;
        let block_size = self.fs.block_size();
        self.fs
            .file_extents(inode.private_identifier)?
            .into_iter()
            .map(|extent| {
                let physical_offset = checked_multiply_u64(extent.physical_block, block_size, "Extent offset")?;
                Ok(Extent {
                    logical_offset: extent.logical_offset,
                    physical_offset,
                    size: extent.length,
                    is_sparse: extent.is_sparse(),
                })
            })
            .collect()
    }

    /// Number of extents of the data stream
    ///
    /// Compressed content lives in extended attributes, so compressed
    /// files usually have none.
    pub fn number_of_extents(&self) -> Result<usize> {
        Ok(self.extents()?.len())
    }

    /// Extent by index in logical order
    pub fn extent(&self, index: usize) -> Result<Extent> {
        let extents = self.extents()?;
        let count = extents.len();
        extents.get(index).copied().ok_or_else(|| {
            Error::index_out_of_bounds(format!(
                "Extent {} requested, file entry {} has {}",
                index, self.identifier, count
            ))
        })
    }

    /// Names of the extended attributes of this entry
    pub fn extended_attribute_names(&self) -> Result<Vec<String>> {
        self.fs.ensure_open()?;
        Ok(self
            .fs
            .extended_attributes(self.identifier)?
            .into_iter()
            .map(|x| x.name)
            .collect())
    }

    /// Content of the extended attribute `name`, `None` if there is none
    ///
    /// Works for attributes embedded in their record and for ones kept in
    /// a separate data stream.
    pub fn extended_attribute_data(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.fs.ensure_open()?;
        match self.fs.extended_attribute(self.identifier, name)? {
            Some(xattr) => Ok(Some(self.fs.extended_attribute_data(&xattr)?)),
            None => Ok(None),
        }
    }

    /// Detached metadata snapshot for listings
    pub fn info(&self) -> Result<FileEntryInfo> {
        let inode = self.inode()?;
        let kind = FileEntryKind::from_mode(inode.mode);

        let mut info = FileEntryInfo::new(self.identifier, self.name()?, kind, self.fs.file_size(inode)?);
        info.parent_identifier = inode.parent_identifier;
        info.created = apfs_time_to_datetime(inode.creation_time);
        info.modified = apfs_time_to_datetime(inode.modification_time);
        info.changed = apfs_time_to_datetime(inode.change_time);
        info.accessed = apfs_time_to_datetime(inode.access_time);
        info.mode = inode.mode;
        Ok(info)
    }

    /// Depth-first traversal starting at this entry
    pub fn walk(&self) -> Walker {
        Walker::new(self.clone())
    }
}

/// Entries of one directory
pub struct Children {
    fs: Arc<FileSystem>,
    records: std::vec::IntoIter<DirectoryRecord>,
}

impl fmt::Debug for Children {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Children").field("remaining", &self.records.len()).finish()
    }
}

impl Iterator for Children {
    type Item = FileEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.next()?;
        Some(FileEntry::new(self.fs.clone(), record.file_identifier, Some(record)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.records.size_hint()
    }
}

impl ExactSizeIterator for Children {}

/// One entry produced by a [`Walker`]
#[derive(Debug, Clone)]
pub struct WalkEntry {
    /// Nesting below the starting entry
    pub depth: usize,
    /// `/`-separated path from the starting entry
    pub path: String,
    pub entry: FileEntry,
}

/// Depth-first traversal of a directory tree
///
/// Directories are expanded at most once, so directory records pointing
/// back at an ancestor do not loop. Expansion stops at the depth limit.
pub struct Walker {
    stack: Vec<(usize, String, FileEntry)>,
    visited: HashSet<u64>,
    max_depth: usize,
}

impl Walker {
    pub fn new(start: FileEntry) -> Self {
        let max_depth = start.fs.config().max_traversal_depth;
        Self {
            stack: vec![(0, "/".to_string(), start)],
            visited: HashSet::new(),
            max_depth,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    fn expand(&mut self, depth: usize, path: &str, entry: &FileEntry) -> Result<()> {
        if !entry.is_directory()? {
            return Ok(());
        }
        if !self.visited.insert(entry.identifier()) {
            tracing::warn!("Directory {} reached twice at {}, not descending", entry.identifier(), path);
            return Ok(());
        }
        if depth >= self.max_depth {
            tracing::warn!("Depth limit {} reached at {}", self.max_depth, path);
            return Ok(());
        }

        let children = entry.children()?.collect::<Vec<_>>();
        for child in children.into_iter().rev() {
            let name = child.record.as_ref().map(|r| r.name.as_str()).unwrap_or_default();
            let child_path = if path.ends_with('/') {
                format!("{}{}", path, name)
            } else {
                format!("{}/{}", path, name)
            };
            self.stack.push((depth + 1, child_path, child));
        }
        Ok(())
    }
}

impl Iterator for Walker {
    type Item = Result<WalkEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let (depth, path, entry) = self.stack.pop()?;
        if let Err(e) = self.expand(depth, &path, &entry) {
            return Some(Err(e));
        }
        Some(Ok(WalkEntry { depth, path, entry }))
    }
}

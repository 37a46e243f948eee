//! Core types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference point for [`crate::ByteSource::seek_to`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// Absolute offset from the start of the range
    Start,
    /// Relative to the current position
    Current,
    /// Relative to the end of the range
    End,
}

/// Kind of a file entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileEntryKind {
    Directory,
    File,
    Symlink,
    Fifo,
    CharacterDevice,
    BlockDevice,
    Socket,
    Whiteout,
    Unknown,
}

impl FileEntryKind {
    /// Derive the kind from the POSIX mode stored in an inode
    pub fn from_mode(mode: u16) -> Self {
        match mode & 0o170000 {
            0o040000 => FileEntryKind::Directory,
            0o100000 => FileEntryKind::File,
            0o120000 => FileEntryKind::Symlink,
            0o010000 => FileEntryKind::Fifo,
            0o020000 => FileEntryKind::CharacterDevice,
            0o060000 => FileEntryKind::BlockDevice,
            0o140000 => FileEntryKind::Socket,
            0o160000 => FileEntryKind::Whiteout,
            _ => FileEntryKind::Unknown,
        }
    }

    /// Derive the kind from the `DT_*` type stored in a directory record
    pub fn from_dirent_type(dirent_type: u16) -> Self {
        match dirent_type & 0x000f {
            1 => FileEntryKind::Fifo,
            2 => FileEntryKind::CharacterDevice,
            4 => FileEntryKind::Directory,
            6 => FileEntryKind::BlockDevice,
            8 => FileEntryKind::File,
            10 => FileEntryKind::Symlink,
            12 => FileEntryKind::Socket,
            14 => FileEntryKind::Whiteout,
            _ => FileEntryKind::Unknown,
        }
    }

    /// Single character marker used in listings
    pub fn marker(&self) -> char {
        match self {
            FileEntryKind::Directory => 'd',
            FileEntryKind::File => 'f',
            FileEntryKind::Symlink => 'l',
            FileEntryKind::Fifo => 'p',
            FileEntryKind::CharacterDevice => 'c',
            FileEntryKind::BlockDevice => 'b',
            FileEntryKind::Socket => 's',
            FileEntryKind::Whiteout => 'w',
            FileEntryKind::Unknown => '?',
        }
    }
}

/// Snapshot of a file entry's metadata, detached from its volume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntryInfo {
    /// File system object identifier
    pub identifier: u64,

    /// Identifier of the parent directory
    pub parent_identifier: u64,

    /// Name of the file or directory
    pub name: String,

    /// Kind of entry
    pub kind: FileEntryKind,

    /// Size in bytes (0 for directories)
    pub size: u64,

    /// Creation timestamp
    pub created: Option<DateTime<Utc>>,

    /// Last modified timestamp
    pub modified: Option<DateTime<Utc>>,

    /// Inode change timestamp
    pub changed: Option<DateTime<Utc>>,

    /// Last accessed timestamp
    pub accessed: Option<DateTime<Utc>>,

    /// POSIX mode bits
    pub mode: u16,
}

impl FileEntryInfo {
    /// Create a new entry record with no timestamps
    pub fn new(identifier: u64, name: String, kind: FileEntryKind, size: u64) -> Self {
        Self {
            identifier,
            parent_identifier: 0,
            name,
            kind,
            size,
            created: None,
            modified: None,
            changed: None,
            accessed: None,
            mode: 0,
        }
    }

    /// True if this is a directory
    pub fn is_directory(&self) -> bool {
        self.kind == FileEntryKind::Directory
    }
}

impl fmt::Display for FileEntryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:>10} {:>12} {}",
            self.kind.marker(),
            self.identifier,
            if self.is_directory() {
                "<DIR>".to_string()
            } else {
                format_size(self.size)
            },
            self.name
        )
    }
}

/// Convert an APFS timestamp (nanoseconds since the Unix epoch)
///
/// Zero means "not set" and maps to `None`.
pub fn apfs_time_to_datetime(nanoseconds: u64) -> Option<DateTime<Utc>> {
    if nanoseconds == 0 {
        return None;
    }
    let seconds = (nanoseconds / 1_000_000_000) as i64;
    let subsec = (nanoseconds % 1_000_000_000) as u32;
    DateTime::from_timestamp(seconds, subsec)
}

/// Format size in human-readable format
pub fn format_size(size: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = size as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

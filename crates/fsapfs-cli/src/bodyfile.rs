//! Sleuthkit 3.x bodyfile output
//!
//! One line per file entry: `MD5|name|inode|mode_as_string|UID|GID|size|atime|mtime|ctime|crtime`.
//! No digests are computed, so the MD5 column is always 0.

use anyhow::Result;
use chrono::{DateTime, Utc};
use fsapfs_container::{FileEntry, Volume};
use std::io::Write;

/// Write every entry below the root directory of `volume`
///
/// `prefix` is put in front of each path, for output covering more than
/// one volume.
pub fn write_volume<W: Write>(out: &mut W, volume: &Volume, prefix: &str) -> Result<usize> {
    let mut count = 0;
    for item in volume.root_directory()?.walk() {
        let item = item?;
        let path = format!("{}{}", prefix, item.path);
        match line(&item.entry, &path) {
            Ok(line) => {
                writeln!(out, "{}", line)?;
                count += 1;
            }
            Err(e) => tracing::warn!("Skipping {} in bodyfile: {}", path, e),
        }
    }
    Ok(count)
}

fn line(entry: &FileEntry, path: &str) -> Result<String> {
    let mut name = escape(path);
    if let Ok(Some(target)) = entry.symlink_target() {
        name = format!("{} -> {}", name, escape(&target));
    }
    Ok(format!(
        "0|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
        name,
        entry.identifier(),
        mode_string(entry.mode()?),
        entry.owner()?,
        entry.group()?,
        entry.size()?,
        timestamp(entry.access_time()?),
        timestamp(entry.modification_time()?),
        timestamp(entry.change_time()?),
        timestamp(entry.creation_time()?),
    ))
}

/// `ls`-style mode string such as `drwxr-xr-x`
pub fn mode_string(mode: u16) -> String {
    let kind = match mode & 0xf000 {
        0x1000 => 'p',
        0x2000 => 'c',
        0x4000 => 'd',
        0x6000 => 'b',
        0xa000 => 'l',
        0xc000 => 's',
        _ => '-',
    };
    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

/// Seconds with a nanosecond fraction, zero when unset
pub fn timestamp(time: Option<DateTime<Utc>>) -> String {
    match time {
        Some(time) => format!("{}.{:09}", time.timestamp(), time.timestamp_subsec_nanos()),
        None => "0.000000000".to_string(),
    }
}

/// Escape the column separator and control characters
fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '|' => out.push_str("\\|"),
            '\\' => out.push_str("\\\\"),
            c if c.is_control() => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

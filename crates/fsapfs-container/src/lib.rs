//! # fsapfs Container
//!
//! Read-only access to APFS containers: signature checks, container and
//! volume superblocks, password unlock of encrypted volumes and the file
//! entry tree of each volume, including zlib-compressed file content.
//!
//! ## Example
//!
//! ```rust,no_run
//! use fsapfs_container::{check_signature_path, Container};
//!
//! if check_signature_path("disk.apfs")? {
//!     let mut container = Container::new();
//!     container.open("disk.apfs", "r")?;
//!
//!     let mut volume = container.volume(0)?;
//!     volume.set_password("secret");
//!     volume.open()?;
//!
//!     if !volume.is_locked()? {
//!         for child in volume.root_directory()?.children()? {
//!             println!("{}", child.info()?);
//!         }
//!     }
//! }
//! # Ok::<(), fsapfs_core::Error>(())
//! ```

pub mod config;
pub mod container;
pub mod file_entry;
pub mod signature;
pub mod volume;

mod btree;
mod checkpoint;
mod crypto;
mod decmpfs;
mod filesystem;
mod fstree;
mod keybag;
mod object;
mod omap;
mod reader;
mod superblock;

#[cfg(test)]
mod testutil;

pub use config::ContainerConfig;
pub use container::Container;
pub use file_entry::{Children, Extent, FileEntry, WalkEntry, Walker};
pub use signature::{check_signature, check_signature_path, check_volume_signature};
pub use superblock::{VolumeFeatures, VolumeRole};
pub use volume::{Snapshot, Volume};

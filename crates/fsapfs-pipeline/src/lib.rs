//! # fsapfs Pipeline
//!
//! Byte sources for the APFS reader.
//!
//! This crate provides the [`ByteSource`](fsapfs_core::ByteSource)
//! implementations the parsers read through:
//! - **RangePipeline**: window into a subset of another source (an APFS
//!   partition inside a disk image)
//! - **MmapPipeline**: memory-mapped file access
//! - **FilePipeline**: plain file stream with a cached length
//! - **open_source / open_range**: path based openers
//!
//! ## Example
//!
//! ```rust,no_run
//! use fsapfs_pipeline::{open_range, DataRange, OpenOptions};
//! use fsapfs_core::ByteSource;
//! use std::path::Path;
//!
//! // Container starts 20480 bytes into the image and runs to its end
//! let range = DataRange::new(20480, None).unwrap();
//! let mut source = open_range(Path::new("disk.img"), range, &OpenOptions::default()).unwrap();
//!
//! let head = source.read_bytes(4096).unwrap();
//! ```

pub mod file;
pub mod mmap;
pub mod range;
pub mod source;

pub use file::FilePipeline;
pub use mmap::MmapPipeline;
pub use range::{DataRange, RangePipeline};
pub use source::{open_range, open_source, OpenOptions};

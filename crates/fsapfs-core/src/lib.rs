//! # fsapfs Core
//!
//! Core traits, types, and error handling for the APFS reader.
//!
//! This crate provides the foundational abstractions shared by the other
//! workspace crates:
//! - **ByteSource**: random-access byte range (whole file or a window of one)
//! - **Error**: categorized error kinds for every public operation
//! - **Security**: hard limits applied while decoding untrusted images
//! - **Types**: file entry kinds, timestamps and listing records
//!
//! ## Example
//!
//! ```rust,no_run
//! use fsapfs_core::{ByteSource, Result, Whence};
//!
//! fn dump_head(source: &mut dyn ByteSource) -> Result<Vec<u8>> {
//!     source.seek_to(0, Whence::Start)?;
//!     Ok(source.read_bytes(64)?)
//! }
//! ```

pub mod error;
pub mod security;
pub mod traits;
pub mod types;

// Re-export commonly used items
pub use error::{Error, ErrorCategory, ErrorKind, Result};
pub use security::*;
pub use traits::ByteSource;
pub use types::{apfs_time_to_datetime, format_size, FileEntryInfo, FileEntryKind, Whence};

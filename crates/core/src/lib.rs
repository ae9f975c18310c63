//! Core domain types and shared logic for the depot build CDN.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Content digests and manifest hashing
//! - Blob compression codec and the "worthwhile" predicate
//! - Canonical manifest text construction
//! - Fork/version/file name validation
//! - Build-directory path resolution
//! - Application configuration

pub mod codec;
pub mod config;
pub mod error;
pub mod hash;
pub mod layout;
pub mod manifest;
pub mod name;

pub use codec::BlobCompression;
pub use error::{Error, Result};
pub use hash::{ContentDigest, DigestWriter};
pub use layout::BuildDirectory;
pub use manifest::{MANIFEST_HEADER, ManifestBuilder};

/// The one and only download protocol version speakable on the wire.
pub const DOWNLOAD_PROTOCOL_VERSION: u32 = 1;

/// Stream header bit: every file record carries its own compression header.
pub const DOWNLOAD_FLAG_PRE_COMPRESSED: u32 = 1;

/// Hard cap on a download request body: 100 000 indices of 4 bytes each.
pub const MAX_DOWNLOAD_REQUEST_SIZE: usize = 4 * 100_000;

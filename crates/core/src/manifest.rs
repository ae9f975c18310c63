//! Canonical manifest text.
//!
//! The manifest is the authoritative list of a version's client content:
//! one header line, then `<HEX-UPPER-BLAKE2B> <path>` per entry, sorted
//! ordinally by full path with directory entries excluded. The manifest
//! hash is BLAKE2b-256 over the exact text.

use crate::hash::ContentDigest;

/// First line of every manifest, including trailing newline when emitted.
pub const MANIFEST_HEADER: &str = "Robust Content Manifest 1";

/// Incrementally builds canonical manifest text.
///
/// Callers must push entries in ordinal path order; the builder does not
/// re-sort.
pub struct ManifestBuilder {
    text: String,
    entries: u32,
}

impl ManifestBuilder {
    /// Start a manifest with the header line.
    pub fn new() -> Self {
        let mut text = String::with_capacity(4096);
        text.push_str(MANIFEST_HEADER);
        text.push('\n');
        Self { text, entries: 0 }
    }

    /// Append one `<HEX> <path>` line.
    pub fn push_entry(&mut self, digest: &ContentDigest, path: &str) {
        self.text.push_str(&digest.to_hex_upper());
        self.text.push(' ');
        self.text.push_str(path);
        self.text.push('\n');
        self.entries += 1;
    }

    /// Number of entries pushed so far.
    pub fn entries(&self) -> u32 {
        self.entries
    }

    /// Finish, returning the canonical text and its hash.
    pub fn finish(self) -> (String, ContentDigest) {
        let digest = ContentDigest::compute(self.text.as_bytes());
        (self.text, digest)
    }
}

impl Default for ManifestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

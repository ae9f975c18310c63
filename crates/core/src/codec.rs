//! Blob compression codec.
//!
//! Blobs are stored either verbatim or zstd-compressed, whichever wins.
//! Decompression is exposed both as a one-shot call (manifest text, small
//! blobs) and as a streaming reader for interleaved response writes.

use std::io::Read;

/// How a stored blob's payload is encoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlobCompression {
    /// Payload is the raw content; `len(payload) == size`.
    None,
    /// Payload is a zstd frame of the content.
    ZStd,
}

impl BlobCompression {
    /// Database tag for this compression scheme.
    pub fn tag(self) -> i64 {
        match self {
            Self::None => 0,
            Self::ZStd => 1,
        }
    }

    /// Parse a database tag.
    pub fn from_tag(tag: i64) -> crate::Result<Self> {
        match tag {
            0 => Ok(Self::None),
            1 => Ok(Self::ZStd),
            other => Err(crate::Error::InvalidHash(format!(
                "unknown compression tag {other}"
            ))),
        }
    }
}

/// Compress a buffer with zstd at the given level.
pub fn zstd_compress(data: &[u8], level: i32) -> std::io::Result<Vec<u8>> {
    zstd::bulk::compress(data, level)
}

/// Decompress a whole zstd frame into memory.
pub fn zstd_decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    zstd::stream::decode_all(data)
}

/// Wrap a reader in a streaming zstd decoder.
pub fn zstd_decompress_stream<R: Read>(reader: R) -> std::io::Result<impl Read> {
    zstd::stream::read::Decoder::new(reader)
}

/// Whether compressing actually paid off. The threshold guards against
/// storing a compressed payload that saves less than it costs to inflate.
pub fn compression_worthwhile(compressed: usize, uncompressed: usize, threshold: usize) -> bool {
    compressed + threshold < uncompressed
}

//! Content hashing.
//!
//! All blob and manifest hashes are BLAKE2b with a 32-byte output and an
//! empty key. Client/server zip checksums use SHA-256 and live with their
//! callers; this module only owns the content-address format.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use std::fmt;

type Blake2b256 = Blake2b<U32>;

/// A BLAKE2b-256 content digest represented as 32 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    /// Create a digest from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Compute the digest of a byte slice in one shot.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Blake2b256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Create an incremental hasher.
    pub fn hasher() -> DigestWriter {
        DigestWriter(Blake2b256::new())
    }

    /// Parse from a hex string (either case).
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        if s.len() != 64 {
            return Err(crate::Error::InvalidHash(format!(
                "expected 64 hex chars, got {}",
                s.len()
            )));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex_str = std::str::from_utf8(chunk)
                .map_err(|e| crate::Error::InvalidHash(e.to_string()))?;
            bytes[i] = u8::from_str_radix(hex_str, 16)
                .map_err(|e| crate::Error::InvalidHash(e.to_string()))?;
        }
        Ok(Self(bytes))
    }

    /// Encode as lowercase hex.
    pub fn to_hex(&self) -> String {
        hex_lower(&self.0)
    }

    /// Encode as uppercase hex, the form used in manifest text and headers.
    pub fn to_hex_upper(&self) -> String {
        hex_upper(&self.0)
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Incremental BLAKE2b-256 hasher for unbounded inputs (zip streams).
pub struct DigestWriter(Blake2b256);

impl DigestWriter {
    /// Update the hasher with data.
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// Finalize and return the digest.
    pub fn finalize(self) -> ContentDigest {
        ContentDigest(self.0.finalize().into())
    }
}

impl std::io::Write for DigestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Encode bytes as lowercase hex.
pub fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Encode bytes as uppercase hex.
pub fn hex_upper(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_hex_roundtrip() {
        let digest = ContentDigest::compute(b"hello world");

        let hex = digest.to_hex();
        assert_eq!(hex.len(), 64);
        let parsed = ContentDigest::from_hex(&hex).unwrap();
        assert_eq!(digest, parsed);

        let upper = digest.to_hex_upper();
        assert_eq!(upper, hex.to_uppercase());
        assert_eq!(ContentDigest::from_hex(&upper).unwrap(), digest);
    }

    #[test]
    fn incremental_matches_one_shot() {
        let mut hasher = ContentDigest::hasher();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finalize(), ContentDigest::compute(b"hello world"));
    }

    #[test]
    fn from_hex_rejects_bad_input() {
        assert!(ContentDigest::from_hex("abcd").is_err());
        assert!(ContentDigest::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn blake2b_known_vector() {
        // BLAKE2b-256 of the empty input.
        let digest = ContentDigest::compute(b"");
        assert_eq!(
            digest.to_hex(),
            "0e5751c026e543b2e8ab2eb06099daa1d1e5df47778f7787faab45cdf12fe3a8"
        );
    }
}

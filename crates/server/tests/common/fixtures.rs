//! Test fixtures for generating build artifacts.

use std::io::{Cursor, Write};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

/// Build an in-memory zip from `(path, contents)` entries, in the order
/// given.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub fn make_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data) in entries {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .expect("Failed to start zip entry");
        writer.write_all(data).expect("Failed to write zip entry");
    }
    writer.finish().expect("Failed to finish zip").into_inner()
}

/// Deterministic compressible payload of the given length.
#[allow(dead_code)]
pub fn compressible_bytes(len: usize) -> Vec<u8> {
    b"depot test payload "
        .iter()
        .copied()
        .cycle()
        .take(len)
        .collect()
}

/// Compute SHA-256 of data as an uppercase hex string.
#[allow(dead_code)]
pub fn sha256_hex_upper(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    depot_core::hash::hex_upper(&Sha256::digest(data))
}

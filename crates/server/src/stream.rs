//! Download wire-stream encoding.
//!
//! ```text
//! StreamHeader := uint32_le flags            // bit0 = PreCompressed
//! FileRecord   := uint32_le uncompressedSize
//!                 [ uint32_le compressedSize ]   // only if PreCompressed
//!                 payload bytes
//! Body         := StreamHeader FileRecord*      // in requested order
//! ```
//!
//! All integers are little-endian regardless of host byte order. When the
//! pre-compressed flag is set, a record whose blob is stored zstd carries
//! `compressedSize > 0` and the stored frame verbatim; an uncompressed
//! blob carries `compressedSize = 0` and raw bytes. Without the flag every
//! record is raw bytes, decompressed on the fly if needed.

use depot_core::codec::{self, BlobCompression};
use depot_db::models::BlobPayloadRow;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Async write adapter that counts bytes without buffering them.
///
/// Wrapped around the outermost output of a download response, so the
/// count reflects what actually went over the wire (post stream
/// compression).
pub struct CountWriter<W> {
    inner: W,
    written: Arc<AtomicU64>,
}

impl<W> CountWriter<W> {
    /// Wrap a writer; `written` is shared with whoever reports the count.
    pub fn new(inner: W, written: Arc<AtomicU64>) -> Self {
        Self { inner, written }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CountWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                self.written.fetch_add(n as u64, Ordering::Relaxed);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Write the stream header.
pub async fn write_stream_header<W: AsyncWrite + Unpin>(w: &mut W, flags: u32) -> io::Result<()> {
    w.write_all(&flags.to_le_bytes()).await
}

/// Write one file record for a stored blob.
pub async fn write_file_record<W: AsyncWrite + Unpin>(
    w: &mut W,
    blob: &BlobPayloadRow,
    pre_compressed: bool,
) -> io::Result<()> {
    let compression = BlobCompression::from_tag(blob.compression).map_err(io::Error::other)?;
    let uncompressed_size = u32::try_from(blob.size).map_err(io::Error::other)?;

    w.write_all(&uncompressed_size.to_le_bytes()).await?;

    if pre_compressed {
        match compression {
            BlobCompression::ZStd => {
                let compressed_size = u32::try_from(blob.data.len()).map_err(io::Error::other)?;
                w.write_all(&compressed_size.to_le_bytes()).await?;
                w.write_all(&blob.data).await?;
            }
            BlobCompression::None => {
                w.write_all(&0u32.to_le_bytes()).await?;
                w.write_all(&blob.data).await?;
            }
        }
    } else {
        match compression {
            BlobCompression::ZStd => {
                let data = codec::zstd_decompress(&blob.data)?;
                w.write_all(&data).await?;
            }
            BlobCompression::None => {
                w.write_all(&blob.data).await?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_blob(data: &[u8]) -> BlobPayloadRow {
        BlobPayloadRow {
            compression: BlobCompression::None.tag(),
            size: data.len() as i64,
            data: data.to_vec(),
        }
    }

    fn zstd_blob(data: &[u8]) -> BlobPayloadRow {
        BlobPayloadRow {
            compression: BlobCompression::ZStd.tag(),
            size: data.len() as i64,
            data: codec::zstd_compress(data, 3).unwrap(),
        }
    }

    #[tokio::test]
    async fn plain_record_is_size_then_bytes() {
        let mut out = Vec::new();
        write_stream_header(&mut out, 0).await.unwrap();
        write_file_record(&mut out, &raw_blob(b"world"), false).await.unwrap();

        let mut expected = vec![0, 0, 0, 0, 5, 0, 0, 0];
        expected.extend_from_slice(b"world");
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn pre_compressed_record_carries_stored_frame() {
        let data: Vec<u8> = b"compressible ".repeat(64);
        let blob = zstd_blob(&data);
        let mut out = Vec::new();
        write_file_record(&mut out, &blob, true).await.unwrap();

        let uncompressed = u32::from_le_bytes(out[0..4].try_into().unwrap());
        let compressed = u32::from_le_bytes(out[4..8].try_into().unwrap());
        assert_eq!(uncompressed as usize, data.len());
        assert_eq!(compressed as usize, blob.data.len());
        assert_eq!(&out[8..], &blob.data[..]);
    }

    #[tokio::test]
    async fn pre_compressed_raw_blob_has_zero_compressed_size() {
        let mut out = Vec::new();
        write_file_record(&mut out, &raw_blob(b"xy"), true).await.unwrap();
        assert_eq!(out, vec![2, 0, 0, 0, 0, 0, 0, 0, b'x', b'y']);
    }

    #[tokio::test]
    async fn stored_zstd_blob_is_inflated_without_flag() {
        let data: Vec<u8> = b"inflate me ".repeat(32);
        let mut out = Vec::new();
        write_file_record(&mut out, &zstd_blob(&data), false).await.unwrap();
        assert_eq!(u32::from_le_bytes(out[0..4].try_into().unwrap()) as usize, data.len());
        assert_eq!(&out[4..], &data[..]);
    }

    #[tokio::test]
    async fn zero_byte_entry_emits_empty_record() {
        let mut out = Vec::new();
        write_file_record(&mut out, &raw_blob(b""), false).await.unwrap();
        assert_eq!(out, vec![0, 0, 0, 0]);
        out.clear();
        write_file_record(&mut out, &raw_blob(b""), true).await.unwrap();
        assert_eq!(out, vec![0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn count_writer_tracks_wire_bytes() {
        let counter = Arc::new(AtomicU64::new(0));
        let mut writer = CountWriter::new(Vec::new(), counter.clone());
        write_stream_header(&mut writer, 1).await.unwrap();
        write_file_record(&mut writer, &raw_blob(b"abc"), true).await.unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 4 + 4 + 4 + 3);
    }
}

//! Version manifest and partial-download endpoints.
//!
//! `GET /manifest` returns the canonical manifest text, served from the
//! stored zstd frame directly when the client accepts zstd. `POST
//! /download` takes a packed array of little-endian int32 manifest
//! indices and streams back the referenced blobs in request order, with
//! either per-blob pre-compression or whole-stream compression.

use crate::auth;
use crate::error::{ApiError, ApiResult};
use crate::requestlog::RequestLogEntry;
use crate::state::AppState;
use crate::stream::{CountWriter, write_file_record, write_stream_header};
use async_compression::Level;
use async_compression::tokio::write::ZstdEncoder;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use depot_core::codec;
use depot_core::config::ContentConfig;
use depot_core::{DOWNLOAD_FLAG_PRE_COMPRESSED, DOWNLOAD_PROTOCOL_VERSION};
use depot_db::ContentStore;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;

const PROTOCOL_HEADER: &str = "X-Robust-Download-Protocol";
const MANIFEST_HASH_HEADER: axum::http::HeaderName =
    axum::http::HeaderName::from_static("x-manifest-hash");

/// GET /fork/{fork}/version/{version}/manifest
pub async fn get_manifest(
    State(state): State<AppState>,
    Path((fork, version)): Path<(String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    manifest_response(&state, &fork, &version, &headers).await
}

/// GET /version/{version}/manifest — legacy route against the default fork.
pub async fn get_manifest_default_fork(
    State(state): State<AppState>,
    Path(version): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let fork = state.default_fork()?.to_string();
    manifest_response(&state, &fork, &version, &headers).await
}

async fn manifest_response(
    state: &AppState,
    fork: &str,
    version: &str,
    headers: &HeaderMap,
) -> ApiResult<Response> {
    let fork_config = state.fork_config(fork)?;
    auth::check_read_access(fork, fork_config, headers)?;

    let row = lookup_version(state, fork, version).await?;
    let manifest_data = state.content.manifest_data(row.id).await?;
    let hash_header = depot_core::hash::hex_upper(&row.manifest_hash);

    if accepts_zstd(headers) {
        Ok((
            StatusCode::OK,
            [
                (CONTENT_TYPE, "text/plain".to_string()),
                (CONTENT_ENCODING, "zstd".to_string()),
                (MANIFEST_HASH_HEADER, hash_header),
            ],
            Body::from(manifest_data),
        )
            .into_response())
    } else {
        let text = codec::zstd_decompress(&manifest_data)?;
        Ok((
            StatusCode::OK,
            [
                (CONTENT_TYPE, "text/plain".to_string()),
                (MANIFEST_HASH_HEADER, hash_header),
            ],
            Body::from(text),
        )
            .into_response())
    }
}

/// OPTIONS /fork/{fork}/version/{version}/download
pub async fn options_download() -> Response {
    (
        StatusCode::NO_CONTENT,
        [
            ("X-Robust-Download-Min-Protocol", DOWNLOAD_PROTOCOL_VERSION.to_string()),
            ("X-Robust-Download-Max-Protocol", DOWNLOAD_PROTOCOL_VERSION.to_string()),
        ],
    )
        .into_response()
}

/// POST /fork/{fork}/version/{version}/download
pub async fn post_download(
    State(state): State<AppState>,
    Path((fork, version)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    download_response(&state, &fork, &version, &headers, body).await
}

/// POST /version/{version}/download — legacy route against the default fork.
pub async fn post_download_default_fork(
    State(state): State<AppState>,
    Path(version): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let fork = state.default_fork()?.to_string();
    download_response(&state, &fork, &version, &headers, body).await
}

async fn download_response(
    state: &AppState,
    fork: &str,
    version: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let fork_config = state.fork_config(fork)?;
    auth::check_read_access(fork, fork_config, headers)?;

    match headers.get(PROTOCOL_HEADER).and_then(|v| v.to_str().ok()) {
        Some("1") => {}
        Some(other) => {
            return Err(ApiError::BadRequest(format!(
                "unsupported download protocol: {other}"
            )));
        }
        None => {
            return Err(ApiError::BadRequest(format!(
                "missing {PROTOCOL_HEADER} header"
            )));
        }
    }

    let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
    if content_type != Some("application/octet-stream") {
        return Err(ApiError::BadRequest(
            "body must be application/octet-stream".to_string(),
        ));
    }

    if body.len() % 4 != 0 {
        return Err(ApiError::BadRequest(
            "body length must be a multiple of 4".to_string(),
        ));
    }

    let row = lookup_version(state, fork, version).await?;
    let entry_count = state.content.entry_count(row.id).await?;
    let indices = parse_indices(&body, entry_count)?;

    let (stream_compress, pre_compress) = select_compression(
        &state.config.content,
        indices.len() as u64,
        row.count_distinct_blobs.max(0) as u64,
        accepts_zstd(headers),
    );

    let bytes_sent = Arc::new(AtomicU64::new(0));
    let (read_half, write_half) = tokio::io::duplex(64 * 1024);

    tokio::spawn(stream_blobs(
        state.content.clone(),
        row.id,
        indices,
        StreamOptions {
            pre_compress,
            stream_compress,
            stream_compress_level: state.config.content.stream_compress_level,
        },
        CountWriter::new(write_half, bytes_sent.clone()),
        state.request_log.clone().map(|queue| PendingLogEntry {
            queue,
            bytes_sent,
            body,
            pre_compress,
            stream_compress,
        }),
    ));

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/octet-stream");
    if stream_compress {
        response = response.header(CONTENT_ENCODING, "zstd");
    }
    response
        .body(Body::from_stream(ReaderStream::new(read_half)))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

struct StreamOptions {
    pre_compress: bool,
    stream_compress: bool,
    stream_compress_level: i32,
}

struct PendingLogEntry {
    queue: mpsc::Sender<RequestLogEntry>,
    bytes_sent: Arc<AtomicU64>,
    body: Bytes,
    pre_compress: bool,
    stream_compress: bool,
}

/// Write the response stream, interleaving blob reads with writes. The
/// writer is the counting wrapper over the response pipe; with stream
/// compression it sits *under* the encoder so the count is wire bytes.
async fn stream_blobs<W>(
    content: ContentStore,
    version_id: i64,
    indices: Vec<i64>,
    options: StreamOptions,
    writer: CountWriter<W>,
    log: Option<PendingLogEntry>,
) where
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let flags = if options.pre_compress {
        DOWNLOAD_FLAG_PRE_COMPRESSED
    } else {
        0
    };

    let result = if options.stream_compress {
        let mut encoder = ZstdEncoder::with_quality(
            writer,
            Level::Precise(options.stream_compress_level),
        );
        let result =
            write_records(&content, version_id, &indices, options.pre_compress, flags, &mut encoder)
                .await;
        match result {
            Ok(()) => encoder.shutdown().await,
            Err(e) => Err(e),
        }
    } else {
        let mut writer = writer;
        let result =
            write_records(&content, version_id, &indices, options.pre_compress, flags, &mut writer)
                .await;
        match result {
            Ok(()) => writer.shutdown().await,
            Err(e) => Err(e),
        }
    };

    if let Err(error) = result {
        // The client sees a truncated body; nothing else to salvage here.
        tracing::warn!(version_id, %error, "Download stream aborted");
        return;
    }

    if let Some(log) = log {
        let entry = RequestLogEntry {
            time: OffsetDateTime::now_utc(),
            pre_compressed: log.pre_compress,
            stream_compressed: log.stream_compress,
            protocol: DOWNLOAD_PROTOCOL_VERSION,
            bytes_sent: log.bytes_sent.load(Ordering::Relaxed),
            version_id,
            body: log.body,
        };
        if log.queue.send(entry).await.is_err() {
            tracing::warn!("Request log writer gone, dropping entry");
        }
    }
}

async fn write_records<W>(
    content: &ContentStore,
    version_id: i64,
    indices: &[i64],
    pre_compress: bool,
    flags: u32,
    writer: &mut W,
) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    write_stream_header(writer, flags).await?;
    for &index in indices {
        let blob = content
            .blob_for_entry(version_id, index)
            .await
            .map_err(std::io::Error::other)?;
        write_file_record(writer, &blob, pre_compress).await?;
    }
    Ok(())
}

async fn lookup_version(
    state: &AppState,
    fork: &str,
    version: &str,
) -> ApiResult<depot_db::models::ContentVersionRow> {
    let fork_id = state
        .content
        .fork_id(fork)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("unknown fork: {fork}")))?;
    state
        .content
        .version(fork_id, version)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("unknown version: {version}")))
}

/// Parse and validate the packed index array: little-endian int32s, each
/// in bounds, no duplicates.
fn parse_indices(body: &[u8], entry_count: i64) -> ApiResult<Vec<i64>> {
    let mut indices = Vec::with_capacity(body.len() / 4);
    let mut seen = vec![0u64; (entry_count.max(0) as usize).div_ceil(64)];

    for chunk in body.chunks_exact(4) {
        let index = i32::from_le_bytes(chunk.try_into().unwrap()) as i64;
        if index < 0 || index >= entry_count {
            return Err(ApiError::BadRequest(format!(
                "manifest index out of bounds: {index}"
            )));
        }
        let (word, bit) = ((index / 64) as usize, index % 64);
        if seen[word] & (1 << bit) != 0 {
            return Err(ApiError::BadRequest(format!(
                "duplicate manifest index: {index}"
            )));
        }
        seen[word] |= 1 << bit;
        indices.push(index);
    }

    Ok(indices)
}

/// Pick (stream, pre) compression. The auto ratio, when positive,
/// overrides the configured flags: many-of-few requests stream-compress,
/// sparse requests use per-blob pre-compression. Stream compression is
/// only honored when the client accepts zstd.
fn select_compression(
    config: &ContentConfig,
    requested: u64,
    distinct_blobs: u64,
    client_accepts_zstd: bool,
) -> (bool, bool) {
    let mut stream_compress = config.stream_compress;
    let mut pre_compress = config.send_pre_compressed;

    if config.auto_stream_compress_ratio > 0.0 && distinct_blobs > 0 {
        let ratio = requested as f32 / distinct_blobs as f32;
        if ratio > config.auto_stream_compress_ratio {
            stream_compress = true;
            pre_compress = false;
        } else {
            stream_compress = false;
            pre_compress = true;
        }
    }

    if !client_accepts_zstd {
        stream_compress = false;
    }

    (stream_compress, pre_compress)
}

/// Whether the Accept-Encoding header lists zstd.
fn accepts_zstd(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|value| {
            value.split(',').any(|part| {
                part.split(';').next().is_some_and(|coding| {
                    coding.trim().eq_ignore_ascii_case("zstd")
                })
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(stream: bool, pre: bool, ratio: f32) -> ContentConfig {
        ContentConfig {
            stream_compress: stream,
            send_pre_compressed: pre,
            auto_stream_compress_ratio: ratio,
            ..ContentConfig::default()
        }
    }

    #[test]
    fn parse_indices_accepts_valid_subset() {
        let body = [1i32, 0, 3]
            .iter()
            .flat_map(|i| i.to_le_bytes())
            .collect::<Vec<u8>>();
        assert_eq!(parse_indices(&body, 4).unwrap(), vec![1, 0, 3]);
    }

    #[test]
    fn parse_indices_rejects_out_of_bounds() {
        let body = 4i32.to_le_bytes().to_vec();
        assert!(parse_indices(&body, 4).is_err());
        let body = (-1i32).to_le_bytes().to_vec();
        assert!(parse_indices(&body, 4).is_err());
    }

    #[test]
    fn parse_indices_rejects_duplicates() {
        let body = [2i32, 2]
            .iter()
            .flat_map(|i| i.to_le_bytes())
            .collect::<Vec<u8>>();
        assert!(parse_indices(&body, 4).is_err());
    }

    #[test]
    fn parse_indices_empty_body_is_empty_request() {
        assert!(parse_indices(&[], 0).unwrap().is_empty());
    }

    #[test]
    fn auto_ratio_picks_stream_for_bulk_requests() {
        let config = config(false, true, 0.5);
        // 6 of 10 distinct blobs: above ratio, stream wins.
        assert_eq!(select_compression(&config, 6, 10, true), (true, false));
        // 3 of 10: below ratio, pre-compression wins.
        assert_eq!(select_compression(&config, 3, 10, true), (false, true));
    }

    #[test]
    fn auto_ratio_disabled_uses_configured_flags() {
        let config1 = config(true, false, 0.0);
        assert_eq!(select_compression(&config1, 100, 10, true), (true, false));
        let config2 = config(false, true, -1.0);
        assert_eq!(select_compression(&config2, 100, 10, true), (false, true));
    }

    #[test]
    fn stream_compression_requires_zstd_acceptance() {
        let config = config(true, false, 0.0);
        assert_eq!(select_compression(&config, 1, 10, false), (false, false));

        let auto = config_with_ratio();
        assert_eq!(select_compression(&auto, 9, 10, false), (false, false));
    }

    fn config_with_ratio() -> ContentConfig {
        config(false, true, 0.5)
    }

    #[test]
    fn accepts_zstd_parses_header_lists() {
        let mut headers = HeaderMap::new();
        assert!(!accepts_zstd(&headers));
        headers.insert(ACCEPT_ENCODING, "gzip, zstd;q=0.8".parse().unwrap());
        assert!(accepts_zstd(&headers));
        headers.insert(ACCEPT_ENCODING, "gzip, br".parse().unwrap());
        assert!(!accepts_zstd(&headers));
    }
}

//! Download request logging.
//!
//! Handlers push entries onto a bounded queue; exactly one background
//! task drains it into the configured sink. A full queue back-pressures
//! producers rather than dropping entries.

use bytes::Bytes;
use depot_core::ContentDigest;
use depot_core::config::RequestLogStorage;
use depot_db::ContentStore;
use depot_db::models::RequestLogInsert;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::mpsc;

/// Queue capacity between handlers and the single writer task.
pub const QUEUE_CAPACITY: usize = 32;

/// One logged download request.
#[derive(Debug, Clone)]
pub struct RequestLogEntry {
    pub time: OffsetDateTime,
    pub pre_compressed: bool,
    pub stream_compressed: bool,
    pub protocol: u32,
    pub bytes_sent: u64,
    pub version_id: i64,
    /// Raw request body (the packed index array).
    pub body: Bytes,
}

impl RequestLogEntry {
    /// Pack the compression booleans into the stored flags integer.
    /// Bit 0 = pre-compressed records, bit 1 = stream-compressed body.
    pub fn compression_flags(&self) -> i64 {
        (self.pre_compressed as i64) | ((self.stream_compressed as i64) << 1)
    }
}

/// Spawn the writer task for the configured sink. Returns `None` when the
/// sink is `None`, in which case nothing is ever queued.
pub fn spawn_writer(
    storage: RequestLogStorage,
    content: ContentStore,
) -> Option<mpsc::Sender<RequestLogEntry>> {
    if storage == RequestLogStorage::None {
        return None;
    }

    let (tx, mut rx) = mpsc::channel::<RequestLogEntry>(QUEUE_CAPACITY);

    tokio::spawn(async move {
        while let Some(entry) = rx.recv().await {
            match storage {
                RequestLogStorage::None => unreachable!("writer not spawned for sink None"),
                RequestLogStorage::Console => log_to_console(&entry),
                RequestLogStorage::Database => {
                    if let Err(error) = log_to_database(&content, &entry).await {
                        tracing::error!(%error, "Failed to persist request log entry");
                    }
                }
            }
        }
    });

    Some(tx)
}

fn log_to_console(entry: &RequestLogEntry) {
    let body_hash = ContentDigest::compute(&entry.body);
    tracing::info!(
        time = %entry.time.format(&Rfc3339).unwrap_or_default(),
        flags = entry.compression_flags(),
        protocol = entry.protocol,
        version_id = entry.version_id,
        bytes_sent = entry.bytes_sent,
        body_len = entry.body.len(),
        body_hash = %body_hash,
        "Download request"
    );
}

async fn log_to_database(
    content: &ContentStore,
    entry: &RequestLogEntry,
) -> depot_db::DbResult<()> {
    let body_hash = ContentDigest::compute(&entry.body);
    content
        .insert_request_log(&RequestLogInsert {
            time: entry.time,
            compression_flags: entry.compression_flags(),
            protocol: entry.protocol as i64,
            bytes_sent: entry.bytes_sent as i64,
            version_id: entry.version_id,
            body_hash: body_hash.as_bytes().to_vec(),
            body: entry.body.to_vec(),
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pre: bool, stream: bool) -> RequestLogEntry {
        RequestLogEntry {
            time: OffsetDateTime::now_utc(),
            pre_compressed: pre,
            stream_compressed: stream,
            protocol: 1,
            bytes_sent: 0,
            version_id: 1,
            body: Bytes::new(),
        }
    }

    #[test]
    fn flags_pack_both_bits() {
        assert_eq!(entry(false, false).compression_flags(), 0);
        assert_eq!(entry(true, false).compression_flags(), 1);
        assert_eq!(entry(false, true).compression_flags(), 2);
        assert_eq!(entry(true, true).compression_flags(), 3);
    }
}

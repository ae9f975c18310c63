//! Database models mapping to the store schemas.

use sqlx::FromRow;
use time::OffsetDateTime;

// =============================================================================
// Content database
// =============================================================================

/// Ingested version metadata. Manifest text is fetched separately; it can
/// be large and most queries only need the header fields.
#[derive(Debug, Clone, FromRow)]
pub struct ContentVersionRow {
    #[sqlx(rename = "Id")]
    pub id: i64,
    #[sqlx(rename = "ForkId")]
    pub fork_id: i64,
    #[sqlx(rename = "Name")]
    pub name: String,
    #[sqlx(rename = "TimeAdded")]
    pub time_added: OffsetDateTime,
    #[sqlx(rename = "ManifestHash")]
    pub manifest_hash: Vec<u8>,
    #[sqlx(rename = "CountDistinctBlobs")]
    pub count_distinct_blobs: i64,
}

/// A stored blob's payload as read back for a download.
#[derive(Debug, Clone, FromRow)]
pub struct BlobPayloadRow {
    #[sqlx(rename = "Compression")]
    pub compression: i64,
    #[sqlx(rename = "Size")]
    pub size: i64,
    #[sqlx(rename = "Data")]
    pub data: Vec<u8>,
}

/// A download request-log row to insert. The raw body is deduplicated
/// into `RequestLogBlob` by its hash.
#[derive(Debug, Clone)]
pub struct RequestLogInsert {
    pub time: OffsetDateTime,
    /// Bit 0 = pre-compressed records, bit 1 = stream-compressed body.
    pub compression_flags: i64,
    pub protocol: i64,
    pub bytes_sent: i64,
    pub version_id: i64,
    pub body_hash: Vec<u8>,
    pub body: Vec<u8>,
}

// =============================================================================
// Publish database
// =============================================================================

/// Fork row in the publish database.
#[derive(Debug, Clone, FromRow)]
pub struct ForkRow {
    #[sqlx(rename = "Id")]
    pub id: i64,
    #[sqlx(rename = "Name")]
    pub name: String,
}

/// A published build of a fork.
#[derive(Debug, Clone, FromRow)]
pub struct ForkVersionRow {
    #[sqlx(rename = "Id")]
    pub id: i64,
    #[sqlx(rename = "ForkId")]
    pub fork_id: i64,
    #[sqlx(rename = "Name")]
    pub name: String,
    #[sqlx(rename = "PublishedTime")]
    pub published_time: OffsetDateTime,
    #[sqlx(rename = "EngineVersion")]
    pub engine_version: String,
    #[sqlx(rename = "ClientFileName")]
    pub client_file_name: String,
    #[sqlx(rename = "ClientSha256")]
    pub client_sha256: Vec<u8>,
    #[sqlx(rename = "Available")]
    pub available: bool,
}

/// Per-platform server artifact of a version.
#[derive(Debug, Clone, FromRow)]
pub struct ServerBuildRow {
    #[sqlx(rename = "Id")]
    pub id: i64,
    #[sqlx(rename = "ForkVersionId")]
    pub fork_version_id: i64,
    #[sqlx(rename = "Platform")]
    pub platform: String,
    #[sqlx(rename = "FileName")]
    pub file_name: String,
    #[sqlx(rename = "Sha256")]
    pub sha256: Vec<u8>,
    #[sqlx(rename = "FileSize")]
    pub file_size: Option<i64>,
}

/// A multi-request publish whose finish has not yet been called.
#[derive(Debug, Clone, FromRow)]
pub struct PublishInProgressRow {
    #[sqlx(rename = "Id")]
    pub id: i64,
    #[sqlx(rename = "ForkId")]
    pub fork_id: i64,
    #[sqlx(rename = "Name")]
    pub name: String,
    #[sqlx(rename = "StartTime")]
    pub start_time: OffsetDateTime,
    #[sqlx(rename = "EngineVersion")]
    pub engine_version: String,
}

/// Stale in-progress publish joined with its fork name, for cleanup.
#[derive(Debug, Clone, FromRow)]
pub struct StalePublishRow {
    #[sqlx(rename = "Id")]
    pub id: i64,
    #[sqlx(rename = "ForkName")]
    pub fork_name: String,
    #[sqlx(rename = "Name")]
    pub name: String,
    #[sqlx(rename = "StartTime")]
    pub start_time: OffsetDateTime,
}

//! Content store: deduplicated blobs and per-version manifests.

use crate::error::{DbError, DbResult};
use crate::migrations::{CONTENT_MIGRATIONS, run_migrations};
use crate::models::{BlobPayloadRow, ContentVersionRow, RequestLogInsert};
use sqlx::{Pool, Sqlite, SqliteConnection, Transaction};
use std::path::Path;
use time::OffsetDateTime;

/// Handle on the content database. Cheap to clone.
#[derive(Clone)]
pub struct ContentStore {
    pool: Pool<Sqlite>,
}

impl ContentStore {
    /// Open the content database, running migrations.
    pub async fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        let pool = crate::open_pool(path.as_ref()).await?;
        run_migrations(&pool, CONTENT_MIGRATIONS).await?;
        Ok(Self { pool })
    }

    /// Begin an explicit transaction (ingestion, request-log writes).
    pub async fn begin(&self) -> DbResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Close the pool. Called on graceful shutdown.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // =========================================================================
    // Forks
    // =========================================================================

    /// Insert the fork if missing and return its id. Idempotent.
    pub async fn upsert_fork(&self, name: &str) -> DbResult<i64> {
        sqlx::query("INSERT INTO Fork (Name) VALUES (?) ON CONFLICT (Name) DO NOTHING")
            .bind(name)
            .execute(&self.pool)
            .await?;
        let id = sqlx::query_scalar("SELECT Id FROM Fork WHERE Name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    /// Look up a fork id by name.
    pub async fn fork_id(&self, name: &str) -> DbResult<Option<i64>> {
        let id = sqlx::query_scalar("SELECT Id FROM Fork WHERE Name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    // =========================================================================
    // Versions
    // =========================================================================

    /// Whether a version has been ingested.
    pub async fn version_exists(&self, fork_id: i64, name: &str) -> DbResult<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM ContentVersion WHERE ForkId = ? AND Name = ?",
        )
        .bind(fork_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// All ingested version names of a fork.
    pub async fn version_names(&self, fork_id: i64) -> DbResult<Vec<String>> {
        let names = sqlx::query_scalar("SELECT Name FROM ContentVersion WHERE ForkId = ?")
            .bind(fork_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(names)
    }

    /// Version metadata by `(fork, name)`, without the manifest text.
    pub async fn version(&self, fork_id: i64, name: &str) -> DbResult<Option<ContentVersionRow>> {
        let row = sqlx::query_as::<_, ContentVersionRow>(
            "SELECT Id, ForkId, Name, TimeAdded, ManifestHash, CountDistinctBlobs
             FROM ContentVersion WHERE ForkId = ? AND Name = ?",
        )
        .bind(fork_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// The stored (zstd-compressed) manifest text of a version.
    pub async fn manifest_data(&self, version_id: i64) -> DbResult<Vec<u8>> {
        let data = sqlx::query_scalar("SELECT ManifestData FROM ContentVersion WHERE Id = ?")
            .bind(version_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("content version {version_id}")))?;
        Ok(data)
    }

    /// Number of manifest entries in a version.
    pub async fn entry_count(&self, version_id: i64) -> DbResult<i64> {
        let count =
            sqlx::query_scalar("SELECT COUNT(*) FROM ContentManifestEntry WHERE VersionId = ?")
                .bind(version_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// The blob payload backing one manifest entry.
    pub async fn blob_for_entry(
        &self,
        version_id: i64,
        manifest_idx: i64,
    ) -> DbResult<BlobPayloadRow> {
        let row = sqlx::query_as::<_, BlobPayloadRow>(
            "SELECT c.Compression, c.Size, c.Data
             FROM ContentManifestEntry e
             JOIN Content c ON c.Id = e.ContentId
             WHERE e.VersionId = ? AND e.ManifestIdx = ?",
        )
        .bind(version_id)
        .bind(manifest_idx)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            DbError::NotFound(format!("manifest entry {manifest_idx} of version {version_id}"))
        })?;
        Ok(row)
    }

    /// Total ingested versions across all forks (status endpoint).
    pub async fn content_version_count(&self) -> DbResult<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM ContentVersion")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Total deduplicated blobs in the store.
    pub async fn blob_count(&self) -> DbResult<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM Content")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Total logged download requests.
    pub async fn request_log_count(&self) -> DbResult<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM RequestLog")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // =========================================================================
    // Ingestion (transaction-scoped)
    // =========================================================================

    /// Insert a new version row with placeholder manifest fields.
    pub async fn insert_version(
        conn: &mut SqliteConnection,
        fork_id: i64,
        name: &str,
        time_added: OffsetDateTime,
    ) -> DbResult<i64> {
        let id = sqlx::query_scalar(
            "INSERT INTO ContentVersion
                (ForkId, Name, TimeAdded, ManifestHash, ManifestData)
             VALUES (?, ?, ?, x'', x'')
             RETURNING Id",
        )
        .bind(fork_id)
        .bind(name)
        .bind(time_added)
        .fetch_one(conn)
        .await?;
        Ok(id)
    }

    /// Look up a deduplicated blob by its content hash.
    pub async fn find_content_id(
        conn: &mut SqliteConnection,
        hash: &[u8],
    ) -> DbResult<Option<i64>> {
        let id = sqlx::query_scalar("SELECT Id FROM Content WHERE Hash = ?")
            .bind(hash)
            .fetch_optional(conn)
            .await?;
        Ok(id)
    }

    /// Insert a new blob.
    pub async fn insert_content(
        conn: &mut SqliteConnection,
        hash: &[u8],
        size: i64,
        compression: i64,
        data: &[u8],
    ) -> DbResult<i64> {
        let id = sqlx::query_scalar(
            "INSERT INTO Content (Hash, Size, Compression, Data)
             VALUES (?, ?, ?, ?)
             RETURNING Id",
        )
        .bind(hash)
        .bind(size)
        .bind(compression)
        .bind(data)
        .fetch_one(conn)
        .await?;
        Ok(id)
    }

    /// Record that manifest position `manifest_idx` of a version is `content_id`.
    pub async fn insert_manifest_entry(
        conn: &mut SqliteConnection,
        version_id: i64,
        manifest_idx: i64,
        content_id: i64,
    ) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO ContentManifestEntry (VersionId, ManifestIdx, ContentId)
             VALUES (?, ?, ?)",
        )
        .bind(version_id)
        .bind(manifest_idx)
        .bind(content_id)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Fill in the manifest hash, compressed manifest text, and distinct
    /// blob count once every entry of the version is recorded.
    pub async fn finalize_version(
        conn: &mut SqliteConnection,
        version_id: i64,
        manifest_hash: &[u8],
        manifest_data: &[u8],
    ) -> DbResult<()> {
        sqlx::query(
            "UPDATE ContentVersion
             SET ManifestHash = ?,
                 ManifestData = ?,
                 CountDistinctBlobs = (
                     SELECT COUNT(DISTINCT ContentId)
                     FROM ContentManifestEntry
                     WHERE VersionId = ?
                 )
             WHERE Id = ?",
        )
        .bind(manifest_hash)
        .bind(manifest_data)
        .bind(version_id)
        .bind(version_id)
        .execute(conn)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Request log
    // =========================================================================

    /// Insert a request-log row, deduplicating the body blob by hash.
    pub async fn insert_request_log(&self, entry: &RequestLogInsert) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        let blob_id: i64 = match sqlx::query_scalar("SELECT Id FROM RequestLogBlob WHERE Hash = ?")
            .bind(&entry.body_hash)
            .fetch_optional(&mut *tx)
            .await?
        {
            Some(id) => id,
            None => {
                sqlx::query_scalar(
                    "INSERT INTO RequestLogBlob (Hash, Data) VALUES (?, ?) RETURNING Id",
                )
                .bind(&entry.body_hash)
                .bind(&entry.body)
                .fetch_one(&mut *tx)
                .await?
            }
        };

        sqlx::query(
            "INSERT INTO RequestLog (Time, Compression, Protocol, BytesSent, VersionId, BlobId)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.time)
        .bind(entry.compression_flags)
        .bind(entry.protocol)
        .bind(entry.bytes_sent)
        .bind(entry.version_id)
        .bind(blob_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

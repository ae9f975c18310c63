//! Publish store: forks, published versions, and in-progress publishes.

use crate::error::{DbError, DbResult};
use crate::migrations::{PUBLISH_MIGRATIONS, run_migrations};
use crate::models::{
    ForkRow, ForkVersionRow, PublishInProgressRow, ServerBuildRow, StalePublishRow,
};
use sqlx::{Pool, QueryBuilder, Sqlite, SqliteConnection, Transaction};
use std::path::Path;
use time::OffsetDateTime;

/// Handle on the publish database. Cheap to clone.
#[derive(Clone)]
pub struct PublishStore {
    pool: Pool<Sqlite>,
}

impl PublishStore {
    /// Open the publish database, running migrations.
    pub async fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        let pool = crate::open_pool(path.as_ref()).await?;
        run_migrations(&pool, PUBLISH_MIGRATIONS).await?;
        Ok(Self { pool })
    }

    /// Begin an explicit transaction (publish finalization, abort+restart).
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

    /// Look up a fork by name.
    pub async fn fork(&self, name: &str) -> DbResult<Option<ForkRow>> {
        let row = sqlx::query_as::<_, ForkRow>("SELECT Id, Name FROM Fork WHERE Name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// The cached server-manifest JSON, or `None` if never built.
    pub async fn manifest_cache(&self, fork_id: i64) -> DbResult<Option<Vec<u8>>> {
        let cache: Option<Option<Vec<u8>>> =
            sqlx::query_scalar("SELECT ServerManifestCache FROM Fork WHERE Id = ?")
                .bind(fork_id)
                .fetch_optional(&self.pool)
                .await?;
        cache.ok_or_else(|| DbError::NotFound(format!("fork {fork_id}")))
    }

    /// Replace the cached server-manifest JSON.
    pub async fn set_manifest_cache(&self, fork_id: i64, cache: &[u8]) -> DbResult<()> {
        sqlx::query("UPDATE Fork SET ServerManifestCache = ? WHERE Id = ?")
            .bind(cache)
            .bind(fork_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Versions
    // =========================================================================

    /// Whether a version row exists, available or not.
    pub async fn version_exists(&self, fork_id: i64, name: &str) -> DbResult<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM ForkVersion WHERE ForkId = ? AND Name = ?")
                .bind(fork_id)
                .bind(name)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    /// Insert a version row. Maps a `(fork, name)` collision to `AlreadyExists`.
    pub async fn insert_version(
        conn: &mut SqliteConnection,
        fork_id: i64,
        name: &str,
        published_time: OffsetDateTime,
        engine_version: &str,
        client_file_name: &str,
        client_sha256: &[u8],
    ) -> DbResult<i64> {
        let result = sqlx::query_scalar(
            "INSERT INTO ForkVersion
                (ForkId, Name, PublishedTime, EngineVersion, ClientFileName, ClientSha256)
             VALUES (?, ?, ?, ?, ?, ?)
             RETURNING Id",
        )
        .bind(fork_id)
        .bind(name)
        .bind(published_time)
        .bind(engine_version)
        .bind(client_file_name)
        .bind(client_sha256)
        .fetch_one(conn)
        .await;

        match result {
            Ok(id) => Ok(id),
            Err(e) => {
                let e = DbError::from(e);
                if e.is_unique_violation() {
                    Err(DbError::AlreadyExists(format!("version {name}")))
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Insert one per-platform server build of a version.
    pub async fn insert_server_build(
        conn: &mut SqliteConnection,
        fork_version_id: i64,
        platform: &str,
        file_name: &str,
        sha256: &[u8],
        file_size: Option<i64>,
    ) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO ForkVersionServerBuild
                (ForkVersionId, Platform, FileName, Sha256, FileSize)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(fork_version_id)
        .bind(platform)
        .bind(file_name)
        .bind(sha256)
        .bind(file_size)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Available versions of a fork, newest first.
    pub async fn available_versions(
        &self,
        fork_id: i64,
        limit: i64,
    ) -> DbResult<Vec<ForkVersionRow>> {
        let rows = sqlx::query_as::<_, ForkVersionRow>(
            "SELECT Id, ForkId, Name, PublishedTime, EngineVersion, ClientFileName,
                    ClientSha256, Available
             FROM ForkVersion
             WHERE ForkId = ? AND Available = 1
             ORDER BY PublishedTime DESC
             LIMIT ?",
        )
        .bind(fork_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// One version by name.
    pub async fn version(&self, fork_id: i64, name: &str) -> DbResult<Option<ForkVersionRow>> {
        let row = sqlx::query_as::<_, ForkVersionRow>(
            "SELECT Id, ForkId, Name, PublishedTime, EngineVersion, ClientFileName,
                    ClientSha256, Available
             FROM ForkVersion
             WHERE ForkId = ? AND Name = ?",
        )
        .bind(fork_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Server builds of a version, ordered by platform.
    pub async fn server_builds(&self, fork_version_id: i64) -> DbResult<Vec<ServerBuildRow>> {
        let rows = sqlx::query_as::<_, ServerBuildRow>(
            "SELECT Id, ForkVersionId, Platform, FileName, Sha256, FileSize
             FROM ForkVersionServerBuild
             WHERE ForkVersionId = ?
             ORDER BY Platform",
        )
        .bind(fork_version_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Flip `Available` on every named version that is not yet available.
    /// Returns how many versions changed.
    pub async fn mark_available(&self, fork_id: i64, names: &[String]) -> DbResult<u64> {
        if names.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE ForkVersion SET Available = 1 WHERE ForkId = ");
        builder.push_bind(fork_id);
        builder.push(" AND Available = 0 AND Name IN (");
        let mut separated = builder.separated(", ");
        for name in names {
            separated.push_bind(name);
        }
        builder.push(")");

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Versions published before `cutoff` (prune candidates).
    pub async fn versions_published_before(
        &self,
        fork_id: i64,
        cutoff: OffsetDateTime,
    ) -> DbResult<Vec<ForkVersionRow>> {
        let rows = sqlx::query_as::<_, ForkVersionRow>(
            "SELECT Id, ForkId, Name, PublishedTime, EngineVersion, ClientFileName,
                    ClientSha256, Available
             FROM ForkVersion
             WHERE ForkId = ? AND PublishedTime < ?",
        )
        .bind(fork_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Delete a version row; server builds cascade.
    pub async fn delete_version(&self, fork_version_id: i64) -> DbResult<()> {
        sqlx::query("DELETE FROM ForkVersion WHERE Id = ?")
            .bind(fork_version_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // =========================================================================
    // In-progress publishes
    // =========================================================================

    /// The in-progress publish for `(fork, version)`, if any.
    pub async fn in_progress(
        &self,
        fork_id: i64,
        name: &str,
    ) -> DbResult<Option<PublishInProgressRow>> {
        let row = sqlx::query_as::<_, PublishInProgressRow>(
            "SELECT Id, ForkId, Name, StartTime, EngineVersion
             FROM PublishInProgress
             WHERE ForkId = ? AND Name = ?",
        )
        .bind(fork_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Insert an in-progress publish row.
    pub async fn insert_in_progress(
        conn: &mut SqliteConnection,
        fork_id: i64,
        name: &str,
        start_time: OffsetDateTime,
        engine_version: &str,
    ) -> DbResult<i64> {
        let id = sqlx::query_scalar(
            "INSERT INTO PublishInProgress (ForkId, Name, StartTime, EngineVersion)
             VALUES (?, ?, ?, ?)
             RETURNING Id",
        )
        .bind(fork_id)
        .bind(name)
        .bind(start_time)
        .bind(engine_version)
        .fetch_one(conn)
        .await?;
        Ok(id)
    }

    /// Remove an in-progress publish row.
    pub async fn delete_in_progress(conn: &mut SqliteConnection, id: i64) -> DbResult<()> {
        sqlx::query("DELETE FROM PublishInProgress WHERE Id = ?")
            .bind(id)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// In-progress publishes started before `cutoff`, with fork names for
    /// directory cleanup.
    pub async fn stale_in_progress(
        &self,
        cutoff: OffsetDateTime,
    ) -> DbResult<Vec<StalePublishRow>> {
        let rows = sqlx::query_as::<_, StalePublishRow>(
            "SELECT p.Id, f.Name AS ForkName, p.Name, p.StartTime
             FROM PublishInProgress p
             JOIN Fork f ON f.Id = p.ForkId
             WHERE p.StartTime < ?",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use time::Duration;

    async fn open_store() -> (tempfile::TempDir, PublishStore) {
        let temp = tempdir().unwrap();
        let store = PublishStore::open(temp.path().join("publish.db")).await.unwrap();
        (temp, store)
    }

    async fn insert_test_version(store: &PublishStore, fork: i64, name: &str) -> i64 {
        let mut tx = store.begin().await.unwrap();
        let id = PublishStore::insert_version(
            &mut tx,
            fork,
            name,
            OffsetDateTime::now_utc(),
            "220.0.0",
            "Client.zip",
            &[0u8; 32],
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        id
    }

    #[tokio::test]
    async fn duplicate_version_maps_to_already_exists() {
        let (_temp, store) = open_store().await;
        let fork = store.upsert_fork("wizards").await.unwrap();
        insert_test_version(&store, fork, "1.0").await;

        let mut tx = store.begin().await.unwrap();
        let dup = PublishStore::insert_version(
            &mut tx,
            fork,
            "1.0",
            OffsetDateTime::now_utc(),
            "220.0.0",
            "Client.zip",
            &[0u8; 32],
        )
        .await;
        assert!(matches!(dup, Err(DbError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn availability_gates_listing() {
        let (_temp, store) = open_store().await;
        let fork = store.upsert_fork("wizards").await.unwrap();
        insert_test_version(&store, fork, "1.0").await;
        insert_test_version(&store, fork, "2.0").await;

        assert!(store.available_versions(fork, 50).await.unwrap().is_empty());

        let flipped = store
            .mark_available(fork, &["1.0".to_string(), "ghost".to_string()])
            .await
            .unwrap();
        assert_eq!(flipped, 1);
        // Marking again is a no-op.
        assert_eq!(store.mark_available(fork, &["1.0".to_string()]).await.unwrap(), 0);

        let listed = store.available_versions(fork, 50).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "1.0");
        assert!(listed[0].available);
    }

    #[tokio::test]
    async fn server_builds_cascade_on_version_delete() {
        let (_temp, store) = open_store().await;
        let fork = store.upsert_fork("wizards").await.unwrap();
        let version = insert_test_version(&store, fork, "1.0").await;

        let mut tx = store.begin().await.unwrap();
        PublishStore::insert_server_build(
            &mut tx,
            version,
            "linux-x64",
            "Server_linux-x64.zip",
            &[1u8; 32],
            Some(1024),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.server_builds(version).await.unwrap().len(), 1);
        store.delete_version(version).await.unwrap();
        assert_eq!(store.server_builds(version).await.unwrap().len(), 0);
        assert!(!store.version_exists(fork, "1.0").await.unwrap());
    }

    #[tokio::test]
    async fn stale_in_progress_selection() {
        let (_temp, store) = open_store().await;
        let fork = store.upsert_fork("wizards").await.unwrap();
        let now = OffsetDateTime::now_utc();

        let mut tx = store.begin().await.unwrap();
        PublishStore::insert_in_progress(&mut tx, fork, "old", now - Duration::hours(2), "220")
            .await
            .unwrap();
        let fresh_id =
            PublishStore::insert_in_progress(&mut tx, fork, "fresh", now, "220").await.unwrap();
        tx.commit().await.unwrap();

        let stale = store.stale_in_progress(now - Duration::hours(1)).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].name, "old");
        assert_eq!(stale[0].fork_name, "wizards");

        let mut tx = store.begin().await.unwrap();
        PublishStore::delete_in_progress(&mut tx, stale[0].id).await.unwrap();
        tx.commit().await.unwrap();

        assert!(store.in_progress(fork, "old").await.unwrap().is_none());
        assert_eq!(store.in_progress(fork, "fresh").await.unwrap().unwrap().id, fresh_id);
    }

    #[tokio::test]
    async fn manifest_cache_roundtrip() {
        let (_temp, store) = open_store().await;
        let fork = store.upsert_fork("wizards").await.unwrap();

        assert_eq!(store.manifest_cache(fork).await.unwrap(), None);
        store.set_manifest_cache(fork, br#"{"builds":{}}"#).await.unwrap();
        assert_eq!(
            store.manifest_cache(fork).await.unwrap().as_deref(),
            Some(br#"{"builds":{}}"#.as_slice())
        );
        assert!(matches!(store.manifest_cache(9999).await, Err(DbError::NotFound(_))));
    }
}

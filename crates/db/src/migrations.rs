//! Ordered schema migrations.
//!
//! Each database carries an explicit, lexically ordered list of scripts
//! compiled into the binary. Applied scripts are recorded in
//! `SchemaVersions`; the whole run happens inside one transaction with a
//! savepoint per script, so a failing script rolls back cleanly and
//! aborts startup without leaving half a schema behind.

use crate::error::{DbError, DbResult};
use sqlx::{Pool, Sqlite};
use std::collections::HashSet;
use time::OffsetDateTime;

/// A single migration script.
pub struct Migration {
    /// Lexically ordered script name, e.g. `0001-init`.
    pub name: &'static str,
    /// The SQL body; may contain multiple statements.
    pub sql: &'static str,
}

/// Apply all not-yet-applied migrations in order.
pub async fn run_migrations(pool: &Pool<Sqlite>, migrations: &[Migration]) -> DbResult<()> {
    debug_assert!(
        migrations.windows(2).all(|w| w[0].name < w[1].name),
        "migration scripts must be lexically ordered"
    );

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS SchemaVersions (
            ScriptName TEXT PRIMARY KEY,
            Applied TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    let mut tx = pool.begin().await?;

    let applied: HashSet<String> = sqlx::query_scalar("SELECT ScriptName FROM SchemaVersions")
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .collect();

    for migration in migrations {
        if applied.contains(migration.name) {
            continue;
        }

        sqlx::query("SAVEPOINT migration").execute(&mut *tx).await?;

        let result = async {
            sqlx::raw_sql(migration.sql).execute(&mut *tx).await?;
            sqlx::query("INSERT INTO SchemaVersions (ScriptName, Applied) VALUES (?, ?)")
                .bind(migration.name)
                .bind(OffsetDateTime::now_utc())
                .execute(&mut *tx)
                .await?;
            Ok::<_, sqlx::Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                sqlx::query("RELEASE migration").execute(&mut *tx).await?;
                tracing::info!(script = migration.name, "Applied migration");
            }
            Err(source) => {
                sqlx::query("ROLLBACK TO migration").execute(&mut *tx).await?;
                return Err(DbError::Migration {
                    script: migration.name.to_string(),
                    source,
                });
            }
        }
    }

    tx.commit().await?;
    Ok(())
}

/// Content database schema.
pub const CONTENT_MIGRATIONS: &[Migration] = &[Migration {
    name: "0001-content-init",
    sql: r#"
CREATE TABLE Fork (
    Id INTEGER PRIMARY KEY,
    Name TEXT NOT NULL UNIQUE
);

CREATE TABLE Content (
    Id INTEGER PRIMARY KEY,
    Hash BLOB NOT NULL UNIQUE,
    Size INTEGER NOT NULL,
    Compression INTEGER NOT NULL,
    Data BLOB NOT NULL
);

CREATE TABLE ContentVersion (
    Id INTEGER PRIMARY KEY,
    ForkId INTEGER NOT NULL REFERENCES Fork(Id) ON DELETE CASCADE,
    Name TEXT NOT NULL,
    TimeAdded TEXT NOT NULL,
    ManifestHash BLOB NOT NULL,
    ManifestData BLOB NOT NULL,
    CountDistinctBlobs INTEGER NOT NULL DEFAULT 0,
    UNIQUE (ForkId, Name)
);

CREATE TABLE ContentManifestEntry (
    VersionId INTEGER NOT NULL REFERENCES ContentVersion(Id) ON DELETE CASCADE,
    ManifestIdx INTEGER NOT NULL,
    ContentId INTEGER NOT NULL REFERENCES Content(Id) ON DELETE RESTRICT,
    PRIMARY KEY (VersionId, ManifestIdx)
) WITHOUT ROWID;

CREATE INDEX IDX_ContentManifestEntry_ContentId ON ContentManifestEntry(ContentId);

CREATE TABLE RequestLogBlob (
    Id INTEGER PRIMARY KEY,
    Hash BLOB NOT NULL UNIQUE,
    Data BLOB NOT NULL
);

CREATE TABLE RequestLog (
    Id INTEGER PRIMARY KEY,
    Time TEXT NOT NULL,
    Compression INTEGER NOT NULL,
    Protocol INTEGER NOT NULL,
    BytesSent INTEGER NOT NULL,
    VersionId INTEGER NOT NULL REFERENCES ContentVersion(Id) ON DELETE CASCADE,
    BlobId INTEGER NOT NULL REFERENCES RequestLogBlob(Id)
);
"#,
}];

/// Publish database schema.
pub const PUBLISH_MIGRATIONS: &[Migration] = &[Migration {
    name: "0001-publish-init",
    sql: r#"
CREATE TABLE Fork (
    Id INTEGER PRIMARY KEY,
    Name TEXT NOT NULL UNIQUE,
    ServerManifestCache BLOB
);

CREATE TABLE ForkVersion (
    Id INTEGER PRIMARY KEY,
    ForkId INTEGER NOT NULL REFERENCES Fork(Id) ON DELETE CASCADE,
    Name TEXT NOT NULL,
    PublishedTime TEXT NOT NULL,
    EngineVersion TEXT NOT NULL,
    ClientFileName TEXT NOT NULL,
    ClientSha256 BLOB NOT NULL,
    Available INTEGER NOT NULL DEFAULT 0,
    UNIQUE (ForkId, Name)
);

CREATE TABLE ForkVersionServerBuild (
    Id INTEGER PRIMARY KEY,
    ForkVersionId INTEGER NOT NULL REFERENCES ForkVersion(Id) ON DELETE CASCADE,
    Platform TEXT NOT NULL,
    FileName TEXT NOT NULL,
    Sha256 BLOB NOT NULL,
    FileSize INTEGER,
    UNIQUE (ForkVersionId, Platform),
    UNIQUE (ForkVersionId, FileName)
);

CREATE TABLE PublishInProgress (
    Id INTEGER PRIMARY KEY,
    ForkId INTEGER NOT NULL REFERENCES Fork(Id) ON DELETE CASCADE,
    Name TEXT NOT NULL,
    StartTime TEXT NOT NULL,
    EngineVersion TEXT NOT NULL,
    UNIQUE (ForkId, Name)
);
"#,
}];

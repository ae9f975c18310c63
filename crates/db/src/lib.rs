//! SQLite stores for the depot build CDN.
//!
//! Two deliberately separate databases:
//! - the **content store**: deduplicated blobs, per-version manifest
//!   entries, compressed manifest text, request logs;
//! - the **publish store**: forks, published versions, server builds,
//!   in-progress publishes, and the cached server-manifest JSON.
//!
//! Both open WAL-mode pools and run their ordered migrations on open.

pub mod content;
pub mod error;
pub mod migrations;
pub mod models;
pub mod publish;

pub use content::ContentStore;
pub use error::{DbError, DbResult};
pub use publish::PublishStore;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Open a WAL-mode pool on a database file, creating it if missing.
///
/// A single connection per pool: SQLite permits limited write concurrency
/// and one writer avoids persistent "database is locked" failures under
/// request concurrency.
pub(crate) async fn open_pool(path: &Path) -> DbResult<Pool<Sqlite>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .foreign_keys(true)
        // Prevent transient "database is locked" errors under concurrent access.
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(opts)
        .await?;

    Ok(pool)
}

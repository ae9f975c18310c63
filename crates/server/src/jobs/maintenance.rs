//! Maintenance jobs: build pruning and stale-publish cleanup.

use super::JobContext;
use depot_db::PublishStore;
use time::{Duration, OffsetDateTime};

/// Delete builds older than each fork's configured prune age, disk
/// directory and rows both. Forks with `prune_builds_days = 0` are left
/// alone.
pub async fn prune_builds(ctx: &JobContext) -> anyhow::Result<()> {
    let now = OffsetDateTime::now_utc();

    for (fork, fork_config) in &ctx.config.forks {
        if fork_config.prune_builds_days == 0 {
            continue;
        }
        let cutoff = now - Duration::days(fork_config.prune_builds_days as i64);

        let Some(fork_row) = ctx.publish.fork(fork).await? else {
            continue;
        };
        let candidates = ctx.publish.versions_published_before(fork_row.id, cutoff).await?;

        for version in candidates {
            let version_dir = ctx.publish_layout.version_dir(fork, &version.name)?;
            match tokio::fs::remove_dir_all(&version_dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::error!(
                        fork,
                        version = %version.name,
                        error = %e,
                        "Failed to delete pruned build directory, keeping row"
                    );
                    continue;
                }
            }
            ctx.publish.delete_version(version.id).await?;
            tracing::info!(fork, version = %version.name, "Pruned aged build");
        }
    }

    Ok(())
}

/// Abort multi-request publishes whose `/finish` never came: remove the
/// version directory and the in-progress row.
pub async fn abort_stale_publishes(ctx: &JobContext) -> anyhow::Result<()> {
    let cutoff = OffsetDateTime::now_utc() - ctx.config.publish_timeout();
    let stale = ctx.publish.stale_in_progress(cutoff).await?;

    for publish in stale {
        tracing::warn!(
            fork = %publish.fork_name,
            version = %publish.name,
            started = %publish.start_time,
            "Aborting stale in-progress publish"
        );

        let version_dir = ctx.publish_layout.version_dir(&publish.fork_name, &publish.name)?;
        match tokio::fs::remove_dir_all(&version_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut tx = ctx.publish.begin().await?;
        PublishStore::delete_in_progress(&mut tx, publish.id).await?;
        tx.commit().await?;
    }

    Ok(())
}

//! Availability flip, manifest-cache rebuild, and watchdog notifies.
//!
//! Versions become publicly visible in three ordered steps after
//! ingestion: flip `Available` on every version whose content landed in
//! the content store, rebuild the fork's cached server-manifest JSON from
//! the now-available set, then tell downstream watchdogs to update.
//! Keeping the flip separate from ingestion means the manifest never
//! exposes a half-ingested version.

use super::JobContext;
use anyhow::Context;
use depot_core::hash::hex_upper;
use serde_json::{Map, Value, json};
use time::format_description::well_known::Rfc3339;

/// Flip `Available` on every ingested version of the fork that is not
/// yet available. Returns the number of versions that changed.
pub async fn flip_available(ctx: &JobContext, fork: &str) -> anyhow::Result<u64> {
    let Some(content_fork) = ctx.content.fork_id(fork).await? else {
        return Ok(0);
    };
    let ingested = ctx.content.version_names(content_fork).await?;
    if ingested.is_empty() {
        return Ok(0);
    }

    let publish_fork = ctx.publish.upsert_fork(fork).await?;
    let flipped = ctx.publish.mark_available(publish_fork, &ingested).await?;
    if flipped > 0 {
        tracing::info!(fork, flipped, "Marked versions available");
    }
    Ok(flipped)
}

/// Rebuild the fork's cached server-manifest JSON from all available
/// versions and their server builds.
pub async fn rebuild_manifest_cache(ctx: &JobContext, fork: &str) -> anyhow::Result<()> {
    let base_url = &ctx.config.base_url;
    if !base_url.ends_with('/') {
        anyhow::bail!("base_url must end with '/': {base_url:?}");
    }

    let fork_row = ctx
        .publish
        .fork(fork)
        .await?
        .with_context(|| format!("fork {fork} missing from publish store"))?;

    // LIMIT -1 is SQLite for "no limit": the cache carries every
    // available version, unlike the 50-entry HTML listing.
    let versions = ctx.publish.available_versions(fork_row.id, -1).await?;

    let mut builds = Map::new();
    for version in &versions {
        let file_url = |file: &str| {
            format!(
                "{base_url}fork/{fork}/version/{version}/file/{file}",
                version = version.name
            )
        };

        let mut entry = Map::new();
        entry.insert(
            "time".to_string(),
            Value::String(version.published_time.format(&Rfc3339)?),
        );
        entry.insert(
            "client".to_string(),
            json!({
                "url": file_url(&version.client_file_name),
                "sha256": hex_upper(&version.client_sha256),
            }),
        );

        let mut servers = Map::new();
        for build in ctx.publish.server_builds(version.id).await? {
            let mut server = Map::new();
            server.insert("url".to_string(), Value::String(file_url(&build.file_name)));
            server.insert("sha256".to_string(), Value::String(hex_upper(&build.sha256)));
            if let Some(size) = build.file_size {
                server.insert("size".to_string(), Value::Number(size.into()));
            }
            servers.insert(build.platform, Value::Object(server));
        }
        entry.insert("server".to_string(), Value::Object(servers));

        builds.insert(version.name.clone(), Value::Object(entry));
    }

    let document = json!({ "builds": builds });
    ctx.publish
        .set_manifest_cache(fork_row.id, &serde_json::to_vec(&document)?)
        .await?;
    tracing::info!(fork, versions = versions.len(), "Rebuilt server manifest cache");
    Ok(())
}

/// POST an update notification to each configured watchdog. Failures are
/// logged and never retried; each notify is independent.
pub async fn notify_watchdogs(ctx: &JobContext, fork: &str) {
    let Some(fork_config) = ctx.config.forks.get(fork) else {
        return;
    };

    for watchdog in &fork_config.notify_watchdogs {
        let url = format!(
            "{}/instances/{}/update",
            watchdog.url.trim_end_matches('/'),
            watchdog.instance
        );
        let result = ctx
            .http
            .post(&url)
            .basic_auth(&watchdog.instance, Some(&watchdog.api_token))
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(fork, url, "Watchdog notified");
            }
            Ok(response) => {
                tracing::warn!(fork, url, status = %response.status(), "Watchdog notify rejected");
            }
            Err(error) => {
                tracing::warn!(fork, url, %error, "Watchdog notify failed");
            }
        }
    }
}

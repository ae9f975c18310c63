//! Content ingestion.
//!
//! Scans a fork's build directory for version directories not yet in the
//! content store and ingests each client zip: every entry is hashed,
//! deduplicated against the blob table, compressed when worthwhile, and
//! recorded as a manifest entry. The canonical manifest text is built
//! alongside and stored zstd-compressed with its hash.
//!
//! Runs are serialized per fork by the job runner. All writes happen in
//! explicit transactions with an interim commit every few versions to
//! bound WAL growth; a failure rolls back the open transaction and the
//! affected versions are retried on the next scan.

use super::JobContext;
use anyhow::Context;
use depot_core::codec::{self, BlobCompression};
use depot_core::config::ContentConfig;
use depot_core::{ContentDigest, ManifestBuilder};
use depot_db::ContentStore;
use sqlx::{Sqlite, Transaction};
use std::borrow::Cow;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::SystemTime;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use zip::ZipArchive;

/// Versions committed per transaction before an interim commit.
const VERSIONS_PER_COMMIT: usize = 5;

/// Ingest every new version of a fork. Returns the names committed to the
/// content store by this run, oldest-committed first.
pub async fn run(ctx: &JobContext, fork: &str) -> anyhow::Result<Vec<String>> {
    let fork_config = ctx
        .config
        .forks
        .get(fork)
        .with_context(|| format!("unknown fork {fork}"))?;
    let client_zip = format!("{}.zip", fork_config.client_zip_name);

    let fork_id = ctx.content.upsert_fork(fork).await?;
    let fork_dir = ctx.ingest_layout.fork_dir(fork)?;

    let candidates = discover_versions(ctx, fork_id, &fork_dir, &client_zip).await?;
    if candidates.is_empty() {
        return Ok(Vec::new());
    }
    tracing::info!(fork, count = candidates.len(), "Discovered new versions to ingest");

    let mut committed = Vec::new();
    let mut pending: Vec<String> = Vec::new();
    let mut tx = ctx.content.begin().await?;

    for name in candidates {
        let zip_path = fork_dir.join(&name).join(&client_zip);
        match ingest_version(&mut tx, &ctx.config.content, fork_id, &name, &zip_path).await {
            Ok(entries) => {
                tracing::info!(fork, version = %name, entries, "Ingested version");
                pending.push(name);
            }
            Err(error) => {
                // Roll back the open transaction; everything in it gets
                // re-discovered and retried on the next scan.
                drop(tx);
                tracing::error!(fork, version = %name, %error, "Failed to ingest version");
                return Ok(committed);
            }
        }

        if pending.len() >= VERSIONS_PER_COMMIT {
            tx.commit().await?;
            committed.append(&mut pending);
            tx = ctx.content.begin().await?;
        }
    }

    tx.commit().await?;
    committed.append(&mut pending);
    Ok(committed)
}

/// List version directories not yet ingested, newest modification first.
async fn discover_versions(
    ctx: &JobContext,
    fork_id: i64,
    fork_dir: &Path,
    client_zip: &str,
) -> anyhow::Result<Vec<String>> {
    let mut read_dir = match tokio::fs::read_dir(fork_dir).await {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).context("reading fork build directory"),
    };

    let mut candidates: Vec<(String, SystemTime)> = Vec::new();
    while let Some(entry) = read_dir.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !depot_core::name::valid_name(&name) {
            continue;
        }
        if ctx.content.version_exists(fork_id, &name).await? {
            continue;
        }
        if tokio::fs::metadata(entry.path().join(client_zip)).await.is_err() {
            tracing::warn!(
                version = %name,
                client_zip,
                "Version directory has no client zip, skipping"
            );
            continue;
        }
        let modified = entry.metadata().await?.modified()?;
        candidates.push((name, modified));
    }

    candidates.sort_by(|a, b| b.1.cmp(&a.1));
    Ok(candidates.into_iter().map(|(name, _)| name).collect())
}

/// Ingest one version inside the open transaction. Returns the entry count.
async fn ingest_version(
    tx: &mut Transaction<'static, Sqlite>,
    config: &ContentConfig,
    fork_id: i64,
    name: &str,
    zip_path: &Path,
) -> anyhow::Result<u32> {
    let version_id =
        ContentStore::insert_version(tx, fork_id, name, OffsetDateTime::now_utc()).await?;

    // A blocking reader walks the zip in manifest order and hands entries
    // over a capacity-1 channel, so at most two entry buffers are alive.
    let (entry_tx, mut entry_rx) = mpsc::channel::<(String, Vec<u8>)>(1);
    let reader = tokio::task::spawn_blocking({
        let zip_path = zip_path.to_path_buf();
        move || read_zip_entries(&zip_path, entry_tx)
    });

    let mut builder = ManifestBuilder::new();
    let mut manifest_idx = 0i64;

    while let Some((entry_path, data)) = entry_rx.recv().await {
        let digest = ContentDigest::compute(&data);

        let content_id = match ContentStore::find_content_id(tx, digest.as_bytes()).await? {
            Some(id) => id,
            None => {
                let (compression, payload) = encode_blob(config, &data)?;
                ContentStore::insert_content(
                    tx,
                    digest.as_bytes(),
                    data.len() as i64,
                    compression.tag(),
                    &payload,
                )
                .await?
            }
        };

        ContentStore::insert_manifest_entry(tx, version_id, manifest_idx, content_id).await?;
        builder.push_entry(&digest, &entry_path);
        manifest_idx += 1;
    }

    reader.await.context("zip reader panicked")??;

    let entries = builder.entries();
    let (text, manifest_digest) = builder.finish();
    let manifest_data = codec::zstd_compress(text.as_bytes(), config.manifest_compress_level)?;
    ContentStore::finalize_version(tx, version_id, manifest_digest.as_bytes(), &manifest_data)
        .await?;

    Ok(entries)
}

/// Pick storage encoding for a blob: zstd when enabled and it actually
/// saves more than the configured threshold, verbatim otherwise.
fn encode_blob<'a>(
    config: &ContentConfig,
    data: &'a [u8],
) -> std::io::Result<(BlobCompression, Cow<'a, [u8]>)> {
    if config.blob_compress && !data.is_empty() {
        let compressed = codec::zstd_compress(data, config.blob_compress_level)?;
        if codec::compression_worthwhile(
            compressed.len(),
            data.len(),
            config.blob_compress_savings_threshold,
        ) {
            return Ok((BlobCompression::ZStd, Cow::Owned(compressed)));
        }
    }
    Ok((BlobCompression::None, Cow::Borrowed(data)))
}

/// Blocking zip walk: entries sorted ordinally by full path, directory
/// entries excluded, each entry fully buffered then sent.
fn read_zip_entries(
    zip_path: &Path,
    entry_tx: mpsc::Sender<(String, Vec<u8>)>,
) -> anyhow::Result<()> {
    let file = std::fs::File::open(zip_path)
        .with_context(|| format!("opening {}", zip_path.display()))?;
    let mut archive = ZipArchive::new(BufReader::new(file))?;

    let mut names: Vec<(String, usize)> = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let entry = archive.by_index_raw(index)?;
        if entry.is_dir() {
            continue;
        }
        names.push((entry.name().to_string(), index));
    }
    names.sort();

    for (name, index) in names {
        let mut entry = archive.by_index(index)?;
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        if entry_tx.blocking_send((name, data)).is_err() {
            // Receiver bailed (DB error); nothing left to do here.
            break;
        }
    }

    Ok(())
}

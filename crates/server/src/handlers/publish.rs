//! Publish endpoints: one-shot and multi-request.
//!
//! Both shapes converge on the same finalization: artifacts sit in the
//! version directory, the client zip is hashed (SHA-256 whole-file,
//! BLAKE2b manifest), a generated `build.json` is injected into every
//! server zip, version rows are committed atomically, and the fork's
//! ingest worker is triggered. If finalization fails the version
//! directory is deleted so the publish can be retried cleanly.

use crate::auth;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use depot_core::config::ForkConfig;
use depot_core::name::valid_name;
use depot_core::{ContentDigest, ManifestBuilder};
use depot_db::PublishStore;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{BufReader, Write};
use std::path::{Path as StdPath, PathBuf};
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use zip::ZipArchive;
use zip::write::SimpleFileOptions;

const PUBLISH_FILE_HEADER: &str = "Robust-Cdn-Publish-File";
const PUBLISH_VERSION_HEADER: &str = "Robust-Cdn-Publish-Version";

/// One-shot publish request body.
#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    /// URL of the archive containing client and server zips.
    pub archive: String,
    pub version: String,
    #[serde(rename = "engineVersion")]
    pub engine_version: String,
}

/// Multi-publish start request body.
#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub version: String,
    #[serde(rename = "engineVersion")]
    pub engine_version: String,
}

/// Multi-publish finish request body.
#[derive(Debug, Deserialize)]
pub struct FinishRequest {
    pub version: String,
}

/// What a published file turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ArtifactKind {
    Client,
    Server { platform: String },
}

/// Classify an artifact file name against the fork's naming scheme.
fn classify_artifact(config: &ForkConfig, file_name: &str) -> Option<ArtifactKind> {
    if file_name == format!("{}.zip", config.client_zip_name) {
        return Some(ArtifactKind::Client);
    }
    let platform = file_name
        .strip_prefix(&config.server_zip_name)?
        .strip_suffix(".zip")?;
    if platform.is_empty() {
        return None;
    }
    Some(ArtifactKind::Server {
        platform: platform.to_string(),
    })
}

// =============================================================================
// One-shot publish
// =============================================================================

/// POST /fork/{fork}/publish
pub async fn post_publish(
    State(state): State<AppState>,
    Path(fork): Path<String>,
    headers: HeaderMap,
    Json(request): Json<PublishRequest>,
) -> ApiResult<StatusCode> {
    let fork_config = state.fork_config(&fork)?.clone();
    auth::check_update_token(&fork, &fork_config, &headers)?;

    if !valid_name(&request.version) {
        return Err(ApiError::BadRequest(format!(
            "invalid version name: {:?}",
            request.version
        )));
    }

    let fork_id = state.publish.upsert_fork(&fork).await?;
    if state.publish.version_exists(fork_id, &request.version).await? {
        return Err(ApiError::Conflict(format!(
            "version {} already published",
            request.version
        )));
    }

    // Pull the archive into a delete-on-close temp file.
    let archive_file = fetch_archive(&state, &request.archive).await?;

    let version_dir = state.publish_layout.version_dir(&fork, &request.version)?;
    tokio::fs::create_dir_all(&version_dir).await?;

    let result = publish_from_archive(
        &state,
        &fork,
        &fork_config,
        fork_id,
        &request,
        archive_file,
        &version_dir,
    )
    .await;

    if result.is_err() {
        remove_dir_best_effort(&version_dir).await;
    }
    result?;

    state.jobs.trigger_ingest(&fork);
    Ok(StatusCode::OK)
}

async fn publish_from_archive(
    state: &AppState,
    fork: &str,
    fork_config: &ForkConfig,
    fork_id: i64,
    request: &PublishRequest,
    archive_file: std::fs::File,
    version_dir: &StdPath,
) -> ApiResult<()> {
    let artifacts = {
        let fork_config = fork_config.clone();
        let version_dir = version_dir.to_path_buf();
        tokio::task::spawn_blocking(move || {
            extract_archive(archive_file, &fork_config, &version_dir)
        })
        .await
        .map_err(|e| ApiError::Internal(format!("archive extraction panicked: {e}")))??
    };

    if !artifacts.iter().any(|(_, kind)| *kind == ArtifactKind::Client) {
        return Err(ApiError::BadRequest(
            "archive contains no client artifact".to_string(),
        ));
    }

    finalize_publish(
        state,
        fork,
        fork_config,
        fork_id,
        &request.version,
        &request.engine_version,
        artifacts,
        None,
    )
    .await
}

/// Stream a remote archive into an unnamed (delete-on-close) temp file.
async fn fetch_archive(state: &AppState, url: &str) -> ApiResult<std::fs::File> {
    let response = state
        .http
        .get(url)
        .send()
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to fetch archive: {e}")))?;
    if !response.status().is_success() {
        return Err(ApiError::BadRequest(format!(
            "archive fetch returned {}",
            response.status()
        )));
    }

    let mut file = tokio::fs::File::from_std(tempfile::tempfile()?);
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ApiError::BadRequest(format!("archive read failed: {e}")))?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(file.into_std().await)
}

/// Extract recognized artifacts from the outer archive into the version
/// directory. Unrecognized entries are ignored.
fn extract_archive(
    archive_file: std::fs::File,
    config: &ForkConfig,
    version_dir: &StdPath,
) -> ApiResult<Vec<(String, ArtifactKind)>> {
    let mut archive = ZipArchive::new(BufReader::new(archive_file))
        .map_err(|e| ApiError::BadRequest(format!("invalid archive: {e}")))?;

    let mut artifacts = Vec::new();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| ApiError::BadRequest(format!("invalid archive entry: {e}")))?;
        let name = entry.name().to_string();
        if !valid_name(&name) {
            continue;
        }
        let Some(kind) = classify_artifact(config, &name) else {
            continue;
        };

        let mut out = std::fs::File::create(version_dir.join(&name))?;
        std::io::copy(&mut entry, &mut out)?;
        artifacts.push((name, kind));
    }

    Ok(artifacts)
}

// =============================================================================
// Multi-request publish
// =============================================================================

/// POST /fork/{fork}/start
pub async fn post_start(
    State(state): State<AppState>,
    Path(fork): Path<String>,
    headers: HeaderMap,
    Json(request): Json<StartRequest>,
) -> ApiResult<StatusCode> {
    let fork_config = state.fork_config(&fork)?;
    auth::check_update_token(&fork, fork_config, &headers)?;

    if !valid_name(&request.version) {
        return Err(ApiError::BadRequest(format!(
            "invalid version name: {:?}",
            request.version
        )));
    }

    let fork_id = state.publish.upsert_fork(&fork).await?;
    if state.publish.version_exists(fork_id, &request.version).await? {
        return Err(ApiError::Conflict(format!(
            "version {} already published",
            request.version
        )));
    }

    let version_dir = state.publish_layout.version_dir(&fork, &request.version)?;

    // A previous start for the same version is aborted and restarted:
    // files gone, row replaced, all in one transaction.
    let existing = state.publish.in_progress(fork_id, &request.version).await?;
    let mut tx = state.publish.begin().await?;
    if let Some(existing) = existing {
        PublishStore::delete_in_progress(&mut tx, existing.id).await?;
        remove_dir_best_effort(&version_dir).await;
    }
    PublishStore::insert_in_progress(
        &mut tx,
        fork_id,
        &request.version,
        OffsetDateTime::now_utc(),
        &request.engine_version,
    )
    .await?;
    tx.commit().await?;

    tokio::fs::create_dir_all(&version_dir).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /fork/{fork}/file — upload one artifact of an in-progress publish.
pub async fn post_file(
    State(state): State<AppState>,
    Path(fork): Path<String>,
    request: Request,
) -> ApiResult<StatusCode> {
    let fork_config = state.fork_config(&fork)?;
    auth::check_update_token(&fork, fork_config, request.headers())?;

    let (file_name, version) = {
        let header = |name: &str| -> ApiResult<String> {
            request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
                .ok_or_else(|| ApiError::BadRequest(format!("missing {name} header")))
        };
        (header(PUBLISH_FILE_HEADER)?, header(PUBLISH_VERSION_HEADER)?)
    };

    if !valid_name(&file_name) {
        return Err(ApiError::BadRequest(format!(
            "invalid file name: {file_name:?}"
        )));
    }

    let fork_id = state.publish.upsert_fork(&fork).await?;
    if state.publish.in_progress(fork_id, &version).await?.is_none() {
        return Err(ApiError::NotFound(format!(
            "no publish in progress for version {version}"
        )));
    }

    let path = state.publish_layout.artifact_path(&fork, &version, &file_name)?;
    let mut file = match tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .await
    {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            return Err(ApiError::Conflict(format!(
                "file {file_name} already uploaded"
            )));
        }
        Err(e) => return Err(e.into()),
    };

    let mut body = request.into_body().into_data_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| ApiError::BadRequest(format!("body read failed: {e}")))?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    Ok(StatusCode::NO_CONTENT)
}

/// POST /fork/{fork}/finish
pub async fn post_finish(
    State(state): State<AppState>,
    Path(fork): Path<String>,
    headers: HeaderMap,
    Json(request): Json<FinishRequest>,
) -> ApiResult<StatusCode> {
    let fork_config = state.fork_config(&fork)?.clone();
    auth::check_update_token(&fork, &fork_config, &headers)?;

    let fork_id = state.publish.upsert_fork(&fork).await?;
    let Some(in_progress) = state.publish.in_progress(fork_id, &request.version).await? else {
        return Err(ApiError::NotFound(format!(
            "no publish in progress for version {}",
            request.version
        )));
    };

    let version_dir = state.publish_layout.version_dir(&fork, &request.version)?;
    let artifacts = classify_directory(&fork_config, &version_dir).await?;

    if !artifacts.iter().any(|(_, kind)| *kind == ArtifactKind::Client) {
        // No client artifact: the publish is aborted outright.
        remove_dir_best_effort(&version_dir).await;
        let mut tx = state.publish.begin().await?;
        PublishStore::delete_in_progress(&mut tx, in_progress.id).await?;
        tx.commit().await?;
        return Err(ApiError::UnprocessableEntity(
            "publish has no client artifact".to_string(),
        ));
    }

    let result = finalize_publish(
        &state,
        &fork,
        &fork_config,
        fork_id,
        &request.version,
        &in_progress.engine_version,
        artifacts,
        Some(in_progress.id),
    )
    .await;

    if result.is_err() {
        remove_dir_best_effort(&version_dir).await;
    }
    result?;

    state.jobs.trigger_ingest(&fork);
    Ok(StatusCode::OK)
}

/// Classify the files sitting in a version directory.
async fn classify_directory(
    config: &ForkConfig,
    version_dir: &StdPath,
) -> ApiResult<Vec<(String, ArtifactKind)>> {
    let mut artifacts = Vec::new();
    let mut read_dir = tokio::fs::read_dir(version_dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if let Some(kind) = classify_artifact(config, &name) {
            artifacts.push((name, kind));
        }
    }
    Ok(artifacts)
}

// =============================================================================
// Common finalization
// =============================================================================

/// The generated build metadata injected into server zips. URL fields
/// carry literal `{FORK_ID}`/`{FORK_VERSION}` placeholders for the game
/// server to substitute.
#[derive(Debug, Serialize)]
struct BuildJson {
    download: String,
    version: String,
    hash: String,
    fork_id: String,
    engine_version: String,
    manifest_url: String,
    manifest_download_url: String,
    manifest_hash: String,
}

struct FinalizedServerBuild {
    platform: String,
    file_name: String,
    sha256: Vec<u8>,
    file_size: i64,
}

struct FinalizedArtifacts {
    client_file_name: String,
    client_sha256: Vec<u8>,
    servers: Vec<FinalizedServerBuild>,
}

#[allow(clippy::too_many_arguments)]
async fn finalize_publish(
    state: &AppState,
    fork: &str,
    fork_config: &ForkConfig,
    fork_id: i64,
    version: &str,
    engine_version: &str,
    artifacts: Vec<(String, ArtifactKind)>,
    in_progress_id: Option<i64>,
) -> ApiResult<()> {
    let version_dir = state.publish_layout.version_dir(fork, version)?;
    let base_url = state.config.base_url.clone();

    let finalized = {
        let fork = fork.to_string();
        let version = version.to_string();
        let engine_version = engine_version.to_string();
        let fork_config = fork_config.clone();
        tokio::task::spawn_blocking(move || {
            finalize_artifacts(
                &version_dir,
                &fork,
                &fork_config,
                &version,
                &engine_version,
                &base_url,
                artifacts,
            )
        })
        .await
        .map_err(|e| ApiError::Internal(format!("publish finalization panicked: {e}")))??
    };

    let mut tx = state.publish.begin().await?;
    let version_id = PublishStore::insert_version(
        &mut tx,
        fork_id,
        version,
        OffsetDateTime::now_utc(),
        engine_version,
        &finalized.client_file_name,
        &finalized.client_sha256,
    )
    .await
    .map_err(|e| match e {
        depot_db::DbError::AlreadyExists(message) => ApiError::Conflict(message),
        other => other.into(),
    })?;

    for server in &finalized.servers {
        PublishStore::insert_server_build(
            &mut tx,
            version_id,
            &server.platform,
            &server.file_name,
            &server.sha256,
            Some(server.file_size),
        )
        .await?;
    }

    if let Some(in_progress_id) = in_progress_id {
        PublishStore::delete_in_progress(&mut tx, in_progress_id).await?;
    }
    tx.commit().await?;

    tracing::info!(
        fork,
        version,
        servers = finalized.servers.len(),
        "Published version"
    );
    Ok(())
}

/// Blocking half of finalization: hash the client zip, derive the
/// manifest hash, generate build.json, inject it into every server zip,
/// then hash the rewritten server zips.
fn finalize_artifacts(
    version_dir: &StdPath,
    fork: &str,
    fork_config: &ForkConfig,
    version: &str,
    engine_version: &str,
    base_url: &str,
    artifacts: Vec<(String, ArtifactKind)>,
) -> ApiResult<FinalizedArtifacts> {
    let client_file_name = format!("{}.zip", fork_config.client_zip_name);
    let client_path = version_dir.join(&client_file_name);

    let client_sha256 = file_sha256(&client_path)?;
    let manifest_hash = client_manifest_digest(&client_path)?;

    let build_json = BuildJson {
        download: format!(
            "{base_url}fork/{{FORK_ID}}/version/{{FORK_VERSION}}/file/{client_file_name}"
        ),
        version: version.to_string(),
        hash: depot_core::hash::hex_upper(&client_sha256),
        fork_id: fork.to_string(),
        engine_version: engine_version.to_string(),
        manifest_url: format!("{base_url}fork/{{FORK_ID}}/version/{{FORK_VERSION}}/manifest"),
        manifest_download_url: format!(
            "{base_url}fork/{{FORK_ID}}/version/{{FORK_VERSION}}/download"
        ),
        manifest_hash: manifest_hash.to_hex_upper(),
    };
    let build_json_bytes = serde_json::to_vec_pretty(&build_json)
        .map_err(|e| ApiError::Internal(format!("encoding build.json: {e}")))?;

    let mut servers = Vec::new();
    for (file_name, kind) in artifacts {
        let ArtifactKind::Server { platform } = kind else {
            continue;
        };
        let path = version_dir.join(&file_name);
        inject_build_json(&path, &build_json_bytes)?;

        let sha256 = file_sha256(&path)?;
        let file_size = std::fs::metadata(&path)?.len() as i64;
        servers.push(FinalizedServerBuild {
            platform,
            file_name,
            sha256,
            file_size,
        });
    }

    Ok(FinalizedArtifacts {
        client_file_name,
        client_sha256,
        servers,
    })
}

/// SHA-256 of a file, streamed.
fn file_sha256(path: &StdPath) -> ApiResult<Vec<u8>> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_vec())
}

/// Derive the canonical manifest hash of a client zip: entries sorted
/// ordinally by full path, directories excluded, each entry's contents
/// hashed with BLAKE2b into the manifest text, the text hashed again.
fn client_manifest_digest(path: &StdPath) -> ApiResult<ContentDigest> {
    let file = std::fs::File::open(path)?;
    let mut archive = ZipArchive::new(BufReader::new(file))
        .map_err(|e| ApiError::BadRequest(format!("invalid client zip: {e}")))?;

    let mut names: Vec<(String, usize)> = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let entry = archive
            .by_index_raw(index)
            .map_err(|e| ApiError::BadRequest(format!("invalid client zip entry: {e}")))?;
        if entry.is_dir() {
            continue;
        }
        names.push((entry.name().to_string(), index));
    }
    names.sort();

    let mut builder = ManifestBuilder::new();
    for (name, index) in names {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| ApiError::BadRequest(format!("invalid client zip entry: {e}")))?;
        // Entry sizes are unbounded here, so hash incrementally instead of
        // buffering.
        let mut hasher = ContentDigest::hasher();
        std::io::copy(&mut entry, &mut hasher)?;
        builder.push_entry(&hasher.finalize(), &name);
    }

    let (_, digest) = builder.finish();
    Ok(digest)
}

/// Replace `build.json` inside a zip. The zip crate cannot update in
/// place, so the archive is rewritten next to the original (raw-copying
/// every other entry) and atomically renamed over it.
fn inject_build_json(path: &StdPath, build_json: &[u8]) -> ApiResult<()> {
    let source = std::fs::File::open(path)?;
    let mut archive = ZipArchive::new(BufReader::new(source))
        .map_err(|e| ApiError::BadRequest(format!("invalid server zip: {e}")))?;

    let temp_path = temp_sibling(path);
    let result = (|| -> ApiResult<()> {
        let mut writer =
            zip::ZipWriter::new(std::io::BufWriter::new(std::fs::File::create(&temp_path)?));

        for index in 0..archive.len() {
            let entry = archive
                .by_index_raw(index)
                .map_err(|e| ApiError::BadRequest(format!("invalid server zip entry: {e}")))?;
            if entry.name() == "build.json" {
                continue;
            }
            writer
                .raw_copy_file(entry)
                .map_err(|e| ApiError::Internal(format!("rewriting server zip: {e}")))?;
        }

        writer
            .start_file("build.json", SimpleFileOptions::default())
            .map_err(|e| ApiError::Internal(format!("writing build.json: {e}")))?;
        writer.write_all(build_json)?;
        writer
            .finish()
            .map_err(|e| ApiError::Internal(format!("finishing server zip: {e}")))?;
        Ok(())
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
        return result;
    }

    std::fs::rename(&temp_path, path)?;
    Ok(())
}

fn temp_sibling(path: &StdPath) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

async fn remove_dir_best_effort(dir: &StdPath) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::error!(dir = %dir.display(), error = %e, "Failed to clean up version directory"),
    }
}

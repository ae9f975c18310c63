//! Fork-scoped read endpoints: HTML index, server manifest, file serving.

use crate::auth;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use time::format_description::well_known::Rfc3339;
use tokio_util::io::ReaderStream;

/// Versions shown on the HTML index page.
const INDEX_VERSION_LIMIT: i64 = 50;

/// GET /fork/{fork} — HTML listing of recent available versions.
pub async fn get_fork_index(
    State(state): State<AppState>,
    Path(fork): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Html<String>> {
    let fork_config = state.fork_config(&fork)?;
    auth::check_read_access(&fork, fork_config, &headers)?;

    let Some(fork_row) = state.publish.fork(&fork).await? else {
        return Ok(Html(render_index(&fork, &[])));
    };
    let versions = state
        .publish
        .available_versions(fork_row.id, INDEX_VERSION_LIMIT)
        .await?;

    let mut entries = Vec::with_capacity(versions.len());
    for version in versions {
        let builds = state.publish.server_builds(version.id).await?;
        entries.push((version, builds));
    }

    Ok(Html(render_index(&fork, &entries)))
}

fn render_index(
    fork: &str,
    entries: &[(depot_db::models::ForkVersionRow, Vec<depot_db::models::ServerBuildRow>)],
) -> String {
    let mut html = String::with_capacity(4096);
    html.push_str("<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\">");
    html.push_str(&format!("<title>Builds of {fork}</title></head>\n<body>\n"));
    html.push_str(&format!("<h1>Builds of {fork}</h1>\n"));

    if entries.is_empty() {
        html.push_str("<p>No builds published yet.</p>\n");
    } else {
        html.push_str("<table>\n<tr><th>Version</th><th>Published</th><th>Client</th><th>Servers</th></tr>\n");
        for (version, builds) in entries {
            let time = version
                .published_time
                .format(&Rfc3339)
                .unwrap_or_default();
            let client_link = format!(
                "<a href=\"version/{v}/file/{f}\">{f}</a>",
                v = version.name,
                f = version.client_file_name
            );
            let server_links: Vec<String> = builds
                .iter()
                .map(|b| {
                    format!(
                        "<a href=\"version/{v}/file/{f}\">{p}</a>",
                        v = version.name,
                        f = b.file_name,
                        p = b.platform
                    )
                })
                .collect();
            html.push_str(&format!(
                "<tr><td>{name}</td><td>{time}</td><td>{client_link}</td><td>{servers}</td></tr>\n",
                name = version.name,
                servers = server_links.join(" ")
            ));
        }
        html.push_str("</table>\n");
    }

    html.push_str("</body>\n</html>\n");
    html
}

/// GET /fork/{fork}/manifest — the cached server-manifest JSON, streamed
/// straight from the publish store.
pub async fn get_fork_manifest(
    State(state): State<AppState>,
    Path(fork): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let fork_config = state.fork_config(&fork)?;
    auth::check_read_access(&fork, fork_config, &headers)?;

    let fork_row = state
        .publish
        .fork(&fork)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("unknown fork: {fork}")))?;
    let cache = state
        .publish
        .manifest_cache(fork_row.id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no server manifest for fork {fork}")))?;

    Ok((
        StatusCode::OK,
        [(CONTENT_TYPE, "application/json")],
        Body::from(cache),
    )
        .into_response())
}

/// GET /fork/{fork}/version/{version}/file/{file} — stream an on-disk
/// build artifact.
pub async fn get_version_file(
    State(state): State<AppState>,
    Path((fork, version, file)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let fork_config = state.fork_config(&fork)?;
    auth::check_read_access(&fork, fork_config, &headers)?;

    let fork_row = state
        .publish
        .fork(&fork)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("unknown fork: {fork}")))?;
    if state.publish.version(fork_row.id, &version).await?.is_none() {
        return Err(ApiError::NotFound(format!("unknown version: {version}")));
    }

    // The resolver rejects any component with path separators or dot
    // segments before this touches the filesystem.
    let path = state
        .publish_layout
        .artifact_path(&fork, &version, &file)
        .map_err(|_| ApiError::BadRequest(format!("invalid file name: {file:?}")))?;

    let file_handle = match tokio::fs::File::open(&path).await {
        Ok(handle) => handle,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::NotFound(format!("no such file: {file}")));
        }
        Err(e) => return Err(e.into()),
    };
    let length = file_handle.metadata().await?.len();

    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE, "application/zip".to_string()),
            (CONTENT_LENGTH, length.to_string()),
        ],
        Body::from_stream(ReaderStream::new(file_handle)),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_db::models::{ForkVersionRow, ServerBuildRow};
    use time::OffsetDateTime;

    #[test]
    fn index_lists_versions_and_builds() {
        let version = ForkVersionRow {
            id: 1,
            fork_id: 1,
            name: "1.2.3".to_string(),
            published_time: OffsetDateTime::UNIX_EPOCH,
            engine_version: "220.0.0".to_string(),
            client_file_name: "Client.zip".to_string(),
            client_sha256: vec![0u8; 32],
            available: true,
        };
        let build = ServerBuildRow {
            id: 1,
            fork_version_id: 1,
            platform: "linux-x64".to_string(),
            file_name: "Server_linux-x64.zip".to_string(),
            sha256: vec![0u8; 32],
            file_size: Some(1),
        };

        let html = render_index("wizards", &[(version, vec![build])]);
        assert!(html.contains("Builds of wizards"));
        assert!(html.contains("version/1.2.3/file/Client.zip"));
        assert!(html.contains("version/1.2.3/file/Server_linux-x64.zip"));
        assert!(html.contains(">linux-x64</a>"));
    }

    #[test]
    fn empty_index_renders() {
        let html = render_index("wizards", &[]);
        assert!(html.contains("No builds published yet"));
    }
}

//! Control endpoints: status and manual update triggers.

use crate::auth;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use serde::Serialize;

/// Status response.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(rename = "contentVersions")]
    pub content_versions: i64,
}

/// GET /control/status
pub async fn get_status(State(state): State<AppState>) -> ApiResult<Json<StatusResponse>> {
    let content_versions = state.content.content_version_count().await?;
    Ok(Json(StatusResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        content_versions,
    }))
}

/// POST /fork/{fork}/control/update — trigger ingestion for a fork.
pub async fn post_fork_update(
    State(state): State<AppState>,
    Path(fork): Path<String>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let fork_config = state.fork_config(&fork)?;
    auth::check_update_token(&fork, fork_config, &headers)?;

    if !state.jobs.trigger_ingest(&fork) {
        return Err(ApiError::Internal(format!("no worker for fork {fork}")));
    }
    Ok(StatusCode::ACCEPTED)
}

//! Route configuration.

use crate::auth::trace_middleware;
use crate::handlers::{control, download, forks, publish};
use crate::state::AppState;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, options, post};
use depot_core::MAX_DOWNLOAD_REQUEST_SIZE;
use tower_http::trace::TraceLayer;

/// Body cap for multi-publish file uploads: 2 GiB.
const PUBLISH_FILE_BODY_LIMIT: usize = 2 * 1024 * 1024 * 1024;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let download_routes = Router::new()
        .route(
            "/fork/{fork}/version/{version}/manifest",
            get(download::get_manifest),
        )
        .route(
            "/fork/{fork}/version/{version}/download",
            options(download::options_download).post(download::post_download),
        )
        // Legacy unscoped routes forward to the configured default fork.
        .route(
            "/version/{version}/manifest",
            get(download::get_manifest_default_fork),
        )
        .route(
            "/version/{version}/download",
            options(download::options_download).post(download::post_download_default_fork),
        )
        .layer(DefaultBodyLimit::max(MAX_DOWNLOAD_REQUEST_SIZE));

    let publish_routes = Router::new()
        .route("/fork/{fork}/publish", post(publish::post_publish))
        .route("/fork/{fork}/start", post(publish::post_start))
        .route(
            "/fork/{fork}/file",
            post(publish::post_file).layer(DefaultBodyLimit::max(PUBLISH_FILE_BODY_LIMIT)),
        )
        .route("/fork/{fork}/finish", post(publish::post_finish));

    let read_routes = Router::new()
        .route("/control/status", get(control::get_status))
        .route("/fork/{fork}", get(forks::get_fork_index))
        .route("/fork/{fork}/manifest", get(forks::get_fork_manifest))
        .route(
            "/fork/{fork}/version/{version}/file/{file}",
            get(forks::get_version_file),
        )
        .route("/fork/{fork}/control/update", post(control::post_fork_update));

    let router = Router::new()
        .merge(download_routes)
        .merge(publish_routes)
        .merge(read_routes)
        .layer(middleware::from_fn(trace_middleware))
        .layer(TraceLayer::new_for_http());

    let router = match state.config.path_base.as_deref() {
        Some(base) if !base.is_empty() && base != "/" => Router::new().nest(base, router),
        _ => router,
    };

    router.with_state(state)
}

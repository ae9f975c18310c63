//! Server test utilities.

pub mod fixtures;

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use bytes::Bytes;
use depot_core::config::AppConfig;
use depot_db::{ContentStore, PublishStore};
use depot_server::jobs::{self, JobContext};
use depot_server::{AppState, create_router};
use tempfile::TempDir;
use tower::ServiceExt;

/// Bearer token configured for the test fork.
pub const UPDATE_TOKEN: &str = "test-update-token";

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a test server with the default single-fork configuration.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server, letting the caller adjust configuration
    /// before anything is opened.
    pub async fn with_config(adjust: impl FnOnce(&mut AppConfig)) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let mut config = AppConfig::for_testing(temp_dir.path());
        adjust(&mut config);

        let content = ContentStore::open(&config.content.database_file_name)
            .await
            .expect("Failed to open content store");
        let publish = PublishStore::open(&config.publish.database_file_name)
            .await
            .expect("Failed to open publish store");

        for fork in config.forks.keys() {
            content.upsert_fork(fork).await.expect("Failed to upsert fork");
            publish.upsert_fork(fork).await.expect("Failed to upsert fork");
        }

        let state = AppState::new(config, content, publish);
        let router = create_router(state.clone());

        Self {
            router,
            state,
            _temp_dir: temp_dir,
        }
    }

    /// Run one synchronous update chain for a fork (ingest, availability,
    /// manifest cache). Deterministic alternative to waiting on the
    /// background worker; both serialize on the single-connection pools.
    pub async fn run_update(&self, fork: &str) {
        jobs::run_fork_update(&self.job_context(), fork)
            .await
            .expect("Fork update run failed");
    }

    /// Job context over the server's stores, for driving maintenance jobs
    /// directly in tests.
    pub fn job_context(&self) -> JobContext {
        JobContext {
            config: self.state.config.clone(),
            content: self.state.content.clone(),
            publish: self.state.publish.clone(),
            publish_layout: self.state.publish_layout.clone(),
            ingest_layout: self.state.ingest_layout.clone(),
            http: self.state.http.clone(),
        }
    }

    /// Publish a client zip (and optional server zips) through the
    /// multi-request flow and run the update chain.
    pub async fn publish_build(&self, fork: &str, version: &str, files: &[(&str, &[u8])]) {
        let (status, _, _) = self
            .json(
                "POST",
                &format!("/fork/{fork}/start"),
                serde_json::json!({ "version": version, "engineVersion": "220.1.0" }),
                Some(UPDATE_TOKEN),
            )
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT, "publish start failed");

        for (name, data) in files {
            let request = Request::builder()
                .method("POST")
                .uri(format!("/fork/{fork}/file"))
                .header("Authorization", format!("Bearer {UPDATE_TOKEN}"))
                .header("Robust-Cdn-Publish-File", *name)
                .header("Robust-Cdn-Publish-Version", version)
                .body(Body::from(data.to_vec()))
                .unwrap();
            let (status, _, _) = self.send(request).await;
            assert_eq!(status, StatusCode::NO_CONTENT, "file upload failed: {name}");
        }

        let (status, _, _) = self
            .json(
                "POST",
                &format!("/fork/{fork}/finish"),
                serde_json::json!({ "version": version }),
                Some(UPDATE_TOKEN),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "publish finish failed");

        self.run_update(fork).await;
    }

    /// Send a request, returning status, headers, and collected body.
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, body)
    }

    /// GET a path with optional extra headers.
    pub async fn get(&self, uri: &str, headers: &[(&str, &str)]) -> (StatusCode, HeaderMap, Bytes) {
        let mut builder = Request::builder().method("GET").uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    /// Send a JSON request with an optional bearer token.
    pub async fn json(
        &self,
        method: &str,
        uri: &str,
        body: serde_json::Value,
        token: Option<&str>,
    ) -> (StatusCode, HeaderMap, Bytes) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json");
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        let request = builder
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        self.send(request).await
    }

    /// POST a download request body for a version.
    pub async fn download(
        &self,
        uri: &str,
        indices: &[i32],
        headers: &[(&str, &str)],
    ) -> (StatusCode, HeaderMap, Bytes) {
        let body: Vec<u8> = indices.iter().flat_map(|i| i.to_le_bytes()).collect();
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/octet-stream")
            .header("X-Robust-Download-Protocol", "1");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        self.send(builder.body(Body::from(body)).unwrap()).await
    }
}

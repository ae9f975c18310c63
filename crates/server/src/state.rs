//! Application state shared across handlers.

use crate::error::{ApiError, ApiResult};
use crate::jobs::{JobContext, JobRunner};
use crate::requestlog::{self, RequestLogEntry};
use depot_core::BuildDirectory;
use depot_core::config::{AppConfig, ForkConfig};
use depot_db::{ContentStore, PublishStore};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Content store (blobs, manifests, request logs).
    pub content: ContentStore,
    /// Publish store (forks, versions, in-progress publishes).
    pub publish: PublishStore,
    /// Build tree written by publishes and served to clients.
    pub publish_layout: BuildDirectory,
    /// Build tree scanned by the ingestion job.
    pub ingest_layout: BuildDirectory,
    /// Background job runner (per-fork workers + interval jobs).
    pub jobs: Arc<JobRunner>,
    /// Download request-log queue, when logging is enabled.
    pub request_log: Option<mpsc::Sender<RequestLogEntry>>,
    /// Outbound HTTP client (archive pulls, watchdog notifies).
    pub http: reqwest::Client,
}

impl AppState {
    /// Create application state and spawn the background workers.
    ///
    /// # Panics
    ///
    /// Panics if the configuration fails validation; `main` validates
    /// before getting here, so this guards test setups.
    pub fn new(config: AppConfig, content: ContentStore, publish: PublishStore) -> Self {
        if let Err(error) = config.validate() {
            panic!("invalid configuration: {error}");
        }

        let config = Arc::new(config);
        let publish_layout = BuildDirectory::new(&config.publish.file_disk_path);
        let ingest_layout = BuildDirectory::new(&config.content.version_disk_path);
        let http = reqwest::Client::new();

        let request_log = if config.content.log_requests {
            requestlog::spawn_writer(config.content.log_request_storage, content.clone())
        } else {
            None
        };

        let jobs = JobRunner::spawn(JobContext {
            config: config.clone(),
            content: content.clone(),
            publish: publish.clone(),
            publish_layout: publish_layout.clone(),
            ingest_layout: ingest_layout.clone(),
            http: http.clone(),
        });

        Self {
            config,
            content,
            publish,
            publish_layout,
            ingest_layout,
            jobs,
            request_log,
            http,
        }
    }

    /// Look up a fork's configuration, 404 on unknown names. This runs
    /// before any auth check so unknown and forbidden forks are
    /// indistinguishable in shape.
    pub fn fork_config(&self, name: &str) -> ApiResult<&ForkConfig> {
        self.config
            .forks
            .get(name)
            .ok_or_else(|| ApiError::NotFound(format!("unknown fork: {name}")))
    }

    /// The fork backing the legacy unscoped `/version/...` routes.
    /// 404 when no default fork is configured.
    pub fn default_fork(&self) -> ApiResult<&str> {
        self.config
            .content
            .default_fork
            .as_deref()
            .ok_or_else(|| ApiError::NotFound("no default fork configured".to_string()))
    }
}

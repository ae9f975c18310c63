//! Background jobs.
//!
//! Each fork gets one worker task fed by a capacity-1 trigger channel:
//! a trigger while a run is pending coalesces, and a single worker per
//! fork means ingestion is never re-entrant. A worker run executes the
//! full update chain in order: ingest, availability flip, manifest-cache
//! rebuild, watchdog notify.
//!
//! Interval jobs (build pruning, stale-publish cleanup) run on their own
//! 24-hour loops. Background jobs never crash the process; failures are
//! logged and the job re-runs on its schedule.

pub mod availability;
pub mod ingest;
pub mod maintenance;

use depot_core::BuildDirectory;
use depot_core::config::AppConfig;
use depot_db::{ContentStore, PublishStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Everything a background job needs, detached from request state.
#[derive(Clone)]
pub struct JobContext {
    pub config: Arc<AppConfig>,
    pub content: ContentStore,
    pub publish: PublishStore,
    pub publish_layout: BuildDirectory,
    pub ingest_layout: BuildDirectory,
    pub http: reqwest::Client,
}

const INTERVAL_JOB_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Handle for triggering per-fork update runs.
pub struct JobRunner {
    triggers: HashMap<String, mpsc::Sender<()>>,
}

impl JobRunner {
    /// Spawn one worker per configured fork plus the interval jobs.
    pub fn spawn(ctx: JobContext) -> Arc<Self> {
        let mut triggers = HashMap::new();

        for fork in ctx.config.forks.keys() {
            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(fork_worker(ctx.clone(), fork.clone(), rx));
            triggers.insert(fork.clone(), tx);
        }

        tokio::spawn(prune_loop(ctx.clone()));
        tokio::spawn(stale_publish_loop(ctx));

        Arc::new(Self { triggers })
    }

    /// Queue an update run for one fork. A pending trigger coalesces.
    /// Returns false for forks this runner does not know.
    pub fn trigger_ingest(&self, fork: &str) -> bool {
        match self.triggers.get(fork) {
            Some(tx) => {
                // Full channel means a run is already queued; that run will
                // pick up whatever is on disk, so dropping the send is the
                // coalescing the scheduler promises.
                let _ = tx.try_send(());
                true
            }
            None => false,
        }
    }

    /// Queue an update run for every fork (startup discovery).
    pub fn trigger_all(&self) {
        for fork in self.triggers.keys() {
            self.trigger_ingest(fork);
        }
    }
}

async fn fork_worker(ctx: JobContext, fork: String, mut rx: mpsc::Receiver<()>) {
    while rx.recv().await.is_some() {
        if let Err(error) = run_fork_update(&ctx, &fork).await {
            tracing::error!(fork = %fork, %error, "Fork update run failed");
        }
    }
}

/// One full update run for a fork: ingest new versions, flip them
/// available, republish the cached server manifest, notify watchdogs.
///
/// Ingestion errors do not stop the chain: versions committed by interim
/// commits still become available, and the failed version is retried on
/// the next trigger.
pub async fn run_fork_update(ctx: &JobContext, fork: &str) -> anyhow::Result<()> {
    let ingest_result = ingest::run(ctx, fork).await;
    if let Err(error) = &ingest_result {
        tracing::error!(fork = %fork, %error, "Ingestion failed, continuing update chain");
    }

    let flipped = availability::flip_available(ctx, fork).await?;
    availability::rebuild_manifest_cache(ctx, fork).await?;

    if flipped > 0 {
        availability::notify_watchdogs(ctx, fork).await;
    }

    ingest_result.map(|_| ())
}

async fn prune_loop(ctx: JobContext) {
    let mut interval = tokio::time::interval(INTERVAL_JOB_PERIOD);
    loop {
        interval.tick().await;
        if let Err(error) = maintenance::prune_builds(&ctx).await {
            tracing::error!(job = "prune_builds", %error, "Scheduled job failed");
        }
    }
}

async fn stale_publish_loop(ctx: JobContext) {
    let mut interval = tokio::time::interval(INTERVAL_JOB_PERIOD);
    loop {
        interval.tick().await;
        if let Err(error) = maintenance::abort_stale_publishes(&ctx).await {
            tracing::error!(job = "abort_stale_publishes", %error, "Scheduled job failed");
        }
    }
}

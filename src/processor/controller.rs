//! Per-tick run orchestration: connect clients, bootstrap the destination
//! cache, seed the worker pool and wait for every job to report back.

use crate::processor::backoff::ExponentialBackoff;
use crate::processor::barrier::CompletionBarrier;
use crate::processor::destination_cache::DestinationCache;
use crate::processor::worker_pool::WorkerPool;
use crate::registry::{CredentialPair, DestinationRegistry, ImageRegistry};
use crate::runtime::config::RunConfig;
use crate::runtime::protocol::{JobContext, MirrorFactory};
use crate::runtime::telemetry::{Telemetry, TelemetrySnapshot};
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Builds the registry clients a run needs.
pub trait Connector: Send + Sync {
    /// Control-plane client for the destination registry.
    fn connect_destination<'a>(
        &'a self,
        config: &'a RunConfig,
    ) -> BoxFuture<'a, Result<Arc<dyn DestinationRegistry>>>;

    /// Pull client for the source registry, already probed for connectivity.
    fn connect_source<'a>(
        &'a self,
        config: &'a RunConfig,
    ) -> BoxFuture<'a, Result<Arc<dyn ImageRegistry>>>;

    /// Push client for the destination registry. `login` holds the decoded
    /// destination authorization token when one could be obtained.
    fn connect_target<'a>(
        &'a self,
        config: &'a RunConfig,
        login: Option<CredentialPair>,
    ) -> BoxFuture<'a, Result<Arc<dyn ImageRegistry>>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub jobs: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub repositories_created: u64,
    pub elapsed: Duration,
}

impl RunSummary {
    fn from_delta(jobs: usize, delta: &TelemetrySnapshot, elapsed: Duration) -> Self {
        Self {
            jobs,
            succeeded: delta.jobs_succeeded,
            failed: delta.jobs_failed(),
            repositories_created: delta.repositories_created,
            elapsed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every queued job signaled completion.
    Completed(RunSummary),
    /// Another run was still in progress; nothing was queued.
    Skipped,
    /// Shutdown was requested before the run drained.
    Interrupted,
}

struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct RunController {
    config: Arc<RunConfig>,
    connector: Arc<dyn Connector>,
    telemetry: Arc<Telemetry>,
    backoff: ExponentialBackoff,
    pool: WorkerPool,
    in_progress: AtomicBool,
    shutdown: CancellationToken,
}

impl RunController {
    pub fn new(
        config: Arc<RunConfig>,
        connector: Arc<dyn Connector>,
        factory: Arc<dyn MirrorFactory>,
    ) -> Self {
        Self::with_telemetry(config, connector, factory, Arc::new(Telemetry::default()))
    }

    pub fn with_telemetry(
        config: Arc<RunConfig>,
        connector: Arc<dyn Connector>,
        factory: Arc<dyn MirrorFactory>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::new(factory, telemetry.clone(), shutdown.clone());
        Self {
            config,
            connector,
            telemetry,
            backoff: ExponentialBackoff::default(),
            pool,
            in_progress: AtomicBool::new(false),
            shutdown,
        }
    }

    /// Overrides the bootstrap retry policy.
    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    /// Root token; cancelling it stops in-flight jobs and idle workers.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn worker_count(&self) -> usize {
        self.pool.worker_count()
    }

    /// Executes one scheduled run. Errors are fatal for the process; per-job
    /// failures are only counted in the summary.
    pub async fn run(&self) -> Result<RunOutcome> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.telemetry.record_run_skipped();
            tracing::warn!("previous run still in progress; skipping this tick");
            return Ok(RunOutcome::Skipped);
        }
        let _in_progress = InProgress(&self.in_progress);

        self.execute().await
    }

    async fn execute(&self) -> Result<RunOutcome> {
        tracing::info!("starting run of scheduled mirror job");
        self.telemetry.record_run_started();
        let started = Instant::now();
        let before = self.telemetry.snapshot();
        let config = &self.config;

        config.validate().context("invalid run configuration")?;

        tracing::info!(registry = config.source_registry(), "connecting to source registry");
        let source = self
            .connector
            .connect_source(config)
            .await
            .context("could not connect to source registry")?;

        tracing::info!(registry = config.target_registry(), "connecting to destination registry");
        let destination = self
            .connector
            .connect_destination(config)
            .await
            .context("could not create destination registry client")?;

        let cache = Arc::new(DestinationCache::new(destination, self.telemetry.clone()));
        cache.bootstrap(self.backoff, &self.shutdown).await?;

        let login = cache.login().await.ok();
        let target = self
            .connector
            .connect_target(config, login)
            .await
            .context("could not create destination push client")?;

        if self.pool.launch(config.workers()) {
            tracing::debug!(workers = config.workers(), "launched persistent workers");
        }

        let context = JobContext {
            config: config.clone(),
            cache,
            source,
            target,
        };
        let barrier = Arc::new(CompletionBarrier::new());
        let jobs = config.selected_jobs();
        let total = jobs.len();

        for job in jobs {
            if self.shutdown.is_cancelled() {
                break;
            }
            let cancel = self.shutdown.child_token();
            if let Err(err) = self.pool.submit(job, context.clone(), &barrier, cancel).await {
                tracing::warn!(error = %err, "stopped queueing jobs");
                break;
            }
        }

        tokio::select! {
            _ = barrier.wait() => {}
            _ = self.shutdown.cancelled() => {
                tracing::warn!(pending = barrier.pending(), "run interrupted by shutdown");
                return Ok(RunOutcome::Interrupted);
            }
        }

        if self.shutdown.is_cancelled() {
            return Ok(RunOutcome::Interrupted);
        }

        self.telemetry.record_run_completed();
        let delta = self.telemetry.snapshot().since(&before);
        let summary = RunSummary::from_delta(total, &delta, started.elapsed());
        tracing::info!(
            jobs = summary.jobs,
            succeeded = summary.succeeded,
            failed = summary.failed,
            created = summary.repositories_created,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Done"
        );

        Ok(RunOutcome::Completed(summary))
    }

    /// Cancels the root token and waits for the workers to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.pool.shutdown().await;
    }
}

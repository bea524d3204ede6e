use anyhow::{Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs the global tracing subscriber (if one is not already active).
///
/// `level` (normally the `LOG_LEVEL` environment value) wins over `RUST_LOG`,
/// which wins over the `info` default. A level that does not parse is an
/// error. Calling this function multiple times is harmless.
pub fn init_tracing(level: Option<&str>) -> Result<()> {
    if TRACING_INIT.get().is_some() {
        return Ok(());
    }

    let filter = build_filter(level)?;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
    Ok(())
}

fn build_filter(level: Option<&str>) -> Result<EnvFilter> {
    match level {
        Some(level) => {
            let parsed: tracing::Level = level
                .trim()
                .parse()
                .with_context(|| format!("could not parse log level {level:?}"))?;
            Ok(EnvFilter::default().add_directive(LevelFilter::from_level(parsed).into()))
        }
        None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))),
    }
}

/// Process-wide counters describing scheduled runs and dispatched jobs.
#[derive(Default, Debug)]
pub struct Telemetry {
    runs_started: AtomicU64,
    runs_completed: AtomicU64,
    runs_skipped: AtomicU64,
    jobs_dispatched: AtomicU64,
    jobs_succeeded: AtomicU64,
    setup_failures: AtomicU64,
    work_failures: AtomicU64,
    job_panics: AtomicU64,
    bootstrap_retries: AtomicU64,
    repositories_created: AtomicU64,
}

impl Telemetry {
    pub fn record_run_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run_completed(&self) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run_skipped(&self) {
        self.runs_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_dispatched(&self) {
        self.jobs_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_succeeded(&self) {
        self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_setup_failure(&self) {
        self.setup_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_work_failure(&self) {
        self.work_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_panic(&self) {
        self.job_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bootstrap_retry(&self) {
        self.bootstrap_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_repository_created(&self) {
        self.repositories_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            runs_skipped: self.runs_skipped.load(Ordering::Relaxed),
            jobs_dispatched: self.jobs_dispatched.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            setup_failures: self.setup_failures.load(Ordering::Relaxed),
            work_failures: self.work_failures.load(Ordering::Relaxed),
            job_panics: self.job_panics.load(Ordering::Relaxed),
            bootstrap_retries: self.bootstrap_retries.load(Ordering::Relaxed),
            repositories_created: self.repositories_created.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub runs_started: u64,
    pub runs_completed: u64,
    pub runs_skipped: u64,
    pub jobs_dispatched: u64,
    pub jobs_succeeded: u64,
    pub setup_failures: u64,
    pub work_failures: u64,
    pub job_panics: u64,
    pub bootstrap_retries: u64,
    pub repositories_created: u64,
}

impl TelemetrySnapshot {
    /// Jobs that ended without a successful transfer.
    pub fn jobs_failed(&self) -> u64 {
        self.setup_failures
            .saturating_add(self.work_failures)
            .saturating_add(self.job_panics)
    }

    /// Counter deltas accumulated since `earlier`.
    pub fn since(&self, earlier: &TelemetrySnapshot) -> TelemetrySnapshot {
        TelemetrySnapshot {
            runs_started: self.runs_started.saturating_sub(earlier.runs_started),
            runs_completed: self.runs_completed.saturating_sub(earlier.runs_completed),
            runs_skipped: self.runs_skipped.saturating_sub(earlier.runs_skipped),
            jobs_dispatched: self.jobs_dispatched.saturating_sub(earlier.jobs_dispatched),
            jobs_succeeded: self.jobs_succeeded.saturating_sub(earlier.jobs_succeeded),
            setup_failures: self.setup_failures.saturating_sub(earlier.setup_failures),
            work_failures: self.work_failures.saturating_sub(earlier.work_failures),
            job_panics: self.job_panics.saturating_sub(earlier.job_panics),
            bootstrap_retries: self
                .bootstrap_retries
                .saturating_sub(earlier.bootstrap_retries),
            repositories_created: self
                .repositories_created
                .saturating_sub(earlier.repositories_created),
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use registry_mirror::{RepositoryJob, RunConfig};
use tokio::time::{sleep, Instant};
use tracing_subscriber::EnvFilter;

pub const TARGET_REGISTRY: &str = "123456789012.dkr.ecr.eu-west-1.amazonaws.com";
pub const TARGET_PREFIX: &str = "hub/";

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

pub fn jobs(names: &[&str]) -> Vec<RepositoryJob> {
    names.iter().map(|name| RepositoryJob::new(*name)).collect()
}

pub fn run_config(names: &[&str], workers: usize) -> Arc<RunConfig> {
    Arc::new(
        RunConfig::builder()
            .workers(workers)
            .target_registry(TARGET_REGISTRY)
            .target_prefix(TARGET_PREFIX)
            .repositories(jobs(names))
            .schedule_interval(Duration::from_secs(60))
            .build()
            .expect("test config should be valid"),
    )
}

pub fn filtered_run_config(names: &[&str], workers: usize, prefix: &str) -> Arc<RunConfig> {
    Arc::new(
        RunConfig::builder()
            .workers(workers)
            .target_registry(TARGET_REGISTRY)
            .target_prefix(TARGET_PREFIX)
            .repositories(jobs(names))
            .schedule_interval(Duration::from_secs(60))
            .name_filter(prefix)
            .build()
            .expect("test config should be valid"),
    )
}

pub async fn wait_until<F>(mut condition: F, timeout: Duration, what: &str) -> Result<()>
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    loop {
        if condition() {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!("timed out after {timeout:?} waiting for {what}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}

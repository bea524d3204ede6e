use crate::processor::destination_cache::DestinationCache;
use crate::registry::ImageRegistry;
use crate::runtime::config::{RepositoryJob, RunConfig};
use anyhow::Error as AnyError;
use core::future::Future;
use core::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub type MirrorFuture<'a> = Pin<Box<dyn Future<Output = Result<(), MirrorError>> + Send + 'a>>;

/// Enumerates the execution stages of a [`Mirror`] job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorStage {
    Setup,
    Work,
}

/// Error surfaced by mirror hooks. Scoped to a single job; never fatal for the run.
#[derive(Debug)]
pub struct MirrorError {
    stage: MirrorStage,
    source: AnyError,
}

impl MirrorError {
    pub fn new(stage: MirrorStage, source: AnyError) -> Self {
        Self { stage, source }
    }

    pub fn setup(source: impl Into<AnyError>) -> Self {
        Self::new(MirrorStage::Setup, source.into())
    }

    pub fn work(source: impl Into<AnyError>) -> Self {
        Self::new(MirrorStage::Work, source.into())
    }

    pub fn stage(&self) -> MirrorStage {
        self.stage
    }

    pub fn into_source(self) -> AnyError {
        self.source
    }
}

impl core::fmt::Display for MirrorError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?} mirror error: {:#}", self.stage, self.source)
    }
}

impl std::error::Error for MirrorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Handles shared by every job of one scheduled run.
#[derive(Clone)]
pub struct JobContext {
    pub config: Arc<RunConfig>,
    pub cache: Arc<DestinationCache>,
    pub source: Arc<dyn ImageRegistry>,
    pub target: Arc<dyn ImageRegistry>,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("source", &self.source.host())
            .field("target", &self.target.host())
            .finish()
    }
}

/// Per-repository transfer logic driven by the worker pool.
pub trait Mirror: Send {
    /// Prepares the job: provisions the destination and selects what to copy.
    fn setup<'a>(&'a mut self, job: &'a RepositoryJob) -> MirrorFuture<'a>;

    /// Performs the transfer. Implementations should stop early once `cancel` fires.
    fn work<'a>(&'a mut self, cancel: CancellationToken) -> MirrorFuture<'a>;
}

/// Builds a fresh [`Mirror`] for every dequeued job.
pub trait MirrorFactory: Send + Sync + 'static {
    fn create(&self, context: JobContext) -> Box<dyn Mirror>;
}

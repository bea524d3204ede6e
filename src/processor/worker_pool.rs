//! Fixed pool of persistent workers draining the bounded job queue.
//!
//! Workers are spawned once and outlive individual runs; every dispatch
//! carries the run's [`JobContext`], its completion guard, and a cancellation
//! token, so nothing run-specific lives in the worker itself.

use crate::processor::barrier::{CompletionBarrier, CompletionGuard};
use crate::runtime::config::RepositoryJob;
use crate::runtime::protocol::{JobContext, MirrorError, MirrorFactory, MirrorStage};
use crate::runtime::telemetry::Telemetry;
use anyhow::{anyhow, Result};
use futures::FutureExt;
use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outstanding jobs the queue holds before producers block.
pub const JOB_QUEUE_CAPACITY: usize = 5;

pub(crate) struct Dispatch {
    pub job: RepositoryJob,
    pub context: JobContext,
    pub guard: CompletionGuard,
    pub cancel: CancellationToken,
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<Dispatch>>>;

pub struct WorkerPool {
    factory: Arc<dyn MirrorFactory>,
    telemetry: Arc<Telemetry>,
    sender: mpsc::Sender<Dispatch>,
    receiver: SharedReceiver,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        factory: Arc<dyn MirrorFactory>,
        telemetry: Arc<Telemetry>,
        shutdown: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(JOB_QUEUE_CAPACITY);
        Self {
            factory,
            telemetry,
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            workers: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Spawns `count` workers unless the pool is already running. Returns
    /// whether workers were started by this call.
    pub fn launch(&self, count: usize) -> bool {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if !workers.is_empty() {
            return false;
        }

        let count = count.max(1);
        for worker_id in 0..count {
            let receiver = self.receiver.clone();
            let factory = self.factory.clone();
            let telemetry = self.telemetry.clone();
            let shutdown = self.shutdown.clone();
            workers.push(tokio::spawn(worker_loop(
                worker_id, receiver, factory, telemetry, shutdown,
            )));
        }

        tracing::info!(workers = count, "worker pool started");
        true
    }

    /// Hands a job to the pool, blocking while the queue is full.
    ///
    /// The barrier slot is taken before the job is queued; if the job cannot be
    /// queued the slot is released again.
    pub async fn submit(
        &self,
        job: RepositoryJob,
        context: JobContext,
        barrier: &Arc<CompletionBarrier>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let name = job.name.clone();
        let dispatch = Dispatch {
            job,
            context,
            guard: barrier.enter(),
            cancel,
        };

        tokio::select! {
            sent = self.sender.send(dispatch) => {
                sent.map_err(|_| anyhow!("job queue closed before {name} could be queued"))?;
            }
            _ = self.shutdown.cancelled() => {
                return Err(anyhow!("shutdown requested before {name} could be queued"));
            }
        }

        self.telemetry.record_job_dispatched();
        tracing::debug!(repository = %name, "job queued");
        Ok(())
    }

    /// Stops idle workers and waits for every worker task to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for (worker_id, handle) in handles.into_iter().enumerate() {
            if let Err(err) = handle.await {
                tracing::warn!(worker = worker_id, error = %err, "worker task ended abnormally");
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: SharedReceiver,
    factory: Arc<dyn MirrorFactory>,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
) {
    tracing::debug!(worker = worker_id, "starting worker");

    loop {
        let dispatch = {
            let mut receiver = tokio::select! {
                receiver = receiver.lock() => receiver,
                _ = shutdown.cancelled() => break,
            };
            tokio::select! {
                dispatch = receiver.recv() => dispatch,
                _ = shutdown.cancelled() => None,
            }
        };

        match dispatch {
            Some(dispatch) => run_job(worker_id, factory.as_ref(), &telemetry, dispatch).await,
            None => break,
        }
    }

    tracing::debug!(worker = worker_id, "worker stopped");
}

async fn run_job(
    worker_id: usize,
    factory: &dyn MirrorFactory,
    telemetry: &Telemetry,
    dispatch: Dispatch,
) {
    let Dispatch {
        job,
        context,
        guard,
        cancel,
    } = dispatch;

    let result = std::panic::AssertUnwindSafe(execute(factory, context, &job, cancel))
        .catch_unwind()
        .await;

    match result {
        Ok(Ok(())) => {
            telemetry.record_job_succeeded();
            tracing::info!(worker = worker_id, repository = %job.name, "mirror job finished");
        }
        Ok(Err(err)) => {
            match err.stage() {
                MirrorStage::Setup => telemetry.record_setup_failure(),
                MirrorStage::Work => telemetry.record_work_failure(),
            }
            let stage = err.stage();
            let err = err.into_source();
            tracing::error!(
                worker = worker_id,
                repository = %job.name,
                stage = ?stage,
                error = %format!("{err:#}"),
                "mirror job failed"
            );
        }
        Err(panic_payload) => {
            telemetry.record_job_panic();
            tracing::error!(
                worker = worker_id,
                repository = %job.name,
                panic = %panic_message(panic_payload.as_ref()),
                "mirror job panicked"
            );
        }
    }

    guard.complete();
}

async fn execute(
    factory: &dyn MirrorFactory,
    context: JobContext,
    job: &RepositoryJob,
    cancel: CancellationToken,
) -> Result<(), MirrorError> {
    let mut mirror = factory.create(context);
    mirror.setup(job).await?;
    mirror.work(cancel).await
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

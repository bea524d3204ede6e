use crate::processor::controller::{RunController, RunOutcome};
use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Drives the run controller on its schedule and handles OS signals for graceful shutdowns.
pub struct Runner {
    controller: Arc<RunController>,
    shutdown: CancellationToken,
}

impl Runner {
    /// Creates a runner sharing the controller's root [`CancellationToken`], so
    /// stopping the runner also cancels in-flight jobs.
    pub fn new(controller: Arc<RunController>) -> Self {
        let shutdown = controller.cancellation_token();
        Self {
            controller,
            shutdown,
        }
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn controller(&self) -> Arc<RunController> {
        self.controller.clone()
    }

    /// Runs immediately and then on every schedule tick until the shutdown
    /// token is cancelled. A fatal run error stops the runner and is returned.
    pub async fn run_until_cancelled(&self) -> Result<()> {
        let period = self.controller.config().schedule_interval();
        tracing::info!(
            minutes = period.as_secs() / 60,
            "scheduling mirror job"
        );

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let result = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    tracing::info!("runner shutdown token cancelled");
                    break Ok(());
                }
                _ = ticker.tick() => {}
            }

            match self.controller.run().await {
                Ok(RunOutcome::Completed(_)) | Ok(RunOutcome::Skipped) => {}
                Ok(RunOutcome::Interrupted) => break Ok(()),
                Err(err) if self.shutdown.is_cancelled() => {
                    tracing::info!(error = %format!("{err:#}"), "run aborted by shutdown");
                    break Ok(());
                }
                Err(err) => {
                    tracing::error!(error = %format!("{err:#}"), "fatal run error; stopping");
                    break Err(err);
                }
            }
        };

        self.controller.shutdown().await;
        result
    }

    /// Runs until a Ctrl-C (SIGINT) is received or the shutdown token is cancelled elsewhere.
    pub async fn run_until_ctrl_c(&self) -> Result<()> {
        let token = self.shutdown.clone();
        let signals = tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                tracing::info!("Ctrl-C received; shutting down runner");
                token.cancel();
            }
        });

        let result = self.run_until_cancelled().await;
        signals.abort();
        result
    }

    /// Stops the runner and cancels in-flight jobs.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

use anyhow::{anyhow, Result};
use rand::Rng;
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_MAX_ELAPSED: Duration = Duration::from_secs(10);
const DEFAULT_MULTIPLIER: f64 = 2.0;
const DEFAULT_RANDOMIZATION_FACTOR: f64 = 0.5;

/// Exponential backoff with jitter, bounded by a total elapsed-time budget.
///
/// Attempts keep going until the budget is spent; the delay before the last
/// attempt is clipped so that the final failure happens no earlier than
/// `max_elapsed` after the first attempt started.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub randomization_factor: f64,
    pub max_interval: Duration,
    pub max_elapsed: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_interval: DEFAULT_INITIAL_INTERVAL,
            multiplier: DEFAULT_MULTIPLIER,
            randomization_factor: DEFAULT_RANDOMIZATION_FACTOR,
            max_interval: DEFAULT_MAX_INTERVAL,
            max_elapsed: DEFAULT_MAX_ELAPSED,
        }
    }
}

impl ExponentialBackoff {
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_elapsed(mut self, budget: Duration) -> Self {
        self.max_elapsed = budget;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.randomization_factor = 0.0;
        self
    }
}

#[derive(Clone, Copy)]
pub(crate) struct RetryBackoff<'a> {
    pub policy: ExponentialBackoff,
    pub cancellation: Option<&'a CancellationToken>,
}

impl<'a> RetryBackoff<'a> {
    pub(crate) fn new(policy: ExponentialBackoff) -> Self {
        Self {
            policy,
            cancellation: None,
        }
    }

    pub(crate) fn with_cancellation(mut self, token: &'a CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Runs `operation` until it succeeds or the elapsed budget is exhausted.
///
/// `on_retry` observes every failed attempt that will be retried, with the
/// delay before the next attempt. The last error is returned once the budget
/// is spent.
pub(crate) async fn retry_with_backoff<'a, T, F, Fut, L>(
    config: RetryBackoff<'a>,
    mut operation: F,
    mut on_retry: L,
) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
    L: FnMut(usize, Duration, &anyhow::Error),
{
    let policy = config.policy;
    let started = Instant::now();
    let mut attempt = 0;
    let mut interval = policy.initial_interval;

    loop {
        attempt += 1;

        if let Some(token) = config.cancellation {
            if token.is_cancelled() {
                return Err(anyhow!("retry cancelled"));
            }
        }

        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let elapsed = started.elapsed();
        if elapsed >= policy.max_elapsed {
            return Err(err.context(format!(
                "retry budget of {:?} exhausted after {attempt} attempts",
                policy.max_elapsed
            )));
        }

        let remaining = policy.max_elapsed - elapsed;
        let delay = randomize(interval, policy.randomization_factor).min(remaining);
        on_retry(attempt, delay, &err);

        sleep_with_cancellation(delay, config.cancellation).await?;
        interval = next_backoff(interval, &policy);
    }
}

async fn sleep_with_cancellation(
    delay: Duration,
    cancellation: Option<&CancellationToken>,
) -> Result<()> {
    if delay.is_zero() {
        yield_now().await;
        return Ok(());
    }

    if let Some(token) = cancellation {
        tokio::select! {
            _ = token.cancelled() => Err(anyhow!("retry cancelled")),
            _ = sleep(delay) => Ok(()),
        }
    } else {
        sleep(delay).await;
        Ok(())
    }
}

fn next_backoff(current: Duration, policy: &ExponentialBackoff) -> Duration {
    if current.is_zero() {
        return policy.max_interval.min(Duration::from_millis(1));
    }

    let next = current.mul_f64(policy.multiplier.max(1.0));
    next.min(policy.max_interval)
}

/// Picks a delay uniformly from `interval * [1 - factor, 1 + factor]`.
fn randomize(interval: Duration, factor: f64) -> Duration {
    let factor = factor.clamp(0.0, 1.0);
    if factor == 0.0 || interval.is_zero() {
        return interval;
    }

    let base = interval.as_secs_f64();
    let low = base * (1.0 - factor);
    let high = base * (1.0 + factor);
    Duration::from_secs_f64(rand::thread_rng().gen_range(low..=high))
}

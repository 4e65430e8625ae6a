//! Bounded-concurrency batches over a population of users.
//!
//! Each user is an independent unit. A failing unit is logged, retried while
//! its error is transient, and reported; it never stops the batch. Progress
//! is published on a `watch` channel owned by the caller's [`BatchControl`],
//! and cancelling the control's token stops new units from starting.

use std::future::Future;
use std::time::{Duration, Instant};

use futures::{stream, StreamExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::limits::MAX_BATCH_WORKERS;
use crate::model::UserId;

use super::{Engine, EngineError};

/// Exponential backoff for transient store failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per unit, the first one included.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

/// The delay after `current`, clamped to [`RetryPolicy::max_delay`].
pub fn next_delay(current: Duration, policy: &RetryPolicy) -> Duration {
    let next_ms = (current.as_millis() as f64 * policy.multiplier) as u64;
    Duration::from_millis(next_ms).min(policy.max_delay)
}

/// Run `op` until it succeeds, fails permanently, runs out of attempts, or
/// `cancel` fires during a backoff sleep.
pub(super) async fn with_retry<T, F, Fut>(
    batch: &'static str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut delay = policy.initial_delay;
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                tracing::debug!(
                    batch,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                metrics::counter!(crate::observability::BATCH_RETRIES_TOTAL, "batch" => batch)
                    .increment(1);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(e),
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = next_delay(delay, policy);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

impl Progress {
    pub fn is_done(&self) -> bool {
        self.completed >= self.total
    }
}

/// Caller-side handle for one batch: cancel it, watch its progress.
pub struct BatchControl {
    pub cancel: CancellationToken,
    progress: watch::Sender<Progress>,
}

impl BatchControl {
    pub fn new() -> (Self, watch::Receiver<Progress>) {
        Self::with_cancel(CancellationToken::new())
    }

    pub fn with_cancel(cancel: CancellationToken) -> (Self, watch::Receiver<Progress>) {
        let (progress, rx) = watch::channel(Progress::default());
        (Self { cancel, progress }, rx)
    }

    pub fn progress(&self) -> Progress {
        *self.progress.borrow()
    }

    fn publish(&self, batch: &'static str, progress: Progress) {
        metrics::gauge!(crate::observability::BATCH_PROGRESS, "batch" => batch)
            .set(progress.completed as f64);
        self.progress.send_replace(progress);
    }
}

#[derive(Debug)]
pub struct UnitFailure {
    pub user: UserId,
    pub error: EngineError,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: usize,
    /// Succeeded units that wrote something.
    pub changed: usize,
    pub failed: Vec<UnitFailure>,
    /// Units never started because the batch was cancelled.
    pub skipped: usize,
}

impl BatchReport {
    pub fn failed_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.failed.iter().map(|f| f.user).collect();
        users.sort();
        users
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.skipped == 0
    }
}

impl Engine {
    /// Run `unit` once per user on up to `settings.workers` concurrent tasks.
    /// `unit` returns whether it changed anything.
    pub(super) async fn run_batch<F, Fut>(
        &self,
        batch: &'static str,
        users: &[UserId],
        control: &BatchControl,
        unit: F,
    ) -> BatchReport
    where
        F: Fn(UserId) -> Fut,
        Fut: Future<Output = Result<bool, EngineError>>,
    {
        let total = users.len();
        let workers = self.settings.workers.clamp(1, MAX_BATCH_WORKERS);
        let retry = &self.settings.retry;
        let unit = &unit;
        let started = Instant::now();
        control.publish(batch, Progress { completed: 0, total });

        let mut results = stream::iter(users.iter().copied())
            .map(|user| async move {
                if control.cancel.is_cancelled() {
                    return (user, None);
                }
                let unit_start = Instant::now();
                let result = with_retry(batch, retry, &control.cancel, || unit(user)).await;
                metrics::histogram!(
                    crate::observability::BATCH_UNIT_DURATION_SECONDS,
                    "batch" => batch
                )
                .record(unit_start.elapsed().as_secs_f64());
                (user, Some(result))
            })
            .buffer_unordered(workers);

        let mut report = BatchReport { total, ..BatchReport::default() };
        let mut completed = 0;
        while let Some((user, outcome)) = results.next().await {
            let label = match outcome {
                None => {
                    report.skipped += 1;
                    "skipped"
                }
                Some(Ok(changed)) => {
                    report.succeeded += 1;
                    if changed {
                        report.changed += 1;
                    }
                    tracing::debug!(batch, %user, changed, "unit done");
                    "ok"
                }
                Some(Err(error)) => {
                    tracing::warn!(batch, %user, %error, "unit failed, skipping");
                    report.failed.push(UnitFailure { user, error });
                    "failed"
                }
            };
            metrics::counter!(
                crate::observability::BATCH_UNITS_TOTAL,
                "batch" => batch,
                "outcome" => label
            )
            .increment(1);
            completed += 1;
            control.publish(batch, Progress { completed, total });
        }

        tracing::info!(
            batch,
            total,
            succeeded = report.succeeded,
            changed = report.changed,
            failed = report.failed.len(),
            skipped = report.skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch finished"
        );
        report
    }
}

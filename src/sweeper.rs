use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::{BatchControl, BatchReport, Engine, EngineError};
use crate::store::WalStore;

/// Outcome of one sweep over a partition.
#[derive(Debug)]
pub struct SweepSummary {
    pub reconcile: BatchReport,
    pub hours: BatchReport,
}

/// Reconcile availability and refresh service hours for every user, then prune
/// idle notification channels.
pub async fn sweep_once(
    engine: &Engine,
    cancel: &CancellationToken,
) -> Result<SweepSummary, EngineError> {
    let (control, _progress) = BatchControl::with_cancel(cancel.child_token());
    let reconcile = engine.reconcile_everyone(&control).await?;
    let (control, _progress) = BatchControl::with_cancel(cancel.child_token());
    let hours = engine.refresh_hours_everyone(&control).await?;
    let channels_pruned = engine.notify.prune();
    info!(
        reconciled = reconcile.succeeded,
        reconcile_failed = reconcile.failed.len(),
        hours_refreshed = hours.succeeded,
        hours_failed = hours.failed.len(),
        channels_pruned,
        "sweep finished"
    );
    Ok(SweepSummary { reconcile, hours })
}

/// Background task that sweeps a partition on a fixed interval until cancelled.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("sweeper stopping");
                break;
            }
            _ = interval.tick() => {
                if let Err(e) = sweep_once(&engine, &cancel).await {
                    tracing::error!(error = %e, "sweep failed");
                }
            }
        }
    }
}

/// Background task that compacts the WAL once enough commits pile up.
pub async fn run_compactor(store: Arc<WalStore>, threshold: u64, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let appends = store.appends_since_compact().await;
                if appends < threshold {
                    continue;
                }
                match store.compact().await {
                    Ok(()) => {
                        info!(appends, "compacted WAL");
                        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL, "status" => "ok")
                            .increment(1);
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "WAL compaction failed");
                        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL, "status" => "error")
                            .increment(1);
                    }
                }
            }
        }
    }
}

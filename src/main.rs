use std::path::PathBuf;
use std::time::Duration;

use chrono::FixedOffset;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tutorhours::engine::{EngineSettings, RetryPolicy};
use tutorhours::partition::PartitionManager;
use tutorhours::report::{JsonLinesSink, ReportSink};
use tutorhours::sweeper;

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let metrics_port: Option<u16> = env_parse("TUTORHOURS_METRICS_PORT");
    tutorhours::observability::init(metrics_port)?;

    let data_dir = std::env::var("TUTORHOURS_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let partition = std::env::var("TUTORHOURS_PARTITION").unwrap_or_else(|_| "default".into());
    let workers: usize = env_parse("TUTORHOURS_WORKERS").unwrap_or(8);
    let max_attempts: u32 = env_parse("TUTORHOURS_MAX_ATTEMPTS").unwrap_or(3);
    let sweep_secs: u64 = env_parse("TUTORHOURS_SWEEP_INTERVAL_SECS").unwrap_or(3600);
    let compact_threshold: u64 = env_parse("TUTORHOURS_COMPACT_THRESHOLD").unwrap_or(1000);
    let offset_minutes: i32 = env_parse("TUTORHOURS_UTC_OFFSET_MINUTES").unwrap_or(0);
    let report_path = std::env::var("TUTORHOURS_REPORT_PATH").ok();
    let oneshot = std::env::var("TUTORHOURS_ONESHOT").is_ok_and(|v| v != "0" && !v.is_empty());

    let utc_offset = FixedOffset::east_opt(offset_minutes * 60)
        .ok_or("TUTORHOURS_UTC_OFFSET_MINUTES out of range")?;
    let settings = EngineSettings {
        workers,
        retry: RetryPolicy {
            max_attempts: max_attempts.max(1),
            ..RetryPolicy::default()
        },
        utc_offset,
    };

    // Ensure data directory exists
    std::fs::create_dir_all(&data_dir)?;

    let sweep_interval = Duration::from_secs(sweep_secs.max(1));
    let manager = PartitionManager::new(
        PathBuf::from(&data_dir),
        settings,
        compact_threshold,
        (!oneshot).then_some(sweep_interval),
    );
    let handle = manager.get_or_create(&partition)?;

    info!("tutorhours started");
    info!("  data_dir: {data_dir}");
    info!("  partition: {partition}");
    info!("  workers: {workers}, max_attempts: {max_attempts}");
    info!("  mode: {}", if oneshot { "oneshot".to_string() } else { format!("sweep every {sweep_secs}s") });
    info!("  metrics: {}", metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    if oneshot {
        let summary = sweeper::sweep_once(&handle.engine, &CancellationToken::new()).await?;
        info!(
            reconcile_failed = summary.reconcile.failed.len(),
            hours_failed = summary.hours.failed.len(),
            "oneshot sweep done"
        );
    } else {
        // Graceful shutdown on SIGTERM/ctrl-c
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
        info!("shutdown signal received, stopping background tasks");
    }
    manager.shutdown();

    if let Some(path) = report_path {
        let rows = handle.engine.service_hour_report(None).await?;
        let file = std::fs::File::create(&path)?;
        let mut sink = JsonLinesSink::new(std::io::BufWriter::new(file));
        sink.write_rows(&rows)?;
        info!(rows = rows.len(), path = %path, "service-hour report written");
    }

    // Final compaction so the next start replays a snapshot
    if let Err(e) = handle.store.compact().await {
        tracing::warn!(error = %e, "final compaction failed");
    }

    info!("tutorhours stopped");
    Ok(())
}

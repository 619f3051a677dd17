use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Periodic expiration trigger: finalizes ended reservations and cancels
/// unconfirmed online payments. Runs one sweep immediately on start.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration, shutdown: CancellationToken) {
    info!("sweeper started, every {}s", every.as_secs());
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => break,
        }
        match engine.run_sweep().await {
            Ok(report) if report.finalized + report.payments_expired > 0 => {
                info!(
                    finalized = report.finalized,
                    payments_expired = report.payments_expired,
                    "sweep completed"
                );
            }
            Ok(_) => debug!("sweep: nothing to do"),
            // Next tick retries.
            Err(e) => warn!("sweep failed: {e}"),
        }
    }
    info!("sweeper stopped");
}

/// Rewrites the WAL once enough appends have piled up since the last compaction.
pub async fn run_compactor(
    engine: Arc<Engine>,
    threshold: u64,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => break,
        }
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}

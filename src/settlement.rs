use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{now_ms, Engine};

/// Background task that releases matured escrow entries on a fixed period.
pub async fn run_settlement(engine: Arc<Engine>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match engine.process_releases(now_ms()).await {
            Ok(released) if released.is_empty() => debug!("settlement: nothing to release"),
            Ok(released) => info!("settlement: released {} entries", released.len()),
            // Entries already flagged stay flagged; the next run picks up the rest.
            Err(e) => warn!("settlement run failed: {e}"),
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("WAL compacted after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}

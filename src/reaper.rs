use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const COMPACT_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that moves seats whose date has passed to the book's
/// elapsed status.
pub async fn run_sweeper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        match engine.sweep_elapsed().await {
            Ok(0) => {}
            Ok(swept) => info!(book = engine.policy().book.as_str(), swept, "elapsed bookings swept"),
            Err(e) => warn!(book = engine.policy().book.as_str(), "sweep failed: {e}"),
        }
    }
}

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    debug!(appends, threshold, "compacting WAL");
    match engine.compact_wal().await {
        Ok(()) => {
            info!(book = engine.policy().book.as_str(), appends, "WAL compacted");
            true
        }
        Err(e) => {
            warn!(book = engine.policy().book.as_str(), "compaction failed: {e}");
            false
        }
    }
}

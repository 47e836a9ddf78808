use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::engine::SchedulerEngine;

/// Drain the adjustment queue. Per-item failures are retried by the
/// queue's lease machinery; this loop never aborts the worker.
pub async fn run(engine: Arc<SchedulerEngine>) {
    let start = Instant::now();
    debug!("Starting adjustment drain cycle");

    let processed = engine.drain_adjustments().await;

    if processed > 0 {
        let status = engine.queue_status();
        info!(
            processed,
            high_pending = status.high_count,
            medium_pending = status.medium_count,
            low_pending = status.low_count,
            duration_secs = format!("{:.2}", start.elapsed().as_secs_f64()),
            "Adjustment drain completed"
        );
    }
}

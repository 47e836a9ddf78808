use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::engine::SchedulerEngine;
use crate::error::EngineError;

pub async fn run(engine: Arc<SchedulerEngine>) -> Result<(), EngineError> {
    let start = Instant::now();
    debug!("Starting overdue sweep cycle");

    let moved = engine.sweep_overdue().await?;

    if moved > 0 {
        info!(
            moved,
            duration_secs = format!("{:.2}", start.elapsed().as_secs_f64()),
            "Overdue sweep completed"
        );
    }

    Ok(())
}

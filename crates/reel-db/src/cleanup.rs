use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::LocalBackend;

/// Background task that sweeps expired messages and signals.
///
/// Runs on an interval until `cancel` fires. Each sweep publishes a delete
/// for every removed row so open listings drop them.
pub async fn run_cleanup_loop(backend: Arc<LocalBackend>, interval_secs: u64, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        match backend.cleanup_expired(Utc::now()).await {
            Ok(count) => {
                if count > 0 {
                    info!("Cleanup: pruned {} expired rows", count);
                }
            }
            Err(e) => {
                warn!("Cleanup error: {}", e);
            }
        }
    }

    info!("Cleanup loop stopped");
}

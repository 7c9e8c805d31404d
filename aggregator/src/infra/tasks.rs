//! Background tasks feeding the infra registry.

use super::MonitoredPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Spawn the pool-stats refresh and health-probe loops.
///
/// Both run until `shutdown` is cancelled; await the handles to join them.
pub fn spawn_pool_monitor(
    pool: Arc<MonitoredPool>,
    refresh_interval: Duration,
    health_interval: Duration,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let refresh = {
        let pool = pool.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(refresh_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => pool.refresh_metrics(),
                    _ = shutdown.cancelled() => break,
                }
            }
            debug!("pool refresh task stopped");
        })
    };

    let health = tokio::spawn(async move {
        let mut interval = tokio::time::interval(health_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    probe_health(&pool).await;
                }
                _ = shutdown.cancelled() => break,
            }
        }
        debug!("health probe task stopped");
    });

    vec![refresh, health]
}

/// Run one `SELECT 1` probe off the async runtime and record the outcome.
pub async fn probe_health(pool: &Arc<MonitoredPool>) -> bool {
    let was_healthy = pool.metrics().is_healthy();
    let probe = pool.clone();
    let start = Instant::now();
    let outcome = tokio::task::spawn_blocking(move || probe.ping()).await;
    let elapsed = start.elapsed();

    let healthy = match outcome {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            warn!(error = %e, "database health probe failed");
            false
        }
        Err(e) => {
            warn!(error = %e, "database health probe panicked");
            false
        }
    };
    pool.metrics().record_health(healthy, elapsed);
    if healthy && !was_healthy {
        info!(elapsed_ms = elapsed.as_millis() as u64, "database healthy");
    }
    healthy
}

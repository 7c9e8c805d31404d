//! r2d2 connection pool over SQLite, instrumented through [`InfraMetrics`].

use super::{InfraMetrics, PoolState};
use crate::config::DatabaseConfig;
use r2d2::event::{AcquireEvent, CheckoutEvent, ReleaseEvent, TimeoutEvent};
use r2d2::{HandleError, HandleEvent, Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

pub type PooledConn = PooledConnection<SqliteConnectionManager>;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

/// Forwards r2d2 lifecycle events to the infra hooks.
#[derive(Debug)]
struct PoolEvents {
    metrics: Arc<InfraMetrics>,
}

impl HandleEvent for PoolEvents {
    fn handle_acquire(&self, event: AcquireEvent) {
        debug!(connection = event.connection_id(), "database connection opened");
        self.metrics.on_connect();
    }

    fn handle_release(&self, event: ReleaseEvent) {
        debug!(connection = event.connection_id(), "database connection closed");
        self.metrics.on_remove();
    }

    fn handle_checkout(&self, event: CheckoutEvent) {
        self.metrics.on_acquire(event.duration());
    }

    fn handle_timeout(&self, event: TimeoutEvent) {
        warn!(timeout = ?event.timeout(), "timed out waiting for a database connection");
        self.metrics.on_connection_error();
    }
}

impl HandleError<rusqlite::Error> for PoolEvents {
    fn handle_error(&self, error: rusqlite::Error) {
        warn!(error = %error, "database connection error");
        self.metrics.on_connection_error();
    }
}

/// SQLite pool whose checkouts, queries and failures land in the infra registry.
#[derive(Debug)]
pub struct MonitoredPool {
    pool: Pool<SqliteConnectionManager>,
    metrics: Arc<InfraMetrics>,
    waiting: AtomicU32,
}

impl MonitoredPool {
    /// Open the pool and verify one connection.
    #[instrument(skip_all, fields(db_path = ?config.path, pool_size = config.max_size))]
    pub fn open(config: &DatabaseConfig, metrics: Arc<InfraMetrics>) -> Result<Self, PoolError> {
        let manager = SqliteConnectionManager::file(&config.path);
        let pool = Pool::builder()
            .max_size(config.max_size)
            .min_idle(Some(0))
            .connection_timeout(config.connection_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .event_handler(Box::new(PoolEvents {
                metrics: metrics.clone(),
            }))
            .error_handler(Box::new(PoolEvents {
                metrics: metrics.clone(),
            }))
            .build(manager)?;

        let pool = Self {
            pool,
            metrics,
            waiting: AtomicU32::new(0),
        };
        pool.ping()?;
        pool.refresh_metrics();
        info!("database pool ready");
        Ok(pool)
    }

    pub fn metrics(&self) -> &Arc<InfraMetrics> {
        &self.metrics
    }

    /// Check out a connection, counting the caller as waiting meanwhile.
    pub fn get(&self) -> Result<PooledConn, PoolError> {
        self.waiting.fetch_add(1, Ordering::Relaxed);
        let conn = self.pool.get();
        self.waiting.fetch_sub(1, Ordering::Relaxed);
        Ok(conn?)
    }

    /// Run `f` on a pooled connection, timing the query.
    pub fn query<T, F>(&self, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self.get()?;
        let start = Instant::now();
        let result = f(&*conn);
        self.metrics.record_query(start.elapsed());
        Ok(result?)
    }

    /// `SELECT 1` round trip; returns how long it took.
    pub fn ping(&self) -> Result<Duration, PoolError> {
        let start = Instant::now();
        self.query(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))?;
        Ok(start.elapsed())
    }

    pub fn state(&self) -> PoolState {
        let state = self.pool.state();
        PoolState {
            size: state.connections,
            idle: state.idle_connections,
            active: state.connections.saturating_sub(state.idle_connections),
            waiting: self.waiting.load(Ordering::Relaxed),
            max: self.pool.max_size(),
        }
    }

    pub fn refresh_metrics(&self) {
        self.metrics.record_pool_state(self.state());
    }
}

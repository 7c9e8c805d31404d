//! Infrastructure metrics.
//!
//! A second instantiation of [`Registry`] with the declared policy: every
//! instrument is built at startup and the registry is sealed. The database
//! pool feeds it through the hook methods on [`InfraMetrics`].

pub mod pool;
pub mod tasks;

pub use pool::{MonitoredPool, PoolError};
pub use tasks::spawn_pool_monitor;

use crate::registry::key::unscoped;
use crate::registry::{
    Declaration, InstrumentDescriptor, Labels, PrometheusSink, Registry, RegistryError, TypeConfig,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tally_shared::MetricKind;
use tracing::warn;

/// Key scope for infra instruments.
pub const INFRA_SCOPE: &str = "__infra__";

pub const QUERY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];
pub const ACQUIRE_BUCKETS: &[f64] = &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

pub const POOL_SIZE: &str = "db_pool_size";
pub const POOL_ACTIVE: &str = "db_pool_active";
pub const POOL_IDLE: &str = "db_pool_idle";
pub const POOL_WAITING: &str = "db_pool_waiting";
pub const POOL_MAX: &str = "db_pool_max";
pub const QUERY_DURATION: &str = "db_query_duration_seconds";
pub const QUERIES_TOTAL: &str = "db_queries_total";
pub const SLOW_QUERIES_TOTAL: &str = "db_slow_queries_total";
pub const CONNECTION_ERRORS_TOTAL: &str = "db_connection_errors_total";
pub const ACQUIRE_DURATION: &str = "db_connection_acquire_duration_seconds";
pub const HEALTH_STATUS: &str = "db_health_status";
pub const HEALTH_RESPONSE_TIME: &str = "db_health_response_time_seconds";

/// Point-in-time view of the connection pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolState {
    pub size: u32,
    pub idle: u32,
    pub active: u32,
    pub waiting: u32,
    pub max: u32,
}

fn declarations() -> Vec<Declaration> {
    let gauges = [
        (POOL_SIZE, "Open connections in the database pool"),
        (POOL_ACTIVE, "Connections checked out of the pool"),
        (POOL_IDLE, "Idle connections in the pool"),
        (POOL_WAITING, "Callers waiting for a pool connection"),
        (POOL_MAX, "Configured pool capacity"),
        (HEALTH_STATUS, "1 if the last database health probe succeeded"),
        (HEALTH_RESPONSE_TIME, "Duration of the last database health probe"),
    ];
    let counters = [
        (QUERIES_TOTAL, "Database queries executed"),
        (SLOW_QUERIES_TOTAL, "Database queries slower than the configured threshold"),
        (CONNECTION_ERRORS_TOTAL, "Database connection failures and acquire timeouts"),
    ];
    let histograms = [
        (QUERY_DURATION, "Database query latency", QUERY_BUCKETS),
        (ACQUIRE_DURATION, "Time spent waiting for a pool connection", ACQUIRE_BUCKETS),
    ];

    let declare = |name: &str, help: &str, kind, config: &TypeConfig| Declaration {
        key: unscoped(INFRA_SCOPE, name),
        descriptor: InstrumentDescriptor::new(name, help, kind, BTreeSet::new(), config),
    };
    let defaults = TypeConfig::default();

    let mut out = Vec::new();
    out.extend(gauges.iter().map(|&(n, h)| declare(n, h, MetricKind::Gauge, &defaults)));
    out.extend(counters.iter().map(|&(n, h)| declare(n, h, MetricKind::Counter, &defaults)));
    out.extend(histograms.iter().map(|&(n, h, buckets)| {
        let config = TypeConfig {
            histogram_buckets: buckets.to_vec(),
            ..TypeConfig::default()
        };
        declare(n, h, MetricKind::Histogram, &config)
    }));
    out
}

/// Sealed infra registry plus the hooks that feed it.
#[derive(Debug)]
pub struct InfraMetrics {
    registry: Arc<Registry>,
    slow_query_threshold: Duration,
    connections: AtomicU32,
    healthy: AtomicBool,
}

impl InfraMetrics {
    pub fn new(slow_query_threshold: Duration) -> Result<Self, RegistryError> {
        let registry = Registry::declared(Arc::new(PrometheusSink::default()), declarations())?;
        let metrics = Self {
            registry: Arc::new(registry),
            slow_query_threshold,
            connections: AtomicU32::new(0),
            healthy: AtomicBool::new(false),
        };
        metrics.record_pool_state(PoolState::default());
        metrics.record(HEALTH_STATUS, 0.0);
        Ok(metrics)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Outcome of the most recent health probe. False until the first probe.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// A new physical connection was opened.
    pub fn on_connect(&self) {
        let open = self.connections.fetch_add(1, Ordering::Relaxed) + 1;
        self.record(POOL_SIZE, open as f64);
    }

    /// A physical connection was closed.
    pub fn on_remove(&self) {
        let open = self
            .connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)))
            .map_or(0, |prev| prev.saturating_sub(1));
        self.record(POOL_SIZE, open as f64);
    }

    /// A caller obtained a connection after waiting `wait`.
    pub fn on_acquire(&self, wait: Duration) {
        self.record(ACQUIRE_DURATION, wait.as_secs_f64());
    }

    pub fn on_connection_error(&self) {
        self.record(CONNECTION_ERRORS_TOTAL, 1.0);
    }

    pub fn record_query(&self, elapsed: Duration) {
        self.record(QUERY_DURATION, elapsed.as_secs_f64());
        self.record(QUERIES_TOTAL, 1.0);
        if elapsed > self.slow_query_threshold {
            self.record(SLOW_QUERIES_TOTAL, 1.0);
        }
    }

    pub fn record_pool_state(&self, state: PoolState) {
        self.connections.store(state.size, Ordering::Relaxed);
        self.record(POOL_SIZE, state.size as f64);
        self.record(POOL_ACTIVE, state.active as f64);
        self.record(POOL_IDLE, state.idle as f64);
        self.record(POOL_WAITING, state.waiting as f64);
        self.record(POOL_MAX, state.max as f64);
    }

    pub fn record_health(&self, healthy: bool, elapsed: Duration) {
        self.healthy.store(healthy, Ordering::Relaxed);
        self.record(HEALTH_STATUS, if healthy { 1.0 } else { 0.0 });
        self.record(HEALTH_RESPONSE_TIME, elapsed.as_secs_f64());
    }

    /// Apply `value` to a declared instrument: set, increment or observe
    /// depending on its kind.
    fn record(&self, name: &str, value: f64) {
        let Some(instrument) = self.registry.get(&unscoped(INFRA_SCOPE, name)) else {
            warn!(name, "infra instrument not declared");
            return;
        };
        if let Err(e) = instrument.apply(value, &Labels::new()) {
            warn!(name, error = %e, "failed to record infra metric");
        }
    }
}

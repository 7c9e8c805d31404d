//! Tally aggregator service
//!
//! Accepts tenant metric batches on `POST /metrics` and serves the merged
//! exposition on `GET /metrics`. With a `[database]` section configured,
//! API keys are also looked up in SQLite and pool health is exported.

use anyhow::{Context, Result};
use std::sync::Arc;
use tally_aggregator::{
    config::{AggregatorConfig, LogFormat},
    infra::{self, InfraMetrics, MonitoredPool},
    ingest::IngestionPipeline,
    metrics,
    registry::{PrometheusSink, Registry},
    render::Renderer,
    server::{self, AppState, FirstMatch, PooledKeys, StaticKeys, TenantAuthenticator},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AggregatorConfig::load().context("Failed to load configuration")?;
    init_tracing(config.log_format);
    metrics::init();

    let addr = config.socket_addr().context("Invalid listen address")?;
    info!("Starting Tally aggregator on {}", addr);

    let slow_query = config
        .database
        .as_ref()
        .map(|db| db.slow_query_threshold())
        .unwrap_or_default();
    let infra_metrics =
        Arc::new(InfraMetrics::new(slow_query).context("Failed to declare infra metrics")?);

    let sink = Arc::new(PrometheusSink::new(config.registry.summary_max_samples));
    let tenants = Arc::new(Registry::new(sink));
    let pipeline = IngestionPipeline::new(tenants.clone(), config.registry.type_config());
    let renderer = Renderer::new(tenants, infra_metrics.registry().clone());

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    let static_keys = Arc::new(StaticKeys::new(&config.api_keys));
    let mut authenticator = FirstMatch::new().with(static_keys.clone());
    let mut readiness = None;

    if let Some(db) = &config.database {
        let pool = {
            let db = db.clone();
            let metrics = infra_metrics.clone();
            tokio::task::spawn_blocking(move || MonitoredPool::open(&db, metrics))
                .await
                .context("Database pool task failed")?
                .context("Failed to open database pool")?
        };
        let pool = Arc::new(pool);
        info!(path = ?db.path, "Database pool opened");

        tasks.extend(infra::spawn_pool_monitor(
            pool.clone(),
            db.pool_refresh_interval(),
            db.health_interval(),
            shutdown.clone(),
        ));
        authenticator = authenticator.with(Arc::new(PooledKeys::new(pool)));
        readiness = Some(infra_metrics.clone());
    } else if static_keys.is_empty() {
        warn!("No API keys configured; every ingest request will be rejected");
    }

    let authenticator: Arc<dyn TenantAuthenticator> = Arc::new(authenticator);
    let mut state = AppState::new(pipeline, renderer, authenticator, config.max_body_bytes);
    if let Some(infra) = readiness {
        state = state.with_readiness(infra);
    }

    let (_, server) = server::bind(addr, Arc::new(state), shutdown.clone())
        .context("Failed to bind HTTP listener")?;
    let server = tokio::spawn(server);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    shutdown.cancel();

    server
        .await
        .context("HTTP server task failed")?
        .context("HTTP server error")?;
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "background task failed");
        }
    }
    info!("Aggregator stopped");
    Ok(())
}

//! HTTP surface: tenant ingestion, scrape endpoint, health probes.
//!
//! ```text
//! POST /metrics   authenticated batch ingest (JSON)
//! GET  /metrics   Prometheus text exposition
//! GET  /healthz   liveness
//! GET  /readyz    readiness (database health when a pool is configured)
//! ```

use super::auth::{self, AuthError, TenantAuthenticator};
use crate::audit;
use crate::infra::InfraMetrics;
use crate::ingest::{IngestError, IngestionPipeline, TenantId, ValidationError};
use crate::metrics;
use crate::render::{self, Renderer};
use hyper::body::HttpBody;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tally_shared::{ErrorResponse, IngestRequest, IngestResponse};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const JSON: &str = "application/json";
const PLAIN: &str = "text/plain; charset=utf-8";
const RENDER_FAILURE_BODY: &str = "# Error generating metrics\n";

/// Everything a request handler needs.
pub struct AppState {
    pipeline: IngestionPipeline,
    renderer: Renderer,
    authenticator: Arc<dyn TenantAuthenticator>,
    max_body_bytes: usize,
    /// Set when a database pool is configured; gates `/readyz`.
    readiness: Option<Arc<InfraMetrics>>,
}

impl AppState {
    pub fn new(
        pipeline: IngestionPipeline,
        renderer: Renderer,
        authenticator: Arc<dyn TenantAuthenticator>,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            pipeline,
            renderer,
            authenticator,
            max_body_bytes,
            readiness: None,
        }
    }

    pub fn with_readiness(mut self, infra: Arc<InfraMetrics>) -> Self {
        self.readiness = Some(infra);
        self
    }

    pub fn is_ready(&self) -> bool {
        self.readiness.as_ref().map_or(true, |infra| infra.is_healthy())
    }
}

/// Bind `addr` and return the bound address plus the server future, which
/// resolves after `shutdown` is cancelled and in-flight requests finish.
pub fn bind(
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> Result<(SocketAddr, impl Future<Output = Result<(), hyper::Error>>), hyper::Error> {
    let make_svc = make_service_fn(move |_| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(handle(req, &state).await) }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    let local_addr = server.local_addr();
    info!("HTTP server listening on {}", local_addr);
    let server = server.with_graceful_shutdown(async move { shutdown.cancelled().await });
    Ok((local_addr, server))
}

pub async fn handle(req: Request<Body>, state: &AppState) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        (&Method::POST, "/metrics") => ingest(req, state).await,
        (&Method::GET, "/metrics") => scrape(state),
        (&Method::GET, "/healthz") => text(StatusCode::OK, PLAIN, "ok\n"),
        (&Method::GET, "/readyz") => {
            if state.is_ready() {
                text(StatusCode::OK, PLAIN, "ready\n")
            } else {
                text(StatusCode::SERVICE_UNAVAILABLE, PLAIN, "not ready\n")
            }
        }
        _ => text(StatusCode::NOT_FOUND, PLAIN, "not found\n"),
    }
}

async fn ingest(req: Request<Body>, state: &AppState) -> Response<Body> {
    let tenant = match auth::authenticate(state.authenticator.as_ref(), req.headers()).await {
        Ok(tenant) => tenant,
        Err(e) => {
            let status = match e {
                AuthError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::UNAUTHORIZED,
            };
            metrics::record_request(status.as_u16());
            return json(status, &ErrorResponse::new(e.to_string()));
        }
    };

    let (status, response) = match ingest_body(req, state, &tenant).await {
        Ok(body) => (StatusCode::OK, json(StatusCode::OK, &body)),
        Err((status, body)) => (status, json(status, &body)),
    };
    metrics::record_request(status.as_u16());
    response
}

async fn ingest_body(
    req: Request<Body>,
    state: &AppState,
    tenant: &TenantId,
) -> Result<IngestResponse, (StatusCode, ErrorResponse)> {
    let too_large = || {
        (
            StatusCode::PAYLOAD_TOO_LARGE,
            ErrorResponse::new(format!("request body exceeds {} bytes", state.max_body_bytes)),
        )
    };

    let declared = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.map_or(false, |len| len > state.max_body_bytes) {
        return Err(too_large());
    }

    let bytes = match read_limited(req.into_body(), state.max_body_bytes).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Err(too_large()),
        Err(e) => {
            return Err((
                StatusCode::BAD_REQUEST,
                ErrorResponse::new(format!("failed to read request body: {}", e)),
            ))
        }
    };

    let request: IngestRequest = serde_json::from_slice(&bytes).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            ErrorResponse::new(format!("invalid JSON body: {}", e)),
        )
    })?;
    let Some(batch) = request.metrics else {
        return Err((
            StatusCode::BAD_REQUEST,
            ErrorResponse::new("request body must contain a metrics array"),
        ));
    };

    let report = match state.pipeline.ingest(tenant, &batch) {
        Ok(report) => report,
        Err(IngestError::Validation(e)) => {
            audit::ingest_batch(tenant.as_str(), 0, batch.len(), 400);
            let body = match e {
                ValidationError::NoValidSamples(details) => {
                    ErrorResponse::new("no valid metrics in batch").with_details(details)
                }
                other => ErrorResponse::new(other.to_string()),
            };
            return Err((StatusCode::BAD_REQUEST, body));
        }
    };

    if report.processed == 0 {
        audit::ingest_batch(tenant.as_str(), 0, report.total, 400);
        return Err((
            StatusCode::BAD_REQUEST,
            ErrorResponse::new("no valid metrics in batch").with_details(report.errors),
        ));
    }

    audit::ingest_batch(tenant.as_str(), report.processed, report.total, 200);
    Ok(report.into())
}

/// Collect the body, or `None` once it grows past `limit`.
async fn read_limited(mut body: Body, limit: usize) -> Result<Option<Vec<u8>>, hyper::Error> {
    let mut buf = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        if buf.len() + chunk.len() > limit {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(Some(buf))
}

fn scrape(state: &AppState) -> Response<Body> {
    match state.renderer.render() {
        Ok(body) => {
            audit::scrape_request(200, body.len());
            text(StatusCode::OK, render::CONTENT_TYPE, body)
        }
        Err(e) => {
            error!(error = %e, "failed to render metrics");
            audit::scrape_request(500, 0);
            text(StatusCode::INTERNAL_SERVER_ERROR, PLAIN, RENDER_FAILURE_BODY)
        }
    }
}

fn text(status: StatusCode, content_type: &'static str, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    match serde_json::to_vec(body) {
        Ok(bytes) => text(status, JSON, bytes),
        Err(e) => {
            error!(error = %e, "failed to serialize response");
            text(StatusCode::INTERNAL_SERVER_ERROR, PLAIN, "internal error\n")
        }
    }
}

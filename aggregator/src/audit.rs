//! Audit logging for security and operational events.
//!
//! All events are emitted via `tracing` with a dedicated target so they can be
//! filtered and formatted (e.g. JSON) for audit pipelines.

use tracing::{info, warn};

pub const AUDIT_TARGET: &str = "tally::audit";

/// Log a credential that resolved to a tenant.
pub fn ingest_auth_success(tenant: &str) {
    info!(
        target: AUDIT_TARGET,
        event = "ingest_auth_success",
        result = "ok",
        tenant = %tenant,
    );
}

/// Log a rejected ingest credential. Never logs the credential itself.
pub fn ingest_auth_failure(reason: &str) {
    warn!(
        target: AUDIT_TARGET,
        event = "ingest_auth_failure",
        result = "denied",
        reason = %reason,
    );
}

/// Log the outcome of one ingest batch.
pub fn ingest_batch(tenant: &str, processed: usize, total: usize, status: u16) {
    info!(
        target: AUDIT_TARGET,
        event = "ingest_batch",
        tenant = %tenant,
        processed,
        total,
        status,
    );
}

/// Log a scrape of the exposition endpoint.
pub fn scrape_request(status: u16, bytes: usize) {
    info!(
        target: AUDIT_TARGET,
        event = "scrape_request",
        status = %status,
        bytes,
    );
}

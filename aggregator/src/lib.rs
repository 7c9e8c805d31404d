//! Multi-tenant metric ingestion and exposition.
//!
//! Tenants push named samples over HTTP; the [`registry`] turns them into
//! typed, label-stable instruments and the [`render`] module exposes every
//! instrument in the Prometheus text format. A second, sealed registry in
//! [`infra`] carries database pool health.

pub mod audit;
pub mod config;
pub mod infra;
pub mod ingest;
pub mod metrics;
pub mod registry;
pub mod render;
pub mod server;

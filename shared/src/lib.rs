//! Shared types and utilities for Tally
//!
//! This crate contains the ingestion wire format, the metric kind
//! vocabulary, and small helpers used by both the aggregator service and
//! the command-line client.

pub mod protocol;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use protocol::wire::{ErrorResponse, IngestRequest, IngestResponse, RawSample, SampleError};
pub use types::kind::MetricKind;

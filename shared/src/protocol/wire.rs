//! JSON bodies for the ingestion endpoint.
//!
//! The `metrics` array is kept as raw JSON values. Each element is decoded
//! by the aggregator's validator, so a malformed entry (wrong field type,
//! `null`, not an object) surfaces as a per-sample rejection instead of
//! failing deserialization of the whole batch. [`RawSample`] is the typed
//! form clients use to build entries.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Maximum number of samples accepted in one `POST /metrics` body.
pub const MAX_BATCH_SIZE: usize = 100;

/// Request body of `POST /metrics`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestRequest {
    /// `None` when the field is missing entirely.
    #[serde(default)]
    pub metrics: Option<Vec<Value>>,
}

impl IngestRequest {
    pub fn new(metrics: Vec<RawSample>) -> Self {
        Self {
            metrics: Some(metrics.into_iter().map(Value::from).collect()),
        }
    }
}

/// One measurement as submitted by a client, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    #[serde(default)]
    pub name: String,

    /// Metric type as sent by the client (`counter`, `gauge`, ...).
    #[serde(rename = "type", default)]
    pub kind: String,

    /// A JSON number, or a string holding one.
    #[serde(default)]
    pub value: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

impl RawSample {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            value: value.into(),
            labels: None,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }
}

impl From<RawSample> for Value {
    fn from(sample: RawSample) -> Self {
        let mut fields = Map::new();
        fields.insert("name".into(), Value::String(sample.name));
        fields.insert("type".into(), Value::String(sample.kind));
        fields.insert("value".into(), sample.value);
        if let Some(labels) = sample.labels {
            let labels = labels
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect();
            fields.insert("labels".into(), Value::Object(labels));
        }
        Value::Object(fields)
    }
}

/// A rejected sample: its position in the submitted array and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleError {
    pub index: usize,
    pub reason: String,
}

/// Success body of `POST /metrics`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestResponse {
    pub processed: usize,
    pub total: usize,
    /// Present only when part of the batch was rejected.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<SampleError>,
}

/// Error body returned with 4xx statuses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<SampleError>>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Vec<SampleError>) -> Self {
        self.details = Some(details);
        self
    }
}

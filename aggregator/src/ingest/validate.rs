//! Batch and per-sample validation.
//!
//! Batch shape is checked first and fails the whole request. Samples are
//! then decoded from raw JSON and checked one by one; each rule
//! short-circuits to a rejection with a reason, and the batch is
//! partitioned into accepted and rejected.

use crate::registry::Labels;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tally_shared::protocol::wire::MAX_BATCH_SIZE;
use tally_shared::{MetricKind, SampleError};

static METRIC_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z_:][a-zA-Z0-9_:]*$").unwrap());
static LABEL_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").unwrap());

/// A sample that passed validation. `index` is its position in the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub index: usize,
    pub name: String,
    pub kind: MetricKind,
    pub value: f64,
    pub labels: Labels,
}

#[derive(Debug, Default)]
pub struct Validated {
    pub accepted: Vec<Sample>,
    pub rejected: Vec<SampleError>,
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("metrics array must not be empty")]
    EmptyBatch,

    #[error("batch of {0} metrics exceeds the limit of {max}", max = MAX_BATCH_SIZE)]
    BatchTooLarge(usize),

    #[error("all metrics failed validation")]
    NoValidSamples(Vec<SampleError>),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("value is missing")]
    Missing,

    #[error("{0:?} is not a number")]
    NotANumber(String),

    #[error("value must be finite")]
    NonFinite,

    #[error("value must be a number or numeric string, got {0}")]
    WrongType(&'static str),
}

/// Why a single sample was rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Rejection {
    #[error("metric entry must be an object, got {0}")]
    NotAnObject(&'static str),

    #[error("field {field:?} must be {expected}, got {found}")]
    FieldType {
        field: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    #[error("metric name is required")]
    MissingName,

    #[error("invalid metric type {0:?}, expected counter, gauge, histogram or summary")]
    UnknownKind(String),

    #[error("invalid metric value: {0}")]
    InvalidValue(#[from] ParseError),

    #[error("counter value must be non-negative, got {0}")]
    NegativeCounter(f64),

    #[error("invalid metric name {0:?}")]
    InvalidName(String),

    #[error("invalid label name {0:?}")]
    InvalidLabelName(String),

    #[error("label {0:?} must have a string value")]
    InvalidLabelValue(String),
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A string field; missing and `null` read as empty.
fn string_field<'a>(fields: &'a Map<String, Value>, field: &'static str) -> Result<&'a str, Rejection> {
    match fields.get(field) {
        None | Some(Value::Null) => Ok(""),
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(other) => Err(Rejection::FieldType {
            field,
            expected: "a string",
            found: json_type(other),
        }),
    }
}

fn labels_field(fields: &Map<String, Value>) -> Result<Labels, Rejection> {
    let entries = match fields.get("labels") {
        None | Some(Value::Null) => return Ok(Labels::new()),
        Some(Value::Object(entries)) => entries,
        Some(other) => {
            return Err(Rejection::FieldType {
                field: "labels",
                expected: "an object",
                found: json_type(other),
            })
        }
    };

    let mut labels = Labels::new();
    for (name, value) in entries {
        if !LABEL_NAME.is_match(name) || name.starts_with("__") {
            return Err(Rejection::InvalidLabelName(name.clone()));
        }
        let Value::String(value) = value else {
            return Err(Rejection::InvalidLabelValue(name.clone()));
        };
        labels.insert(name.clone(), value.clone());
    }
    Ok(labels)
}

/// Interpret a raw JSON value as a finite float.
///
/// Numbers are taken as-is; strings must contain nothing but a float after
/// trimming. This is the only place raw values are coerced.
pub fn parse_value(raw: &Value) -> Result<f64, ParseError> {
    let value = match raw {
        Value::Null => return Err(ParseError::Missing),
        Value::Number(n) => n.as_f64().ok_or_else(|| ParseError::NotANumber(n.to_string()))?,
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| ParseError::NotANumber(s.clone()))?,
        other => return Err(ParseError::WrongType(json_type(other))),
    };
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ParseError::NonFinite)
    }
}

/// Decode and check one sample, in rule order.
pub fn validate_sample(index: usize, raw: &Value) -> Result<Sample, Rejection> {
    let Value::Object(fields) = raw else {
        return Err(Rejection::NotAnObject(json_type(raw)));
    };

    let name = string_field(fields, "name")?;
    if name.is_empty() {
        return Err(Rejection::MissingName);
    }
    let kind_text = string_field(fields, "type")?;
    let kind: MetricKind = kind_text
        .parse()
        .map_err(|_| Rejection::UnknownKind(kind_text.to_string()))?;
    let value = parse_value(fields.get("value").unwrap_or(&Value::Null))?;
    if kind == MetricKind::Counter && value < 0.0 {
        return Err(Rejection::NegativeCounter(value));
    }
    if !METRIC_NAME.is_match(name) {
        return Err(Rejection::InvalidName(name.to_string()));
    }
    let labels = labels_field(fields)?;

    Ok(Sample {
        index,
        name: name.to_string(),
        kind,
        value,
        labels,
    })
}

/// Validate a whole batch. Fails only on batch shape or when nothing is accepted.
pub fn validate(batch: &[Value]) -> Result<Validated, ValidationError> {
    if batch.is_empty() {
        return Err(ValidationError::EmptyBatch);
    }
    if batch.len() > MAX_BATCH_SIZE {
        return Err(ValidationError::BatchTooLarge(batch.len()));
    }

    let mut out = Validated::default();
    for (index, raw) in batch.iter().enumerate() {
        match validate_sample(index, raw) {
            Ok(sample) => out.accepted.push(sample),
            Err(reason) => out.rejected.push(SampleError {
                index,
                reason: reason.to_string(),
            }),
        }
    }

    if out.accepted.is_empty() {
        return Err(ValidationError::NoValidSamples(out.rejected));
    }
    Ok(out)
}

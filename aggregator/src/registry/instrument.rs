//! Instrument descriptors and the per-kind apply semantics.

use super::sink::SinkError;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tally_shared::MetricKind;

/// Label values of one observation, keyed by label name.
pub type Labels = BTreeMap<String, String>;

/// Default quantiles for summaries, matching the usual client-library set.
pub const DEFAULT_QUANTILES: &[f64] = &[0.01, 0.05, 0.5, 0.9, 0.95, 0.99, 0.999];

/// Kind-specific construction parameters used when an instrument is created.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeConfig {
    pub histogram_buckets: Vec<f64>,
    pub summary_quantiles: Vec<f64>,
}

impl Default for TypeConfig {
    fn default() -> Self {
        Self {
            histogram_buckets: prometheus::DEFAULT_BUCKETS.to_vec(),
            summary_quantiles: DEFAULT_QUANTILES.to_vec(),
        }
    }
}

/// Immutable shape of an instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentDescriptor {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    pub label_names: BTreeSet<String>,
    /// Histogram only.
    pub bucket_bounds: Option<Vec<f64>>,
    /// Summary only.
    pub quantiles: Option<Vec<f64>>,
}

impl InstrumentDescriptor {
    pub fn new(
        name: impl Into<String>,
        help: impl Into<String>,
        kind: MetricKind,
        label_names: BTreeSet<String>,
        config: &TypeConfig,
    ) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            kind,
            label_names,
            bucket_bounds: (kind == MetricKind::Histogram).then(|| config.histogram_buckets.clone()),
            quantiles: (kind == MetricKind::Summary).then(|| config.summary_quantiles.clone()),
        }
    }

    /// Label names in exposition order.
    pub fn label_name_refs(&self) -> Vec<&str> {
        self.label_names.iter().map(String::as_str).collect()
    }
}

pub trait CounterHandle: Send + Sync {
    fn inc_by(&self, labels: &Labels, delta: f64) -> Result<(), SinkError>;
}

pub trait GaugeHandle: Send + Sync {
    fn set(&self, labels: &Labels, value: f64) -> Result<(), SinkError>;
}

/// Shared by histograms and summaries.
pub trait ObserveHandle: Send + Sync {
    fn observe(&self, labels: &Labels, value: f64) -> Result<(), SinkError>;
}

/// Sink-backed handle, one variant per metric semantic.
#[derive(Clone)]
pub enum Handle {
    Counter(Arc<dyn CounterHandle>),
    Gauge(Arc<dyn GaugeHandle>),
    Histogram(Arc<dyn ObserveHandle>),
    Summary(Arc<dyn ObserveHandle>),
}

impl Handle {
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Gauge(_) => MetricKind::Gauge,
            Self::Histogram(_) => MetricKind::Histogram,
            Self::Summary(_) => MetricKind::Summary,
        }
    }

    fn apply(&self, value: f64, labels: &Labels) -> Result<(), InstrumentError> {
        match self {
            Self::Counter(counter) => {
                if value < 0.0 {
                    return Err(InstrumentError::NegativeCounter(value));
                }
                // A zero delta is accepted but leaves the counter untouched.
                if value > 0.0 {
                    counter.inc_by(labels, value)?;
                }
            }
            Self::Gauge(gauge) => gauge.set(labels, value)?,
            Self::Histogram(observer) | Self::Summary(observer) => observer.observe(labels, value)?,
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InstrumentError {
    #[error("counter cannot be decremented (delta {0})")]
    NegativeCounter(f64),

    #[error("value must be a finite number")]
    NonFinite,

    #[error("labels {got:?} do not match the instrument's labels {expected:?}")]
    LabelMismatch {
        expected: Vec<String>,
        got: Vec<String>,
    },

    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// A live instrument: its descriptor plus the aggregation handle.
pub struct Instrument {
    descriptor: InstrumentDescriptor,
    handle: Handle,
}

impl std::fmt::Debug for Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrument")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl Instrument {
    pub(crate) fn new(descriptor: InstrumentDescriptor, handle: Handle) -> Self {
        debug_assert_eq!(descriptor.kind, handle.kind());
        Self { descriptor, handle }
    }

    pub fn descriptor(&self) -> &InstrumentDescriptor {
        &self.descriptor
    }

    pub fn kind(&self) -> MetricKind {
        self.descriptor.kind
    }

    /// Fold one value into the instrument.
    ///
    /// Counters refuse negative deltas here as well as in the validator, so
    /// callers that bypass validation (infra hooks, tests) cannot corrupt
    /// monotonicity.
    pub fn apply(&self, value: f64, labels: &Labels) -> Result<(), InstrumentError> {
        if !value.is_finite() {
            return Err(InstrumentError::NonFinite);
        }
        if !labels.keys().eq(self.descriptor.label_names.iter()) {
            return Err(InstrumentError::LabelMismatch {
                expected: self.descriptor.label_names.iter().cloned().collect(),
                got: labels.keys().cloned().collect(),
            });
        }
        self.handle.apply(value, labels)
    }
}

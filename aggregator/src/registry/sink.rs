//! Exposition-library seam.
//!
//! The registry asks a [`MetricSink`] to build instruments and later to
//! gather their state. [`PrometheusSink`] is the production implementation
//! on top of the `prometheus` crate; tests substitute a recording fake.

use super::instrument::{CounterHandle, GaugeHandle, InstrumentDescriptor, Labels, ObserveHandle};
use super::summary::SummaryVec;
use crate::render::{self, RenderError};
use prometheus::core::Collector;
use prometheus::proto::MetricFamily;
use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Observations kept per summary child for quantile estimation.
pub const DEFAULT_SUMMARY_WINDOW: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error(transparent)]
    Prometheus(#[from] prometheus::Error),

    #[error("{0}")]
    Rejected(String),
}

/// Builds instruments and snapshots their state for exposition.
pub trait MetricSink: Send + Sync {
    fn make_counter(&self, descriptor: &InstrumentDescriptor) -> Result<Arc<dyn CounterHandle>, SinkError>;

    fn make_gauge(&self, descriptor: &InstrumentDescriptor) -> Result<Arc<dyn GaugeHandle>, SinkError>;

    fn make_histogram(&self, descriptor: &InstrumentDescriptor) -> Result<Arc<dyn ObserveHandle>, SinkError>;

    fn make_summary(&self, descriptor: &InstrumentDescriptor) -> Result<Arc<dyn ObserveHandle>, SinkError>;

    /// Snapshot every instrument built by this sink.
    fn gather(&self) -> Vec<MetricFamily>;

    /// Gather and encode as exposition text.
    fn render_all(&self) -> Result<String, RenderError> {
        render::encode(&render::merge_families(self.gather()))
    }
}

/// [`MetricSink`] backed by `prometheus` metric vectors.
///
/// Instruments are not registered on a `prometheus::Registry`: the same
/// metric name legitimately appears with different label-name sets (one
/// instrument per tenant and label set), which a registry would refuse.
/// The sink keeps its own collector list and the renderer merges families
/// by name.
pub struct PrometheusSink {
    summary_max_samples: usize,
    collectors: RwLock<Vec<Box<dyn Collector>>>,
}

impl Default for PrometheusSink {
    fn default() -> Self {
        Self::new(DEFAULT_SUMMARY_WINDOW)
    }
}

impl std::fmt::Debug for PrometheusSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusSink")
            .field("summary_max_samples", &self.summary_max_samples)
            .field("collectors", &self.len())
            .finish()
    }
}

impl PrometheusSink {
    pub fn new(summary_max_samples: usize) -> Self {
        Self {
            summary_max_samples,
            collectors: RwLock::new(Vec::new()),
        }
    }

    /// Number of instruments built so far.
    pub fn len(&self) -> usize {
        self.collectors.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn track<C: Collector + Clone + 'static>(&self, collector: &C) {
        self.collectors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(collector.clone()));
    }
}

impl MetricSink for PrometheusSink {
    fn make_counter(&self, descriptor: &InstrumentDescriptor) -> Result<Arc<dyn CounterHandle>, SinkError> {
        let vec = CounterVec::new(
            Opts::new(descriptor.name.as_str(), descriptor.help.as_str()),
            &descriptor.label_name_refs(),
        )?;
        self.track(&vec);
        Ok(Arc::new(vec))
    }

    fn make_gauge(&self, descriptor: &InstrumentDescriptor) -> Result<Arc<dyn GaugeHandle>, SinkError> {
        let vec = GaugeVec::new(
            Opts::new(descriptor.name.as_str(), descriptor.help.as_str()),
            &descriptor.label_name_refs(),
        )?;
        self.track(&vec);
        Ok(Arc::new(vec))
    }

    fn make_histogram(&self, descriptor: &InstrumentDescriptor) -> Result<Arc<dyn ObserveHandle>, SinkError> {
        let mut opts = HistogramOpts::new(descriptor.name.as_str(), descriptor.help.as_str());
        if let Some(buckets) = &descriptor.bucket_bounds {
            opts = opts.buckets(buckets.clone());
        }
        let vec = HistogramVec::new(opts, &descriptor.label_name_refs())?;
        self.track(&vec);
        Ok(Arc::new(vec))
    }

    fn make_summary(&self, descriptor: &InstrumentDescriptor) -> Result<Arc<dyn ObserveHandle>, SinkError> {
        let quantiles = descriptor
            .quantiles
            .as_deref()
            .unwrap_or(super::instrument::DEFAULT_QUANTILES);
        let vec = SummaryVec::new(
            &descriptor.name,
            &descriptor.help,
            &descriptor.label_name_refs(),
            quantiles,
            self.summary_max_samples,
        )?;
        self.track(&vec);
        Ok(Arc::new(vec))
    }

    fn gather(&self) -> Vec<MetricFamily> {
        self.collectors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .flat_map(|c| c.collect())
            .collect()
    }
}

fn label_map(labels: &Labels) -> HashMap<&str, &str> {
    labels.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
}

impl CounterHandle for CounterVec {
    fn inc_by(&self, labels: &Labels, delta: f64) -> Result<(), SinkError> {
        self.get_metric_with(&label_map(labels))?.inc_by(delta);
        Ok(())
    }
}

impl GaugeHandle for GaugeVec {
    fn set(&self, labels: &Labels, value: f64) -> Result<(), SinkError> {
        self.get_metric_with(&label_map(labels))?.set(value);
        Ok(())
    }
}

impl ObserveHandle for HistogramVec {
    fn observe(&self, labels: &Labels, value: f64) -> Result<(), SinkError> {
        self.get_metric_with(&label_map(labels))?.observe(value);
        Ok(())
    }
}

impl ObserveHandle for SummaryVec {
    fn observe(&self, labels: &Labels, value: f64) -> Result<(), SinkError> {
        self.observe_with(labels, value)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::instrument::TypeConfig;
    use prometheus::proto::MetricType;
    use std::collections::BTreeSet;
    use tally_shared::MetricKind;

    fn descriptor(name: &str, kind: MetricKind, labels: &[&str]) -> InstrumentDescriptor {
        InstrumentDescriptor::new(
            name,
            format!("help for {}", name),
            kind,
            labels.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            &TypeConfig::default(),
        )
    }

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_same_name_with_different_label_names() {
        let sink = PrometheusSink::default();
        let a = sink
            .make_counter(&descriptor("hits", MetricKind::Counter, &["method", "user_id"]))
            .unwrap();
        let b = sink
            .make_counter(&descriptor("hits", MetricKind::Counter, &["path", "user_id"]))
            .unwrap();
        a.inc_by(&labels(&[("method", "GET"), ("user_id", "1")]), 1.0).unwrap();
        b.inc_by(&labels(&[("path", "/"), ("user_id", "1")]), 2.0).unwrap();

        let families = sink.gather();
        assert_eq!(families.len(), 2);
        assert!(families.iter().all(|f| f.get_name() == "hits"));
        assert!(families.iter().all(|f| f.get_field_type() == MetricType::COUNTER));
    }

    #[test]
    fn test_label_mismatch_is_an_error() {
        let sink = PrometheusSink::default();
        let gauge = sink
            .make_gauge(&descriptor("temp", MetricKind::Gauge, &["room"]))
            .unwrap();
        assert!(gauge.set(&labels(&[("floor", "1")]), 21.0).is_err());
        assert!(gauge.set(&labels(&[("room", "a")]), 21.0).is_ok());
    }

    #[test]
    fn test_invalid_metric_name_is_refused() {
        let sink = PrometheusSink::default();
        let err = sink.make_counter(&descriptor("1bad-name", MetricKind::Counter, &[]));
        assert!(err.is_err());
        assert!(sink.is_empty());
    }

    #[test]
    fn test_histogram_uses_descriptor_buckets() {
        let sink = PrometheusSink::default();
        let mut desc = descriptor("latency", MetricKind::Histogram, &[]);
        desc.bucket_bounds = Some(vec![0.1, 1.0]);
        let hist = sink.make_histogram(&desc).unwrap();
        hist.observe(&Labels::new(), 0.5).unwrap();

        let text = sink.render_all().unwrap();
        assert!(text.contains("# TYPE latency histogram"));
        assert!(text.contains("latency_bucket{le=\"0.1\"} 0"));
        assert!(text.contains("latency_bucket{le=\"1\"} 1"));
        assert!(text.contains("latency_count 1"));
    }
}

//! Ingestion pipeline: validate a batch, then fold every accepted sample
//! into the tenant registry in array order.
//!
//! Per-sample failures (validation, type conflicts, instrument errors) are
//! collected and reported; they never abort the batch. Only a structurally
//! invalid batch returns an error, and it does so before any registry
//! mutation.

pub mod validate;

pub use validate::{Sample, ValidationError};

use crate::metrics;
use crate::registry::{key, InstrumentError, Registry, RegistryError, TypeConfig, TENANT_LABEL};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use serde_json::Value;
use tally_shared::{IngestResponse, SampleError};
use tracing::debug;

/// Authenticated tenant identifier. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            None
        } else {
            Some(Self(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestionReport {
    pub processed: usize,
    pub total: usize,
    /// Rejected samples ordered by batch index.
    pub errors: Vec<SampleError>,
}

impl From<IngestionReport> for IngestResponse {
    fn from(report: IngestionReport) -> Self {
        IngestResponse {
            processed: report.processed,
            total: report.total,
            errors: report.errors,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[derive(Debug, thiserror::Error)]
enum ApplyError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Instrument(#[from] InstrumentError),
}

pub struct IngestionPipeline {
    registry: Arc<Registry>,
    type_config: TypeConfig,
}

impl IngestionPipeline {
    pub fn new(registry: Arc<Registry>, type_config: TypeConfig) -> Self {
        Self {
            registry,
            type_config,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn ingest(&self, tenant: &TenantId, batch: &[Value]) -> Result<IngestionReport, IngestError> {
        let _timer = metrics::INGEST_DURATION.start_timer();

        let validated = match validate::validate(batch) {
            Ok(v) => v,
            Err(e) => {
                if let ValidationError::NoValidSamples(rejected) = &e {
                    metrics::record_samples(0, rejected.len());
                }
                return Err(e.into());
            }
        };

        let mut errors = validated.rejected;
        let mut processed = 0;
        for sample in validated.accepted {
            let index = sample.index;
            let name = sample.name.clone();
            match self.apply(tenant, sample) {
                Ok(()) => processed += 1,
                Err(e) => {
                    debug!(tenant = %tenant, index, name = %name, error = %e, "sample rejected");
                    errors.push(SampleError {
                        index,
                        reason: e.to_string(),
                    });
                }
            }
        }
        errors.sort_by_key(|e| e.index);

        metrics::record_samples(processed, errors.len());
        metrics::REGISTRY_INSTRUMENTS.set(self.registry.len() as f64);

        Ok(IngestionReport {
            processed,
            total: batch.len(),
            errors,
        })
    }

    fn apply(&self, tenant: &TenantId, sample: Sample) -> Result<(), ApplyError> {
        let mut labels = sample.labels;
        // Overwrites any caller-supplied value.
        labels.insert(TENANT_LABEL.to_string(), tenant.as_str().to_string());

        let key = key::resolve(tenant.as_str(), &sample.name, &labels);
        let label_names: BTreeSet<String> = labels.keys().cloned().collect();
        let instrument = self
            .registry
            .get_or_create(&key, sample.kind, &label_names, &self.type_config)?;
        instrument.apply(sample.value, &labels)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::testing::FakeSink;
    use crate::registry::PrometheusSink;
    use prometheus::proto::MetricFamily;
    use serde_json::json;
    use tally_shared::RawSample;

    fn raw(samples: impl IntoIterator<Item = RawSample>) -> Vec<Value> {
        samples.into_iter().map(Value::from).collect()
    }

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    fn fake_pipeline() -> (IngestionPipeline, Arc<FakeSink>) {
        let sink = Arc::new(FakeSink::default());
        let registry = Arc::new(Registry::new(sink.clone()));
        (IngestionPipeline::new(registry, TypeConfig::default()), sink)
    }

    fn prom_pipeline() -> IngestionPipeline {
        let registry = Arc::new(Registry::new(Arc::new(PrometheusSink::default())));
        IngestionPipeline::new(registry, TypeConfig::default())
    }

    fn family<'a>(families: &'a [MetricFamily], name: &str) -> &'a MetricFamily {
        families.iter().find(|f| f.get_name() == name).unwrap()
    }

    #[test]
    fn test_tenant_id_must_not_be_empty() {
        assert!(TenantId::new("").is_none());
        assert!(TenantId::new("  ").is_none());
        assert_eq!(TenantId::new("42").unwrap().as_str(), "42");
    }

    #[test]
    fn test_partial_batch() {
        let (pipeline, _) = fake_pipeline();
        let batch = raw([
            RawSample::new("temperature", "gauge", 21.5),
            RawSample::new("temperature", "gauge", "not-a-number"),
            RawSample::new("jobs_total", "counter", 1),
        ]);
        let report = pipeline.ingest(&tenant("t1"), &batch).unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.total, 3);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].index, 1);
    }

    #[test]
    fn test_batch_shape_errors_do_not_touch_registry() {
        let (pipeline, sink) = fake_pipeline();
        assert!(matches!(
            pipeline.ingest(&tenant("t1"), &[]),
            Err(IngestError::Validation(ValidationError::EmptyBatch))
        ));

        let oversized = raw(vec![RawSample::new("x", "gauge", 1); 101]);
        assert!(matches!(
            pipeline.ingest(&tenant("t1"), &oversized),
            Err(IngestError::Validation(ValidationError::BatchTooLarge(101)))
        ));
        assert!(pipeline.registry().is_empty());
        assert_eq!(sink.made(), 0);
    }

    #[test]
    fn test_full_batch_of_one_hundred() {
        let (pipeline, _) = fake_pipeline();
        let batch: Vec<_> = (0..100)
            .map(|i| RawSample::new("queue_depth", "gauge", i).with_label("queue", format!("q{}", i % 7)))
            .map(Value::from)
            .collect();
        let report = pipeline.ingest(&tenant("t1"), &batch).unwrap();
        assert_eq!(report.processed, 100);
        assert!(report.errors.is_empty());
        assert_eq!(pipeline.registry().len(), 7);
    }

    #[test]
    fn test_all_invalid_is_an_error() {
        let (pipeline, _) = fake_pipeline();
        let batch = raw([RawSample::new("x", "counter", -5)]);
        match pipeline.ingest(&tenant("t1"), &batch) {
            Err(IngestError::Validation(ValidationError::NoValidSamples(rejected))) => {
                assert_eq!(rejected.len(), 1);
            }
            other => panic!("expected NoValidSamples, got {other:?}"),
        }
        assert!(pipeline.registry().is_empty());
    }

    #[test]
    fn test_conflict_is_a_per_sample_rejection() {
        let (pipeline, _) = fake_pipeline();
        let batch = raw([
            RawSample::new("requests", "counter", 1),
            RawSample::new("requests", "gauge", 5),
            RawSample::new("latency", "histogram", 0.2),
        ]);
        let report = pipeline.ingest(&tenant("t1"), &batch).unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].index, 1);
        assert!(report.errors[0].reason.contains("bound to a different type"));
    }

    #[test]
    fn test_counter_accumulates_and_zero_is_ignored() {
        let (pipeline, sink) = fake_pipeline();
        let t = tenant("t1");
        pipeline.ingest(&t, &raw([RawSample::new("jobs_total", "counter", 1)])).unwrap();
        pipeline.ingest(&t, &raw([RawSample::new("jobs_total", "counter", 0)])).unwrap();
        let report = pipeline
            .ingest(&t, &raw([RawSample::new("jobs_total", "counter", "2.5")]))
            .unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(sink.recorded("jobs_total"), vec![1.0, 2.5]);
        assert_eq!(sink.made(), 1);
    }

    #[test]
    fn test_tenants_get_separate_instruments() {
        let (pipeline, sink) = fake_pipeline();
        pipeline.ingest(&tenant("t1"), &raw([RawSample::new("jobs_total", "counter", 1)])).unwrap();
        pipeline.ingest(&tenant("t2"), &raw([RawSample::new("jobs_total", "counter", 1)])).unwrap();
        assert_eq!(sink.made(), 2);
        assert_eq!(pipeline.registry().len(), 2);
    }

    #[test]
    fn test_caller_supplied_tenant_label_is_overwritten() {
        let pipeline = prom_pipeline();
        let spoofed = RawSample::new("page_views", "counter", 1).with_label(TENANT_LABEL, "999");
        pipeline.ingest(&tenant("42"), &raw([spoofed])).unwrap();

        let families = pipeline.registry().gather();
        let metric = &family(&families, "page_views").get_metric()[0];
        let labels: Vec<_> = metric
            .get_label()
            .iter()
            .map(|l| (l.get_name(), l.get_value()))
            .collect();
        assert_eq!(labels, vec![(TENANT_LABEL, "42")]);
    }

    #[test]
    fn test_samples_apply_in_array_order() {
        let pipeline = prom_pipeline();
        let batch = raw([
            RawSample::new("temperature", "gauge", json!(1)),
            RawSample::new("temperature", "gauge", json!(5)),
            RawSample::new("temperature", "gauge", json!(3)),
        ]);
        pipeline.ingest(&tenant("t1"), &batch).unwrap();

        let families = pipeline.registry().gather();
        let metric = &family(&families, "temperature").get_metric()[0];
        assert_eq!(metric.get_gauge().get_value(), 3.0);
    }
}

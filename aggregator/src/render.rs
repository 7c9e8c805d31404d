//! Exposition renderer.
//!
//! Snapshots the tenant registry, the infra registry and the process-wide
//! default registry, merges families by name and encodes them in the
//! Prometheus text format (version 0.0.4).

use crate::metrics;
use crate::registry::Registry;
use prometheus::proto::{LabelPair, Metric, MetricFamily};
use prometheus::{Encoder, TextEncoder};
use std::collections::BTreeMap;
use std::string::FromUtf8Error;
use std::sync::Arc;
use tracing::warn;

/// Content type of the rendered document.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("encoding metrics failed: {0}")]
    Encode(#[from] prometheus::Error),

    #[error("encoded metrics are not valid UTF-8: {0}")]
    Utf8(#[from] FromUtf8Error),
}

/// Merge families sharing a name into one, ordered by name.
///
/// Empty families are pruned (the text encoder refuses them). A family
/// whose type differs from the first family seen under the same name is
/// dropped.
pub fn merge_families(families: impl IntoIterator<Item = MetricFamily>) -> Vec<MetricFamily> {
    let mut merged: BTreeMap<String, MetricFamily> = BTreeMap::new();

    for mut family in families {
        if family.get_metric().is_empty() {
            continue;
        }
        match merged.get_mut(family.get_name()) {
            None => {
                merged.insert(family.get_name().to_string(), family);
            }
            Some(existing) if existing.get_field_type() != family.get_field_type() => {
                warn!(
                    name = family.get_name(),
                    kept = ?existing.get_field_type(),
                    dropped = ?family.get_field_type(),
                    "dropping metric family with conflicting type"
                );
            }
            Some(existing) => {
                for metric in family.take_metric().into_vec() {
                    existing.mut_metric().push(metric);
                }
            }
        }
    }

    merged
        .into_values()
        .map(|mut family| {
            let mut metrics = family.take_metric().into_vec();
            metrics.sort_by_cached_key(label_values);
            family.set_metric(metrics.into());
            family
        })
        .collect()
}

fn label_values(metric: &Metric) -> Vec<(String, String)> {
    metric
        .get_label()
        .iter()
        .map(|l: &LabelPair| (l.get_name().to_string(), l.get_value().to_string()))
        .collect()
}

pub fn encode(families: &[MetricFamily]) -> Result<String, RenderError> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Renders one scrape document from every metric source.
#[derive(Debug, Clone)]
pub struct Renderer {
    tenants: Arc<Registry>,
    infra: Arc<Registry>,
}

impl Renderer {
    /// Also binds every service and infra family name in `tenants`, so a
    /// tenant sample reusing one of them with another type is rejected at
    /// ingest instead of vanishing from the scrape.
    pub fn new(tenants: Arc<Registry>, infra: Arc<Registry>) -> Self {
        let reserved = metrics::service_families()
            .into_iter()
            .chain(infra.family_kinds());
        for (name, kind) in reserved {
            if let Err(e) = tenants.reserve(&name, kind) {
                warn!(error = %e, "metric name already bound");
            }
        }
        Self { tenants, infra }
    }

    pub fn render(&self) -> Result<String, RenderError> {
        let _timer = metrics::RENDER_DURATION.start_timer();
        metrics::refresh_process_metrics();

        // Service families come first so their types win a name clash.
        let mut families = prometheus::gather();
        families.extend(self.infra.gather());
        families.extend(self.tenants.gather());
        encode(&merge_families(families))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{IngestionPipeline, TenantId};
    use crate::registry::{PrometheusSink, TypeConfig};
    use prometheus::proto::{Counter, Gauge, MetricType};
    use serde_json::Value;
    use crate::infra::InfraMetrics;
    use std::collections::HashMap;
    use std::time::Duration;
    use tally_shared::{MetricKind, RawSample};

    fn raw(samples: impl IntoIterator<Item = RawSample>) -> Vec<Value> {
        samples.into_iter().map(Value::from).collect()
    }

    fn renderer() -> (Renderer, IngestionPipeline) {
        let tenants = Arc::new(Registry::new(Arc::new(PrometheusSink::default())));
        let infra = Arc::new(Registry::declared(Arc::new(PrometheusSink::default()), Vec::new()).unwrap());
        let pipeline = IngestionPipeline::new(tenants.clone(), TypeConfig::default());
        (Renderer::new(tenants, infra), pipeline)
    }

    fn family(name: &str, kind: MetricType, values: &[(&str, f64)]) -> MetricFamily {
        let mut family = MetricFamily::default();
        family.set_name(name.to_string());
        family.set_help(format!("help for {name}"));
        family.set_field_type(kind);
        let metrics: Vec<Metric> = values
            .iter()
            .map(|(label, value)| {
                let mut pair = LabelPair::default();
                pair.set_name("instance".to_string());
                pair.set_value(label.to_string());
                let mut metric = Metric::default();
                metric.set_label(vec![pair].into());
                match kind {
                    MetricType::COUNTER => {
                        let mut c = Counter::default();
                        c.set_value(*value);
                        metric.set_counter(c);
                    }
                    _ => {
                        let mut g = Gauge::default();
                        g.set_value(*value);
                        metric.set_gauge(g);
                    }
                }
                metric
            })
            .collect();
        family.set_metric(metrics.into());
        family
    }

    #[test]
    fn test_round_trip_counter() {
        let (renderer, pipeline) = renderer();
        let tenant = TenantId::new("42").unwrap();
        let sample = RawSample::new("page_views", "counter", 1).with_label("method", "GET");
        pipeline.ingest(&tenant, &raw([sample])).unwrap();

        let text = renderer.render().unwrap();
        assert!(text.contains("# TYPE page_views counter"));
        assert!(text.contains(r#"page_views{method="GET",user_id="42"} 1"#));
    }

    #[test]
    fn test_label_sets_share_one_header() {
        let (renderer, pipeline) = renderer();
        let tenant = TenantId::new("t1").unwrap();
        let batch = raw([
            RawSample::new("requests", "counter", 1).with_label("route", "/a"),
            RawSample::new("requests", "counter", 2).with_label("route", "/b"),
        ]);
        pipeline.ingest(&tenant, &batch).unwrap();

        let text = renderer.render().unwrap();
        assert_eq!(text.matches("# TYPE requests counter").count(), 1);
        assert_eq!(text.matches("# HELP requests ").count(), 1);
        assert!(text.contains(r#"requests{route="/a",user_id="t1"} 1"#));
        assert!(text.contains(r#"requests{route="/b",user_id="t1"} 2"#));
    }

    #[test]
    fn test_distinct_label_names_under_one_name() {
        let (renderer, pipeline) = renderer();
        let tenant = TenantId::new("t1").unwrap();
        let batch = raw([
            RawSample::new("queue_depth", "gauge", 3),
            RawSample::new("queue_depth", "gauge", 4).with_label("queue", "mail"),
        ]);
        pipeline.ingest(&tenant, &batch).unwrap();

        let text = renderer.render().unwrap();
        assert_eq!(text.matches("# TYPE queue_depth gauge").count(), 1);
        assert!(text.contains(r#"queue_depth{user_id="t1"} 3"#));
        assert!(text.contains(r#"queue_depth{queue="mail",user_id="t1"} 4"#));
    }

    #[test]
    fn test_histogram_and_summary_exposition() {
        let (renderer, pipeline) = renderer();
        let tenant = TenantId::new("t1").unwrap();
        let batch = raw([
            RawSample::new("latency_seconds", "histogram", 0.2),
            RawSample::new("payload_bytes", "summary", 100),
            RawSample::new("payload_bytes", "summary", 300),
        ]);
        pipeline.ingest(&tenant, &batch).unwrap();

        let text = renderer.render().unwrap();
        assert!(text.contains("# TYPE latency_seconds histogram"));
        assert!(text.contains(r#"latency_seconds_bucket{user_id="t1",le="0.25"} 1"#));
        assert!(text.contains(r#"latency_seconds_count{user_id="t1"} 1"#));
        assert!(text.contains("# TYPE payload_bytes summary"));
        assert!(text.contains(r#"payload_bytes_count{user_id="t1"} 2"#));
        assert!(text.contains(r#"payload_bytes_sum{user_id="t1"} 400"#));
        assert!(text.contains(r#"quantile="0.5""#));
    }

    #[test]
    fn test_zero_counter_emits_no_series() {
        let (renderer, pipeline) = renderer();
        let tenant = TenantId::new("t1").unwrap();
        pipeline
            .ingest(&tenant, &raw([RawSample::new("idle_total", "counter", 0)]))
            .unwrap();

        let text = renderer.render().unwrap();
        assert!(!text.contains("idle_total"));
    }

    #[test]
    fn test_includes_process_metrics() {
        let (renderer, _) = renderer();
        metrics::init();
        let text = renderer.render().unwrap();
        assert!(text.contains("# TYPE process_uptime_seconds gauge"));
        assert!(text.contains("tally_render_duration_seconds"));
    }

    #[test]
    fn test_service_and_infra_names_are_reserved_for_tenants() {
        let tenants = Arc::new(Registry::new(Arc::new(PrometheusSink::default())));
        let infra = InfraMetrics::new(Duration::from_secs(1)).unwrap();
        let _renderer = Renderer::new(tenants.clone(), infra.registry().clone());

        let kinds: HashMap<_, _> = tenants.family_kinds().into_iter().collect();
        assert_eq!(kinds.get("db_pool_size"), Some(&MetricKind::Gauge));
        assert_eq!(kinds.get("process_uptime_seconds"), Some(&MetricKind::Gauge));
        assert_eq!(kinds.get("tally_ingest_requests_total"), Some(&MetricKind::Counter));

        let pipeline = IngestionPipeline::new(tenants.clone(), TypeConfig::default());
        let report = pipeline
            .ingest(
                &TenantId::new("42").unwrap(),
                &raw([
                    RawSample::new("db_pool_size", "counter", 3),
                    RawSample::new("db_pool_size", "gauge", 3),
                ]),
            )
            .unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.errors[0].index, 0);
    }

    #[test]
    fn test_merge_prunes_sorts_and_drops_conflicts() {
        let mut empty = family("aaa", MetricType::GAUGE, &[]);
        empty.set_help("empty".to_string());
        let merged = merge_families(vec![
            family("zeta", MetricType::GAUGE, &[("b", 2.0)]),
            empty,
            family("alpha", MetricType::COUNTER, &[("x", 1.0)]),
            family("zeta", MetricType::GAUGE, &[("a", 1.0)]),
            family("alpha", MetricType::GAUGE, &[("y", 5.0)]),
        ]);

        let names: Vec<_> = merged.iter().map(|f| f.get_name()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(merged[0].get_field_type(), MetricType::COUNTER);
        assert_eq!(merged[0].get_metric().len(), 1);

        let zeta: Vec<_> = merged[1]
            .get_metric()
            .iter()
            .map(|m| m.get_label()[0].get_value())
            .collect();
        assert_eq!(zeta, vec!["a", "b"]);
    }

    #[test]
    fn test_encode_text() {
        let text = encode(&merge_families(vec![family("up", MetricType::GAUGE, &[("a", 1.0)])])).unwrap();
        assert_eq!(text, "# HELP up help for up\n# TYPE up gauge\nup{instance=\"a\"} 1\n");
    }
}

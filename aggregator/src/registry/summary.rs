//! Summary collector.
//!
//! The `prometheus` crate has no summary type, so quantile summaries are
//! implemented here as a [`Collector`] that emits `SUMMARY` families. Each
//! label-value combination keeps a bounded window of recent observations
//! for quantile estimation plus lifetime `_sum` and `_count`.

use super::instrument::Labels;
use prometheus::core::{Collector, Desc};
use prometheus::proto::{self, LabelPair, MetricFamily, MetricType};
use prometheus::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

#[derive(Clone)]
pub struct SummaryVec {
    core: Arc<SummaryCore>,
}

struct SummaryCore {
    desc: Desc,
    quantiles: Vec<f64>,
    max_samples: usize,
    children: RwLock<HashMap<Vec<String>, Arc<Mutex<Window>>>>,
}

#[derive(Default)]
struct Window {
    samples: VecDeque<f64>,
    sum: f64,
    count: u64,
}

impl Window {
    fn observe(&mut self, value: f64, max_samples: usize) {
        if self.samples.len() == max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
        self.sum += value;
        self.count += 1;
    }
}

impl SummaryVec {
    pub fn new(
        name: &str,
        help: &str,
        label_names: &[&str],
        quantiles: &[f64],
        max_samples: usize,
    ) -> Result<Self> {
        if max_samples == 0 {
            return Err(Error::Msg("summary window must hold at least one sample".into()));
        }
        if let Some(q) = quantiles.iter().find(|q| !(0.0..=1.0).contains(*q)) {
            return Err(Error::Msg(format!("quantile {} is outside [0, 1]", q)));
        }
        let desc = Desc::new(
            name.to_string(),
            help.to_string(),
            label_names.iter().map(|s| s.to_string()).collect(),
            HashMap::new(),
        )?;

        let mut quantiles = quantiles.to_vec();
        quantiles.sort_by(f64::total_cmp);
        quantiles.dedup();

        Ok(Self {
            core: Arc::new(SummaryCore {
                desc,
                quantiles,
                max_samples,
                children: RwLock::new(HashMap::new()),
            }),
        })
    }

    /// Record one observation for the child selected by `labels`.
    pub fn observe_with(&self, labels: &Labels, value: f64) -> Result<()> {
        let core = &self.core;
        let names = &core.desc.variable_labels;
        if labels.len() != names.len() {
            return Err(Error::InconsistentCardinality {
                expect: names.len(),
                got: labels.len(),
            });
        }
        let values = names
            .iter()
            .map(|name| {
                labels
                    .get(name)
                    .cloned()
                    .ok_or_else(|| Error::Msg(format!("label name {} missing in label map", name)))
            })
            .collect::<Result<Vec<_>>>()?;

        let existing = core
            .children
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&values)
            .cloned();
        let window = match existing {
            Some(window) => window,
            None => core
                .children
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(values)
                .or_default()
                .clone(),
        };

        window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe(value, core.max_samples);
        Ok(())
    }
}

/// Nearest-rank quantile over sorted samples.
fn rank(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let n = sorted.len();
    let idx = ((q * n as f64).ceil() as usize).clamp(1, n) - 1;
    sorted[idx]
}

impl Collector for SummaryVec {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.core.desc]
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let core = &self.core;
        let children = core.children.read().unwrap_or_else(PoisonError::into_inner);

        let mut metrics = Vec::with_capacity(children.len());
        for (values, window) in children.iter() {
            let window = window.lock().unwrap_or_else(PoisonError::into_inner);
            let mut sorted: Vec<f64> = window.samples.iter().copied().collect();
            sorted.sort_by(f64::total_cmp);

            let quantiles: Vec<proto::Quantile> = core
                .quantiles
                .iter()
                .map(|&q| {
                    let mut quantile = proto::Quantile::default();
                    quantile.set_quantile(q);
                    quantile.set_value(rank(&sorted, q));
                    quantile
                })
                .collect();

            let mut summary = proto::Summary::default();
            summary.set_sample_count(window.count);
            summary.set_sample_sum(window.sum);
            summary.set_quantile(quantiles.into());

            let mut pairs: Vec<LabelPair> = core
                .desc
                .variable_labels
                .iter()
                .zip(values)
                .map(|(name, value)| {
                    let mut pair = LabelPair::default();
                    pair.set_name(name.clone());
                    pair.set_value(value.clone());
                    pair
                })
                .collect();
            pairs.sort_by(|a, b| a.get_name().cmp(b.get_name()));

            let mut metric = proto::Metric::default();
            metric.set_label(pairs.into());
            metric.set_summary(summary);
            metrics.push(metric);
        }

        let mut family = MetricFamily::default();
        family.set_name(core.desc.fq_name.clone());
        family.set_help(core.desc.help.clone());
        family.set_field_type(MetricType::SUMMARY);
        family.set_metric(metrics.into());
        vec![family]
    }
}

//! Instrument identity derivation.
//!
//! A key is the tenant, the metric name, and a canonical rendering of the
//! label set. The canonical form is built from the sorted, quoted
//! `key="value"` pairs so that two label maps with the same contents always
//! produce the same key, whatever order they were inserted in.

use std::fmt;

/// Label injected on every tenant instrument. Callers may not set it.
pub const TENANT_LABEL: &str = "user_id";

/// Label keys stripped from caller input before hashing.
pub const RESERVED_LABELS: &[&str] = &[TENANT_LABEL];

/// Canonical label set of a sample without (non-reserved) labels.
pub const EMPTY_LABEL_SET: &str = "__none__";

/// Identity of one instrument in a [`Registry`](super::Registry).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantMetricKey {
    pub tenant_id: String,
    pub metric_name: String,
    pub label_set: String,
}

impl fmt::Display for TenantMetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}{{{}}}", self.tenant_id, self.metric_name, self.label_set)
    }
}

pub fn is_reserved(label: &str) -> bool {
    RESERVED_LABELS.contains(&label)
}

/// Derive the key for `(tenant, metric, labels)`. Pure; never fails.
pub fn resolve<I, K, V>(tenant_id: &str, metric_name: &str, labels: I) -> TenantMetricKey
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut pairs: Vec<(K, V)> = labels
        .into_iter()
        .filter(|(k, _)| !is_reserved(k.as_ref()))
        .collect();
    pairs.sort_by(|a, b| {
        (a.0.as_ref(), a.1.as_ref()).cmp(&(b.0.as_ref(), b.1.as_ref()))
    });

    let label_set = if pairs.is_empty() {
        EMPTY_LABEL_SET.to_string()
    } else {
        pairs
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k.as_ref(), escape(v.as_ref())))
            .collect::<Vec<_>>()
            .join(",")
    };

    TenantMetricKey {
        tenant_id: tenant_id.to_string(),
        metric_name: metric_name.to_string(),
        label_set,
    }
}

/// Key for an instrument that belongs to no tenant (fixed-schema registries).
pub fn unscoped(scope: &str, metric_name: &str) -> TenantMetricKey {
    resolve::<_, &str, &str>(scope, metric_name, [])
}

// Quoting keeps `a="1,b=2"` distinct from `a="1",b="2"`.
fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

//! Metric registry.
//!
//! Maps a [`TenantMetricKey`] to a live [`Instrument`]. Two instantiation
//! policies share the same type:
//!
//! - **dynamic** ([`Registry::new`]): instruments are created on first use,
//!   schema-on-write. Used for tenant-submitted samples.
//! - **declared** ([`Registry::declared`]): every instrument is built at
//!   startup from a fixed list and the registry is sealed. Used for
//!   infrastructure metrics.
//!
//! A metric name is bound to one kind per registry, across all tenants:
//! the first sample under a name fixes its TYPE for everyone. Names used by
//! the service itself can be bound up front with [`Registry::reserve`].
//!
//! ```text
//! get_or_create(key, kind, labels, config)
//!   ├── read lock: hit → kind check → Arc<Instrument>
//!   └── write lock: re-check → family kind check → sink.make_* → insert
//! ```

pub mod instrument;
pub mod key;
pub mod sink;
pub mod summary;

pub use instrument::{Instrument, InstrumentDescriptor, InstrumentError, Labels, TypeConfig};
pub use key::{TenantMetricKey, TENANT_LABEL};
pub use sink::{MetricSink, PrometheusSink, SinkError};

use instrument::Handle;
use prometheus::proto::MetricFamily;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tally_shared::MetricKind;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("metric name {name:?} is bound to a different type, cannot record it as a {requested}")]
    Conflict {
        name: String,
        existing: MetricKind,
        requested: MetricKind,
    },

    #[error("metric {0:?} is not declared in this registry")]
    Undeclared(String),

    #[error("instrument {0} is declared more than once")]
    Duplicate(TenantMetricKey),

    #[error("metric backend refused {name:?}: {source}")]
    Sink {
        name: String,
        #[source]
        source: SinkError,
    },
}

/// One entry of a declared registry.
#[derive(Debug, Clone)]
pub struct Declaration {
    pub key: TenantMetricKey,
    pub descriptor: InstrumentDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Policy {
    Dynamic,
    Declared,
}

#[derive(Default)]
struct Inner {
    instruments: HashMap<TenantMetricKey, Arc<Instrument>>,
    /// Kind bound to each exposed metric name, so one name never carries two TYPEs.
    families: HashMap<String, MetricKind>,
}

pub struct Registry {
    sink: Arc<dyn MetricSink>,
    policy: Policy,
    inner: RwLock<Inner>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("policy", &self.policy)
            .field("instruments", &self.len())
            .finish()
    }
}

impl Registry {
    /// A registry that creates instruments lazily.
    pub fn new(sink: Arc<dyn MetricSink>) -> Self {
        Self {
            sink,
            policy: Policy::Dynamic,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// A sealed registry holding exactly `declarations`, all built eagerly.
    pub fn declared(
        sink: Arc<dyn MetricSink>,
        declarations: impl IntoIterator<Item = Declaration>,
    ) -> Result<Self, RegistryError> {
        let mut inner = Inner::default();
        for Declaration { key, descriptor } in declarations {
            if inner.instruments.contains_key(&key) {
                return Err(RegistryError::Duplicate(key));
            }
            let instrument = insert_new(sink.as_ref(), &mut inner, key, descriptor)?;
            debug!(name = %instrument.descriptor().name, "declared instrument");
        }
        Ok(Self {
            sink,
            policy: Policy::Declared,
            inner: RwLock::new(inner),
        })
    }

    /// Return the instrument for `key`, creating it if the policy allows.
    ///
    /// The label set is part of the key, so a hit always has matching label
    /// names; only the kind needs checking.
    pub fn get_or_create(
        &self,
        key: &TenantMetricKey,
        kind: MetricKind,
        label_names: &BTreeSet<String>,
        config: &TypeConfig,
    ) -> Result<Arc<Instrument>, RegistryError> {
        if let Some(found) = self.get(key) {
            return check_kind(found, kind);
        }

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have inserted between the two locks.
        if let Some(found) = inner.instruments.get(key) {
            return check_kind(found.clone(), kind);
        }
        if self.policy == Policy::Declared {
            return Err(RegistryError::Undeclared(key.metric_name.clone()));
        }

        let descriptor = InstrumentDescriptor::new(
            key.metric_name.as_str(),
            format!("Custom {} metric {}", kind, key.metric_name),
            kind,
            label_names.clone(),
            config,
        );
        let instrument = insert_new(self.sink.as_ref(), &mut inner, key.clone(), descriptor)?;
        debug!(key = %key, kind = %kind, "created instrument");
        Ok(instrument)
    }

    pub fn get(&self, key: &TenantMetricKey) -> Option<Arc<Instrument>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .instruments
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .instruments
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_sealed(&self) -> bool {
        self.policy == Policy::Declared
    }

    /// Bind `name` to `kind` without creating an instrument.
    pub fn reserve(&self, name: &str, kind: MetricKind) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match inner.families.get(name) {
            Some(&existing) if existing != kind => Err(RegistryError::Conflict {
                name: name.to_string(),
                existing,
                requested: kind,
            }),
            Some(_) => Ok(()),
            None => {
                inner.families.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    /// Every bound metric name with its kind.
    pub fn family_kinds(&self) -> Vec<(String, MetricKind)> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .families
            .iter()
            .map(|(name, &kind)| (name.clone(), kind))
            .collect()
    }

    /// Snapshot every instrument's state.
    pub fn gather(&self) -> Vec<MetricFamily> {
        self.sink.gather()
    }
}

fn check_kind(found: Arc<Instrument>, requested: MetricKind) -> Result<Arc<Instrument>, RegistryError> {
    if found.kind() == requested {
        Ok(found)
    } else {
        Err(RegistryError::Conflict {
            name: found.descriptor().name.clone(),
            existing: found.kind(),
            requested,
        })
    }
}

fn insert_new(
    sink: &dyn MetricSink,
    inner: &mut Inner,
    key: TenantMetricKey,
    descriptor: InstrumentDescriptor,
) -> Result<Arc<Instrument>, RegistryError> {
    if let Some(&existing) = inner.families.get(&descriptor.name) {
        if existing != descriptor.kind {
            return Err(RegistryError::Conflict {
                name: descriptor.name,
                existing,
                requested: descriptor.kind,
            });
        }
    }

    let made = match descriptor.kind {
        MetricKind::Counter => sink.make_counter(&descriptor).map(Handle::Counter),
        MetricKind::Gauge => sink.make_gauge(&descriptor).map(Handle::Gauge),
        MetricKind::Histogram => sink.make_histogram(&descriptor).map(Handle::Histogram),
        MetricKind::Summary => sink.make_summary(&descriptor).map(Handle::Summary),
    };
    let handle = made.map_err(|source| RegistryError::Sink {
        name: descriptor.name.clone(),
        source,
    })?;

    inner
        .families
        .entry(descriptor.name.clone())
        .or_insert(descriptor.kind);
    let instrument = Arc::new(Instrument::new(descriptor, handle));
    inner.instruments.insert(key, instrument.clone());
    Ok(instrument)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording fake for the [`MetricSink`] seam.

    use super::instrument::{CounterHandle, GaugeHandle, ObserveHandle};
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingHandle {
        values: Mutex<Vec<f64>>,
    }

    impl RecordingHandle {
        pub fn values(&self) -> Vec<f64> {
            self.values.lock().unwrap().clone()
        }

        fn push(&self, value: f64) -> Result<(), SinkError> {
            self.values.lock().unwrap().push(value);
            Ok(())
        }
    }

    impl CounterHandle for RecordingHandle {
        fn inc_by(&self, _labels: &Labels, delta: f64) -> Result<(), SinkError> {
            self.push(delta)
        }
    }

    impl GaugeHandle for RecordingHandle {
        fn set(&self, _labels: &Labels, value: f64) -> Result<(), SinkError> {
            self.push(value)
        }
    }

    impl ObserveHandle for RecordingHandle {
        fn observe(&self, _labels: &Labels, value: f64) -> Result<(), SinkError> {
            self.push(value)
        }
    }

    /// Counts constructions and hands out [`RecordingHandle`]s.
    #[derive(Default)]
    pub struct FakeSink {
        pub made: AtomicUsize,
        pub refuse: Option<String>,
        handles: Mutex<Vec<(String, Arc<RecordingHandle>)>>,
    }

    impl FakeSink {
        pub fn refusing(name: &str) -> Self {
            Self {
                refuse: Some(name.to_string()),
                ..Self::default()
            }
        }

        pub fn made(&self) -> usize {
            self.made.load(Ordering::SeqCst)
        }

        /// Values recorded by every handle built for `name`.
        pub fn recorded(&self, name: &str) -> Vec<f64> {
            self.handles
                .lock()
                .unwrap()
                .iter()
                .filter(|(n, _)| n == name)
                .flat_map(|(_, h)| h.values())
                .collect()
        }

        fn make(&self, descriptor: &InstrumentDescriptor) -> Result<Arc<RecordingHandle>, SinkError> {
            if self.refuse.as_deref() == Some(descriptor.name.as_str()) {
                return Err(SinkError::Rejected(format!("refused {}", descriptor.name)));
            }
            self.made.fetch_add(1, Ordering::SeqCst);
            let handle = Arc::new(RecordingHandle::default());
            self.handles
                .lock()
                .unwrap()
                .push((descriptor.name.clone(), handle.clone()));
            Ok(handle)
        }
    }

    impl MetricSink for FakeSink {
        fn make_counter(&self, d: &InstrumentDescriptor) -> Result<Arc<dyn CounterHandle>, SinkError> {
            Ok(self.make(d)?)
        }

        fn make_gauge(&self, d: &InstrumentDescriptor) -> Result<Arc<dyn GaugeHandle>, SinkError> {
            Ok(self.make(d)?)
        }

        fn make_histogram(&self, d: &InstrumentDescriptor) -> Result<Arc<dyn ObserveHandle>, SinkError> {
            Ok(self.make(d)?)
        }

        fn make_summary(&self, d: &InstrumentDescriptor) -> Result<Arc<dyn ObserveHandle>, SinkError> {
            Ok(self.make(d)?)
        }

        fn gather(&self) -> Vec<MetricFamily> {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeSink;
    use super::*;

    fn names(labels: &[&str]) -> BTreeSet<String> {
        labels.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_get_or_create_returns_same_instance() {
        let sink = Arc::new(FakeSink::default());
        let registry = Registry::new(sink.clone());
        let key = key::resolve("t1", "requests", [("method", "GET")]);
        let labels = names(&["method", TENANT_LABEL]);

        let a = registry
            .get_or_create(&key, MetricKind::Counter, &labels, &TypeConfig::default())
            .unwrap();
        let b = registry
            .get_or_create(&key, MetricKind::Counter, &labels, &TypeConfig::default())
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(sink.made(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_type_conflict_is_rejected() {
        let registry = Registry::new(Arc::new(FakeSink::default()));
        let key = key::resolve::<_, &str, &str>("t1", "requests", []);
        let labels = names(&[TENANT_LABEL]);
        registry
            .get_or_create(&key, MetricKind::Counter, &labels, &TypeConfig::default())
            .unwrap();

        let err = registry
            .get_or_create(&key, MetricKind::Gauge, &labels, &TypeConfig::default())
            .unwrap_err();
        match err {
            RegistryError::Conflict { name, existing, requested } => {
                assert_eq!(name, "requests");
                assert_eq!(existing, MetricKind::Counter);
                assert_eq!(requested, MetricKind::Gauge);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        let kept = registry.get(&key).unwrap();
        assert_eq!(kept.kind(), MetricKind::Counter);
    }

    #[test]
    fn test_family_kind_is_shared_across_label_sets() {
        let registry = Registry::new(Arc::new(FakeSink::default()));
        let get = key::resolve("t1", "requests", [("method", "GET")]);
        let by_path = key::resolve("t2", "requests", [("path", "/")]);
        registry
            .get_or_create(&get, MetricKind::Counter, &names(&["method", TENANT_LABEL]), &TypeConfig::default())
            .unwrap();
        let err = registry
            .get_or_create(&by_path, MetricKind::Histogram, &names(&["path", TENANT_LABEL]), &TypeConfig::default())
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reserved_name_rejects_other_kinds() {
        let registry = Registry::new(Arc::new(FakeSink::default()));
        registry.reserve("db_pool_size", MetricKind::Gauge).unwrap();
        registry.reserve("db_pool_size", MetricKind::Gauge).unwrap();
        assert!(matches!(
            registry.reserve("db_pool_size", MetricKind::Counter),
            Err(RegistryError::Conflict { .. })
        ));

        let key = key::resolve::<_, &str, &str>("t1", "db_pool_size", []);
        let err = registry
            .get_or_create(&key, MetricKind::Counter, &names(&[TENANT_LABEL]), &TypeConfig::default())
            .unwrap_err();
        assert!(err.to_string().contains("bound to a different type"));
        assert!(registry.is_empty());
        assert_eq!(
            registry.family_kinds(),
            vec![("db_pool_size".to_string(), MetricKind::Gauge)]
        );
    }

    #[test]
    fn test_distinct_label_sets_create_siblings() {
        let sink = Arc::new(FakeSink::default());
        let registry = Registry::new(sink.clone());
        let a = key::resolve("t1", "requests", [("method", "GET")]);
        let b = key::resolve("t1", "requests", [("path", "/")]);
        let ia = registry
            .get_or_create(&a, MetricKind::Counter, &names(&["method", TENANT_LABEL]), &TypeConfig::default())
            .unwrap();
        let ib = registry
            .get_or_create(&b, MetricKind::Counter, &names(&["path", TENANT_LABEL]), &TypeConfig::default())
            .unwrap();
        assert!(!Arc::ptr_eq(&ia, &ib));
        assert_eq!(registry.len(), 2);
        assert_eq!(sink.made(), 2);
    }

    #[test]
    fn test_sink_refusal_leaves_no_entry() {
        let registry = Registry::new(Arc::new(FakeSink::refusing("bad")));
        let key = key::resolve::<_, &str, &str>("t1", "bad", []);
        let err = registry
            .get_or_create(&key, MetricKind::Gauge, &names(&[TENANT_LABEL]), &TypeConfig::default())
            .unwrap_err();
        assert!(matches!(err, RegistryError::Sink { .. }));
        assert!(registry.is_empty());

        // The failed attempt must not have bound the family kind.
        let other = key::resolve::<_, &str, &str>("t1", "good", []);
        registry
            .get_or_create(&other, MetricKind::Counter, &names(&[TENANT_LABEL]), &TypeConfig::default())
            .unwrap();
    }

    #[test]
    fn test_declared_registry_is_sealed() {
        let sink = Arc::new(FakeSink::default());
        let config = TypeConfig::default();
        let key = key::unscoped("infra", "db_pool_size");
        let registry = Registry::declared(
            sink.clone(),
            [Declaration {
                key: key.clone(),
                descriptor: InstrumentDescriptor::new(
                    "db_pool_size",
                    "pool size",
                    MetricKind::Gauge,
                    BTreeSet::new(),
                    &config,
                ),
            }],
        )
        .unwrap();

        assert!(registry.is_sealed());
        assert_eq!(sink.made(), 1);
        let found = registry
            .get_or_create(&key, MetricKind::Gauge, &BTreeSet::new(), &config)
            .unwrap();
        assert_eq!(found.descriptor().help, "pool size");

        let other = key::unscoped("infra", "db_other");
        assert!(matches!(
            registry.get_or_create(&other, MetricKind::Gauge, &BTreeSet::new(), &config),
            Err(RegistryError::Undeclared(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_declared_registry_rejects_duplicates() {
        let config = TypeConfig::default();
        let decl = Declaration {
            key: key::unscoped("infra", "db_pool_size"),
            descriptor: InstrumentDescriptor::new("db_pool_size", "h", MetricKind::Gauge, BTreeSet::new(), &config),
        };
        let result = Registry::declared(Arc::new(FakeSink::default()), [decl.clone(), decl]);
        assert!(matches!(result, Err(RegistryError::Duplicate(_))));
    }

    #[test]
    fn test_concurrent_get_or_create_builds_one_instrument() {
        let sink = Arc::new(FakeSink::default());
        let registry = Arc::new(Registry::new(sink.clone()));
        let key = key::resolve("t1", "requests", [("method", "GET")]);
        let labels = names(&["method", TENANT_LABEL]);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                let key = key.clone();
                let labels = labels.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| {
                            registry
                                .get_or_create(&key, MetricKind::Counter, &labels, &TypeConfig::default())
                                .unwrap()
                        })
                        .last()
                        .unwrap()
                })
            })
            .collect();
        let instruments: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(sink.made(), 1);
        assert!(instruments.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }
}

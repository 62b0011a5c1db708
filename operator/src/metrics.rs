use crate::Error;
use common::Extension;
use kube::ResourceExt;
use prometheus_client::{
    encoding::{text::encode, EncodeLabelSet},
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub reconcile: ReconcileMetrics,
    pub heartbeat: HeartbeatMetrics,
    pub admission: AdmissionMetrics,
    pub registry: Arc<Registry>,
}

impl Default for Metrics {
    fn default() -> Self {
        let mut registry = Registry::default();
        let reconcile = ReconcileMetrics::default().register(registry.sub_registry_with_prefix("extension_reconcile"));
        let heartbeat = HeartbeatMetrics::default().register(registry.sub_registry_with_prefix("heartbeat"));
        let admission = AdmissionMetrics::default().register(registry.sub_registry_with_prefix("admission"));
        Self {
            registry: Arc::new(registry),
            reconcile,
            heartbeat,
            admission,
        }
    }
}

impl Metrics {
    /// Render the registry in the OpenMetrics text format
    #[must_use]
    pub fn render(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::warn!("failed to encode metrics: {e}");
        }
        buffer
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub extension: String,
    pub error: String,
}

#[derive(Clone)]
pub struct ReconcileMetrics {
    pub runs: Counter,
    pub failures: Family<ErrorLabels, Counter>,
    pub duration: Histogram,
}

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self {
            runs: Counter::default(),
            failures: Family::<ErrorLabels, Counter>::default(),
            duration: Histogram::new([0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.].into_iter()),
        }
    }
}

impl ReconcileMetrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, r: &mut Registry) -> Self {
        r.register_with_unit(
            "duration",
            "reconcile duration",
            Unit::Seconds,
            self.duration.clone(),
        );
        r.register("failures", "reconciliation errors", self.failures.clone());
        r.register("runs", "reconciliations", self.runs.clone());
        self
    }

    pub fn reconcile_failure(&self, ext: &Extension, e: &Error) {
        self.failures
            .get_or_create(&ErrorLabels {
                extension: format!("{}/{}", ext.namespace().unwrap_or_default(), ext.name_any()),
                error: e.metric_label(),
            })
            .inc();
    }

    pub fn count_and_measure(&self) -> ReconcileMeasurer {
        self.runs.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.duration.clone(),
        }
    }
}

#[derive(Clone, Default)]
pub struct HeartbeatMetrics {
    pub renewals: Counter,
    pub failures: Counter,
}

impl HeartbeatMetrics {
    pub fn register(self, r: &mut Registry) -> Self {
        r.register("renewals", "successful heartbeat lease renewals", self.renewals.clone());
        r.register("failures", "failed heartbeat lease renewals", self.failures.clone());
        self
    }
}

#[derive(Clone, Default)]
pub struct AdmissionMetrics {
    pub requests: Counter,
    pub denied: Counter,
}

impl AdmissionMetrics {
    pub fn register(self, r: &mut Registry) -> Self {
        r.register("requests", "admission reviews received", self.requests.clone());
        r.register("denied", "admission reviews denied", self.denied.clone());
        self
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: Histogram,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.observe(duration);
    }
}

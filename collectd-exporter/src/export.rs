//! Snapshot of the store converted into exposable metric values.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use collectd_common::ValueKind;
use tracing::trace;

use crate::ingest::LastPush;
use crate::naming::{metric_help, metric_labels, metric_name};
use crate::store::SharedStore;

/// Exposition type of an exported metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

impl From<ValueKind> for MetricKind {
    fn from(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Gauge => MetricKind::Gauge,
            ValueKind::Counter | ValueKind::Derive => MetricKind::Counter,
        }
    }
}

/// One metric value ready for rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedMetric {
    pub name: String,
    pub help: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    pub kind: MetricKind,
}

/// Receiver of exported metrics.
pub trait MetricSink {
    fn emit(&mut self, metric: ExportedMetric);
}

impl MetricSink for Vec<ExportedMetric> {
    fn emit(&mut self, metric: ExportedMetric) {
        self.push(metric);
    }
}

/// Converts valid store entries into metrics on demand.
pub struct Exporter {
    store: SharedStore,
    last_push: Arc<LastPush>,
    prefix: String,
    default_labels: HashMap<String, String>,
}

impl Exporter {
    pub fn new(
        store: SharedStore,
        last_push: Arc<LastPush>,
        prefix: impl Into<String>,
        default_labels: HashMap<String, String>,
    ) -> Self {
        Self {
            store,
            last_push,
            prefix: prefix.into(),
            default_labels,
        }
    }

    /// Name of the liveness gauge.
    pub fn last_push_metric_name(&self) -> String {
        format!("{}_last_push_timestamp_seconds", self.prefix)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Export everything valid right now.
    ///
    /// Returns the number of metrics emitted, including the liveness gauge.
    pub fn export(&self, sink: &mut dyn MetricSink) -> usize {
        self.export_at(Instant::now(), sink)
    }

    /// Export everything valid at `now`.
    ///
    /// The liveness gauge is always emitted first.
    pub fn export_at(&self, now: Instant, sink: &mut dyn MetricSink) -> usize {
        sink.emit(ExportedMetric {
            name: self.last_push_metric_name(),
            help: "Unix timestamp of the last received collectd metrics push in seconds."
                .to_string(),
            labels: BTreeMap::new(),
            value: self.last_push.get(),
            kind: MetricKind::Gauge,
        });
        let mut emitted = 1;

        let entries = self.store.snapshot_at(now);
        trace!(entries = entries.len(), "Exporting snapshot");

        for entry in &entries {
            let sample = &entry.sample;
            let mut labels = metric_labels(sample);
            for (key, value) in &self.default_labels {
                labels
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }

            for (index, data_source) in sample.values.iter().enumerate() {
                sink.emit(ExportedMetric {
                    name: metric_name(&self.prefix, sample, index),
                    help: metric_help(sample, index),
                    labels: labels.clone(),
                    value: data_source.value.as_f64(),
                    kind: data_source.value.kind().into(),
                });
                emitted += 1;
            }
        }

        emitted
    }
}

/// Create a shareable exporter handle.
pub type SharedExporter = Arc<Exporter>;

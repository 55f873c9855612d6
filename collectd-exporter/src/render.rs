//! Prometheus text exposition (format 0.0.4).

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt::Write;

use crate::export::{ExportedMetric, MetricKind, MetricSink};
use crate::ingest::IngestStats;
use crate::naming::sanitize_label_name;
use crate::network::ListenerStats;
use crate::store::StoreStats;

/// Content type of the text exposition format.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Exporter health numbers appended after the collected metrics.
#[derive(Debug, Clone, Default)]
pub struct SelfMetrics {
    pub entries: usize,
    pub store: StoreStats,
    pub ingest: IngestStats,
    pub listener: Option<ListenerStats>,
}

#[derive(Debug)]
struct Family {
    help: String,
    kind: MetricKind,
    series: BTreeMap<BTreeMap<String, String>, f64>,
}

/// Sink that collects metrics and renders them grouped by name.
///
/// Families are sorted by name and series by label set, so identical
/// input renders identically.
#[derive(Debug, Default)]
pub struct TextRenderer {
    families: BTreeMap<String, Family>,
    duplicates: usize,
    kind_conflicts: usize,
}

impl TextRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of series dropped because an identical series was already emitted.
    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    /// Number of series dropped because their name was already taken by a
    /// family of another type.
    pub fn kind_conflicts(&self) -> usize {
        self.kind_conflicts
    }

    /// Render collected metrics followed by the exporter's own metrics.
    pub fn finish(self, prefix: &str, self_metrics: Option<&SelfMetrics>) -> String {
        let mut output = String::with_capacity(self.families.len() * 128);

        for (name, family) in &self.families {
            writeln!(output, "# HELP {} {}", name, escape_help(&family.help)).ok();
            writeln!(output, "# TYPE {} {}", name, family.kind.as_str()).ok();
            for (labels, value) in &family.series {
                writeln!(output, "{}{} {}", name, format_labels(labels), format_value(*value)).ok();
            }
        }

        if let Some(stats) = self_metrics {
            write_self_metrics(&mut output, prefix, stats);
        }

        output
    }
}

impl MetricSink for TextRenderer {
    fn emit(&mut self, metric: ExportedMetric) {
        let labels: BTreeMap<String, String> = metric
            .labels
            .into_iter()
            .map(|(k, v)| (sanitize_label_name(&k), v))
            .collect();

        let family = self
            .families
            .entry(metric.name.clone())
            .or_insert_with(|| Family {
                help: metric.help,
                kind: metric.kind,
                series: BTreeMap::new(),
            });

        if family.kind != metric.kind {
            self.kind_conflicts += 1;
            tracing::warn!(
                metric = %metric.name,
                family_type = family.kind.as_str(),
                series_type = metric.kind.as_str(),
                "Dropping series whose type conflicts with its family"
            );
            return;
        }

        match family.series.entry(labels) {
            Entry::Vacant(slot) => {
                slot.insert(metric.value);
            }
            Entry::Occupied(_) => {
                self.duplicates += 1;
                tracing::debug!(metric = %metric.name, "Dropping duplicate series");
            }
        }
    }
}

fn write_self_metrics(output: &mut String, prefix: &str, stats: &SelfMetrics) {
    writeln!(
        output,
        "# HELP {prefix}_exporter_build_info A metric with a constant '1' value labeled by the exporter version."
    )
    .ok();
    writeln!(output, "# TYPE {prefix}_exporter_build_info gauge").ok();
    writeln!(
        output,
        "{prefix}_exporter_build_info{{version=\"{}\"}} 1",
        env!("CARGO_PKG_VERSION")
    )
    .ok();

    let mut metric = |suffix: &str, kind: MetricKind, help: &str, value: u64| {
        writeln!(output, "# HELP {}_exporter_{} {}", prefix, suffix, help).ok();
        writeln!(output, "# TYPE {}_exporter_{} {}", prefix, suffix, kind.as_str()).ok();
        writeln!(output, "{}_exporter_{} {}", prefix, suffix, value).ok();
    };

    metric(
        "entries",
        MetricKind::Gauge,
        "Number of identifiers held in the store.",
        stats.entries as u64,
    );
    metric(
        "samples_received_total",
        MetricKind::Counter,
        "Samples handed to the write path.",
        stats.ingest.samples_received,
    );
    metric(
        "samples_accepted_total",
        MetricKind::Counter,
        "Samples written to the store.",
        stats.ingest.samples_accepted,
    );
    metric(
        "samples_rejected_total",
        MetricKind::Counter,
        "Samples rejected as malformed or for capacity.",
        stats.ingest.samples_rejected,
    );
    metric(
        "values_skipped_total",
        MetricKind::Counter,
        "Values dropped because their type or number was unusable.",
        stats.ingest.values_skipped,
    );
    metric(
        "entries_evicted_total",
        MetricKind::Counter,
        "Expired entries removed by the sweeper.",
        stats.store.entries_evicted,
    );
    if let Some(listener) = &stats.listener {
        metric(
            "packets_received_total",
            MetricKind::Counter,
            "Datagrams received by the network listener.",
            listener.packets_received,
        );
        metric(
            "packets_rejected_total",
            MetricKind::Counter,
            "Datagrams rejected as malformed.",
            listener.packets_rejected,
        );
    }
}

/// Escape special characters in label values.
fn escape_label_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '"' => result.push_str("\\\""),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

/// Format a floating point value for Prometheus.
fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}

fn format_labels(labels: &BTreeMap<String, String>) -> String {
    if labels.is_empty() {
        return String::new();
    }

    let parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect();

    format!("{{{}}}", parts.join(","))
}

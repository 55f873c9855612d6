//! Metric names and labels derived from collectd samples.
//!
//! Both functions are pure: identical input always yields identical output,
//! which keeps scrape output stable between requests.

use std::collections::BTreeMap;

use collectd_common::{DEFAULT_DS_NAME, Sample};

/// Label carrying the sample's host.
pub const INSTANCE_LABEL: &str = "instance";

/// Label carrying the type instance when a plugin instance is also present.
pub const TYPE_LABEL: &str = "type";

/// Replace every character outside `[A-Za-z0-9_:]` with an underscore.
pub fn sanitize_metric_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Whether `name` matches `[a-zA-Z_:][a-zA-Z0-9_:]*`.
pub fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// Build the metric name for the data source at `index`.
///
/// `{prefix}_{type}` when the plugin equals the type or is a prefix of it,
/// `{prefix}_{plugin}_{type}` otherwise. The data-source name is appended
/// unless it is `value`, and counter-like kinds end in `_total`.
///
/// # Panics
///
/// Panics if `index` is out of bounds for the sample's values.
pub fn metric_name(prefix: &str, sample: &Sample, index: usize) -> String {
    let id = &sample.identifier;
    let data_source = &sample.values[index];

    let mut name = if id.type_name.starts_with(&id.plugin) {
        format!("{}_{}", prefix, id.type_name)
    } else {
        format!("{}_{}_{}", prefix, id.plugin, id.type_name)
    };

    if data_source.name != DEFAULT_DS_NAME {
        name.push('_');
        name.push_str(&data_source.name);
    }

    if data_source.value.kind().is_counter_like() {
        name.push_str("_total");
    }

    sanitize_metric_name(&name)
}

/// Build the label set shared by every value of a sample.
///
/// A plugin instance is labelled with the plugin name as key. A type
/// instance reuses that same key when there is no plugin instance, and is
/// labelled `type` otherwise. So `df/df_complex-used` and `df-used/df_complex`
/// both produce `df="used"`; this is the established exposition convention
/// and downstream queries rely on it.
pub fn metric_labels(sample: &Sample) -> BTreeMap<String, String> {
    let id = &sample.identifier;
    let mut labels = BTreeMap::new();

    if !id.plugin_instance.is_empty() {
        labels.insert(id.plugin.clone(), id.plugin_instance.clone());
    }

    if !id.type_instance.is_empty() {
        if id.plugin_instance.is_empty() {
            labels.insert(id.plugin.clone(), id.type_instance.clone());
        } else {
            labels.insert(TYPE_LABEL.to_string(), id.type_instance.clone());
        }
    }

    labels.insert(INSTANCE_LABEL.to_string(), id.host.clone());
    labels
}

/// Help text describing where a metric came from.
pub fn metric_help(sample: &Sample, index: usize) -> String {
    let data_source = &sample.values[index];
    format!(
        "Collectd exporter: '{}' Type: '{}' Dstype: '{}' Dsname: '{}'",
        sample.identifier.plugin,
        sample.identifier.type_name,
        data_source.value.kind(),
        data_source.name
    )
}

/// Sanitize a label name to be Prometheus-compatible.
///
/// Prometheus label names must match `[a-zA-Z_][a-zA-Z0-9_]*`.
pub fn sanitize_label_name(name: &str) -> String {
    let mut result: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();

    match result.chars().next() {
        None => "label".to_string(),
        Some(first) if first.is_ascii_digit() => {
            result.insert(0, '_');
            result
        }
        Some(_) => result,
    }
}

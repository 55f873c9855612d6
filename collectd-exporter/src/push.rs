//! collectd `write_http` JSON push ingestion.
//!
//! A push body is a JSON array of value lists:
//!
//! ```text
//! [{"values":[197141504,175136768],"dstypes":["counter","counter"],
//!   "dsnames":["read","write"],"time":1251533299.265,"interval":10.0,
//!   "host":"leeloo","plugin":"disk","plugin_instance":"sda",
//!   "type":"disk_octets","type_instance":""}]
//! ```
//!
//! A body that is not a JSON array is rejected whole. Inside the array each
//! value list is decoded and converted on its own: a malformed value list is
//! rejected alone, and an unusable value is dropped without discarding its
//! siblings.

use std::time::Duration;

use collectd_common::{Identifier, Sample, SampleError, Value, ValueKind, default_ds_names};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::ingest::{IngestReport, Ingestor};

/// Push payload errors.
#[derive(Debug, Error)]
pub enum PushError {
    #[error("invalid push payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// One value list as serialized by collectd's JSON format.
///
/// Missing fields decode to their zero value and are caught by sample
/// validation, so an incomplete value list fails on its own.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PushValueList {
    pub values: Vec<serde_json::Value>,
    pub dstypes: Vec<String>,
    pub dsnames: Vec<String>,
    /// Unix epoch seconds.
    pub time: f64,
    /// Seconds.
    pub interval: f64,
    pub host: String,
    pub plugin: String,
    pub plugin_instance: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub type_instance: String,
}

/// A converted value list and the values that had to be dropped.
#[derive(Debug, Clone)]
pub struct Converted {
    pub sample: Sample,
    pub skipped: Vec<String>,
}

impl PushValueList {
    fn identifier(&self) -> Identifier {
        Identifier {
            host: self.host.clone(),
            plugin: self.plugin.clone(),
            plugin_instance: self.plugin_instance.clone(),
            type_name: self.type_name.clone(),
            type_instance: self.type_instance.clone(),
        }
    }

    /// Convert to a sample, skipping values whose kind or number is unusable.
    pub fn into_sample(self) -> Result<Converted, SampleError> {
        let identifier = self.identifier();

        if self.dstypes.len() != self.values.len() {
            return Err(SampleError::LengthMismatch {
                id: identifier.to_string(),
                values: self.values.len(),
                names: self.dstypes.len(),
                what: "types",
            });
        }

        let names = if self.dsnames.is_empty() {
            default_ds_names(self.values.len())
        } else if self.dsnames.len() != self.values.len() {
            return Err(SampleError::LengthMismatch {
                id: identifier.to_string(),
                values: self.values.len(),
                names: self.dsnames.len(),
                what: "names",
            });
        } else {
            self.dsnames
        };

        let mut kept_values = Vec::with_capacity(self.values.len());
        let mut kept_names = Vec::with_capacity(self.values.len());
        let mut skipped = Vec::new();

        for ((raw, dstype), name) in self.values.iter().zip(&self.dstypes).zip(names) {
            match decode_value(raw, dstype) {
                Ok(value) => {
                    kept_values.push(value);
                    kept_names.push(name);
                }
                Err(reason) => skipped.push(format!("{identifier} {name}: {reason}")),
            }
        }

        let sample = Sample::from_parts(
            identifier,
            (self.time * 1000.0) as i64,
            seconds_to_duration(self.interval),
            kept_values,
            Some(kept_names),
        )?;

        Ok(Converted { sample, skipped })
    }
}

fn seconds_to_duration(secs: f64) -> Duration {
    if secs > 0.0 {
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
    } else {
        Duration::ZERO
    }
}

/// Decode one JSON number according to its collectd data-source type.
fn decode_value(raw: &serde_json::Value, dstype: &str) -> Result<Value, String> {
    let kind = ValueKind::parse(dstype).ok_or_else(|| format!("unknown value type {dstype:?}"))?;

    match kind {
        ValueKind::Gauge => match raw {
            // collectd writes NaN gauges as null.
            serde_json::Value::Null => Ok(Value::Gauge(f64::NAN)),
            _ => raw
                .as_f64()
                .map(Value::Gauge)
                .ok_or_else(|| format!("gauge value {raw} is not a number")),
        },
        ValueKind::Counter => raw
            .as_u64()
            .map(Value::Counter)
            .ok_or_else(|| format!("counter value {raw} is not an unsigned integer")),
        ValueKind::Derive => raw
            .as_i64()
            .map(Value::Derive)
            .ok_or_else(|| format!("derive value {raw} is not an integer")),
    }
}

/// Decode a push body into its value lists, each decoded independently.
pub fn decode_push(
    body: &[u8],
) -> Result<Vec<Result<PushValueList, serde_json::Error>>, PushError> {
    let items: Vec<serde_json::Value> = serde_json::from_slice(body)?;
    Ok(items.into_iter().map(serde_json::from_value).collect())
}

/// Decode a push body and write every usable sample.
///
/// Returns an error only when the body is not a JSON array.
pub fn ingest_push(ingestor: &Ingestor, body: &[u8]) -> Result<IngestReport, PushError> {
    let value_lists = decode_push(body)?;
    debug!(value_lists = value_lists.len(), "Processing push request");

    let mut report = IngestReport::default();

    for value_list in value_lists {
        let converted = match value_list {
            Ok(value_list) => value_list.into_sample().map_err(|e| e.to_string()),
            Err(e) => Err(format!("invalid value list: {e}")),
        };

        match converted {
            Ok(Converted { sample, skipped }) => {
                for reason in &skipped {
                    warn!(reason = %reason, "Skipping pushed value");
                }
                report.values_skipped += skipped.len();
                ingestor.record_skipped_values(skipped.len());
                report.errors.extend(skipped);

                match ingestor.write(sample) {
                    Ok(()) => report.accepted += 1,
                    Err(e) => {
                        warn!(error = %e, "Rejected pushed sample");
                        report.rejected += 1;
                        report.errors.push(e.to_string());
                    }
                }
            }
            Err(reason) => {
                warn!(error = %reason, "Rejected pushed value list");
                ingestor.record_rejected(1);
                report.rejected += 1;
                report.errors.push(reason);
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::LastPush;
    use crate::store::MetricStore;
    use std::sync::Arc;

    fn make_ingestor() -> Ingestor {
        Ingestor::new(Arc::new(MetricStore::new()), Arc::new(LastPush::new()))
    }

    const DISK: &str = r#"[{
        "values": [197141504, 175136768],
        "dstypes": ["counter", "counter"],
        "dsnames": ["read", "write"],
        "time": 1251533299.265,
        "interval": 10.0,
        "host": "leeloo.lan",
        "plugin": "disk",
        "plugin_instance": "sda",
        "type": "disk_octets",
        "type_instance": ""
    }]"#;

    #[test]
    fn test_decode_push() {
        let lists = decode_push(DISK.as_bytes()).unwrap();
        assert_eq!(lists.len(), 1);

        let converted = lists.into_iter().next().unwrap().unwrap().into_sample().unwrap();
        let sample = converted.sample;
        assert!(converted.skipped.is_empty());
        assert_eq!(sample.identifier.to_string(), "leeloo.lan/disk-sda/disk_octets");
        assert_eq!(sample.timestamp, 1_251_533_299_265);
        assert_eq!(sample.interval, Duration::from_secs(10));
        assert_eq!(sample.ds_name(1), "write");
        assert_eq!(sample.values[1].value, Value::Counter(175_136_768));
    }

    #[test]
    fn test_ingest_push_writes_samples() {
        let ingestor = make_ingestor();
        let report = ingest_push(&ingestor, DISK.as_bytes()).unwrap();

        assert_eq!(report.accepted, 1);
        assert!(report.is_complete());
        assert_eq!(ingestor.store().len(), 1);
        assert!(ingestor.last_push().get() > 0.0);
    }

    #[test]
    fn test_invalid_body_is_rejected_whole() {
        let ingestor = make_ingestor();
        assert!(ingest_push(&ingestor, b"not json").is_err());
        assert!(ingest_push(&ingestor, br#"{"values": []}"#).is_err());
        assert!(ingestor.store().is_empty());
    }

    #[test]
    fn test_unknown_dstype_skips_only_that_value() {
        let body = r#"[{
            "values": [1, 2.5],
            "dstypes": ["absolute", "gauge"],
            "dsnames": ["a", "b"],
            "interval": 10,
            "host": "h", "plugin": "p", "type": "t"
        }]"#;
        let ingestor = make_ingestor();
        let report = ingest_push(&ingestor, body.as_bytes()).unwrap();

        assert_eq!(report.accepted, 1);
        assert_eq!(report.values_skipped, 1);
        assert_eq!(ingestor.stats().values_skipped, 1);

        let entry = ingestor.store().snapshot().pop().unwrap();
        assert_eq!(entry.sample.values.len(), 1);
        assert_eq!(entry.sample.ds_name(0), "b");
        assert_eq!(entry.sample.values[0].value, Value::Gauge(2.5));
    }

    #[test]
    fn test_mismatched_lengths_reject_only_that_sample() {
        let body = r#"[
            {"values": [1, 2], "dstypes": ["gauge"], "interval": 10,
             "host": "h", "plugin": "bad", "type": "t"},
            {"values": [1], "dstypes": ["gauge"], "dsnames": ["value"], "interval": 10,
             "host": "h", "plugin": "good", "type": "t"}
        ]"#;
        let ingestor = make_ingestor();
        let report = ingest_push(&ingestor, body.as_bytes()).unwrap();

        assert_eq!(report.accepted, 1);
        assert_eq!(report.rejected, 1);
        assert_eq!(ingestor.stats().samples_rejected, 1);
        assert_eq!(ingestor.store().len(), 1);
    }

    #[test]
    fn test_all_values_skipped_rejects_sample() {
        let body = r#"[{"values": [-1], "dstypes": ["counter"], "interval": 10,
                        "host": "h", "plugin": "p", "type": "t"}]"#;
        let ingestor = make_ingestor();
        let report = ingest_push(&ingestor, body.as_bytes()).unwrap();

        assert_eq!(report.accepted, 0);
        assert_eq!(report.rejected, 1);
        assert!(ingestor.store().is_empty());
    }

    #[test]
    fn test_incomplete_value_list_rejected_alone() {
        let body = r#"[
            {"values": [1], "dstypes": ["gauge"], "dsnames": ["value"], "interval": 10,
             "host": "h", "plugin": "good", "type": "t"},
            {"values": [1], "dstypes": ["gauge"], "host": "h", "plugin": "no_interval", "type": "t"},
            {"dstypes": ["gauge"], "interval": 10, "host": "h", "plugin": "no_values", "type": "t"},
            {"values": [1], "dstypes": ["gauge"], "interval": 10, "host": "h"},
            {"values": [1], "dstypes": ["gauge"], "interval": "ten",
             "host": "h", "plugin": "bad_interval", "type": "t"},
            42
        ]"#;
        let ingestor = make_ingestor();
        let report = ingest_push(&ingestor, body.as_bytes()).unwrap();

        assert_eq!(report.accepted, 1);
        assert_eq!(report.rejected, 5);
        assert_eq!(ingestor.stats().samples_rejected, 5);

        let entry = ingestor.store().snapshot().pop().unwrap();
        assert_eq!(entry.sample.identifier.plugin, "good");
    }

    #[test]
    fn test_huge_interval_rejected() {
        let body = r#"[
            {"values": [1], "dstypes": ["gauge"], "interval": 1e19,
             "host": "h", "plugin": "huge", "type": "t"},
            {"values": [1], "dstypes": ["gauge"], "interval": 1e300,
             "host": "h", "plugin": "overflow", "type": "t"},
            {"values": [1], "dstypes": ["gauge"], "interval": 10,
             "host": "h", "plugin": "normal", "type": "t"}
        ]"#;
        let ingestor = make_ingestor();
        let report = ingest_push(&ingestor, body.as_bytes()).unwrap();

        assert_eq!(report.accepted, 1);
        assert_eq!(report.rejected, 2);
        assert!(report.errors[0].contains("one year"));
        assert_eq!(ingestor.store().len(), 1);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let body = r#"[{"values": [1], "dstypes": ["gauge"], "interval": 0,
                        "host": "h", "plugin": "p", "type": "t"}]"#;
        let ingestor = make_ingestor();
        let report = ingest_push(&ingestor, body.as_bytes()).unwrap();

        assert_eq!(report.rejected, 1);
        assert!(ingestor.store().is_empty());
    }

    #[test]
    fn test_decode_value_kinds() {
        use serde_json::json;

        assert_eq!(decode_value(&json!(1.5), "gauge"), Ok(Value::Gauge(1.5)));
        assert!(matches!(
            decode_value(&serde_json::Value::Null, "gauge"),
            Ok(Value::Gauge(v)) if v.is_nan()
        ));
        assert_eq!(decode_value(&json!(7), "counter"), Ok(Value::Counter(7)));
        assert_eq!(decode_value(&json!(-7), "derive"), Ok(Value::Derive(-7)));
        assert!(decode_value(&json!(-7), "counter").is_err());
        assert!(decode_value(&json!("x"), "gauge").is_err());
        assert!(decode_value(&json!(1), "absolute").is_err());
    }

    #[test]
    fn test_default_names_when_dsnames_missing() {
        let body = r#"[{"values": [1, 2], "dstypes": ["derive", "derive"], "interval": 10,
                        "host": "h", "plugin": "if", "type": "if_packets"}]"#;
        let list = decode_push(body.as_bytes()).unwrap().remove(0).unwrap();
        let sample = list.into_sample().unwrap().sample;

        assert_eq!(sample.ds_name(0), "0");
        assert_eq!(sample.ds_name(1), "1");
    }
}

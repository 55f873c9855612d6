use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Data-source name used by collectd when a type carries a single value.
pub const DEFAULT_DS_NAME: &str = "value";

/// Largest sampling interval accepted from an agent (one year).
pub const MAX_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Names one time series group: the collectd value-list identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier {
    pub host: String,
    pub plugin: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub plugin_instance: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub type_instance: String,
}

impl Identifier {
    /// Create an identifier without plugin or type instance.
    pub fn new(
        host: impl Into<String>,
        plugin: impl Into<String>,
        type_name: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            plugin: plugin.into(),
            type_name: type_name.into(),
            ..Default::default()
        }
    }

    /// Set the plugin instance.
    pub fn with_plugin_instance(mut self, instance: impl Into<String>) -> Self {
        self.plugin_instance = instance.into();
        self
    }

    /// Set the type instance.
    pub fn with_type_instance(mut self, instance: impl Into<String>) -> Self {
        self.type_instance = instance.into();
        self
    }
}

/// Canonical collectd form: `host/plugin[-plugin_instance]/type[-type_instance]`.
impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.plugin)?;
        if !self.plugin_instance.is_empty() {
            write!(f, "-{}", self.plugin_instance)?;
        }
        write!(f, "/{}", self.type_name)?;
        if !self.type_instance.is_empty() {
            write!(f, "-{}", self.type_instance)?;
        }
        Ok(())
    }
}

/// A typed data-source value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Value {
    /// Instantaneous value, replaced on every write.
    Gauge(f64),

    /// Monotonically increasing value; resets are possible.
    Counter(u64),

    /// Signed rate-like value, monotonic by convention only.
    Derive(i64),
}

impl Value {
    /// The kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Gauge(_) => ValueKind::Gauge,
            Value::Counter(_) => ValueKind::Counter,
            Value::Derive(_) => ValueKind::Derive,
        }
    }

    /// The value as a float, the representation every exposition format uses.
    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Gauge(v) => *v,
            Value::Counter(v) => *v as f64,
            Value::Derive(v) => *v as f64,
        }
    }
}

/// Value kind without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Gauge,
    Counter,
    Derive,
}

impl ValueKind {
    /// Counter and derive values accumulate; gauges do not.
    pub fn is_counter_like(&self) -> bool {
        match self {
            ValueKind::Gauge => false,
            ValueKind::Counter | ValueKind::Derive => true,
        }
    }

    /// Lowercase name as used by collectd's `dstypes`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Gauge => "gauge",
            ValueKind::Counter => "counter",
            ValueKind::Derive => "derive",
        }
    }

    /// Parse a collectd data-source type name (case-insensitive).
    ///
    /// Returns `None` for kinds this exporter does not model, such as `absolute`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "gauge" => Some(ValueKind::Gauge),
            "counter" => Some(ValueKind::Counter),
            "derive" => Some(ValueKind::Derive),
            _ => None,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One named value of a sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub name: String,
    pub value: Value,
}

impl DataSource {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Reasons a decoded sample is unusable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SampleError {
    #[error("sample {0} has no values")]
    NoValues(String),

    #[error("sample {0} has a non-positive interval")]
    NonPositiveInterval(String),

    #[error("sample {0} has an interval above the one year limit")]
    IntervalTooLarge(String),

    #[error("sample {0} has an empty plugin or type name")]
    MissingName(String),

    #[error("sample {id} has {values} values but {names} data-source {what}")]
    LengthMismatch {
        id: String,
        values: usize,
        names: usize,
        what: &'static str,
    },
}

/// One timestamped multi-value observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub identifier: Identifier,

    /// Unix epoch milliseconds reported by the agent.
    pub timestamp: i64,

    /// Sampling interval reported by the agent.
    pub interval: Duration,

    /// Values in data-source order.
    pub values: Vec<DataSource>,
}

impl Sample {
    /// Create a sample stamped with the current time.
    pub fn new(identifier: Identifier, interval: Duration, values: Vec<DataSource>) -> Self {
        Self {
            identifier,
            timestamp: current_timestamp_millis(),
            interval,
            values,
        }
    }

    /// Build a sample from parallel value and name lists.
    ///
    /// With no names, collectd's default naming applies: a single value is
    /// called `value`, several values are named by index.
    pub fn from_parts(
        identifier: Identifier,
        timestamp: i64,
        interval: Duration,
        values: Vec<Value>,
        names: Option<Vec<String>>,
    ) -> Result<Self, SampleError> {
        let names = match names {
            Some(names) if names.len() != values.len() => {
                return Err(SampleError::LengthMismatch {
                    id: identifier.to_string(),
                    values: values.len(),
                    names: names.len(),
                    what: "names",
                });
            }
            Some(names) => names,
            None => default_ds_names(values.len()),
        };

        let sample = Self {
            identifier,
            timestamp,
            interval,
            values: names
                .into_iter()
                .zip(values)
                .map(|(name, value)| DataSource { name, value })
                .collect(),
        };
        sample.validate()?;
        Ok(sample)
    }

    /// Check the invariants every stored sample must satisfy.
    pub fn validate(&self) -> Result<(), SampleError> {
        if self.values.is_empty() {
            return Err(SampleError::NoValues(self.identifier.to_string()));
        }
        if self.interval.is_zero() {
            return Err(SampleError::NonPositiveInterval(self.identifier.to_string()));
        }
        if self.interval > MAX_INTERVAL {
            return Err(SampleError::IntervalTooLarge(self.identifier.to_string()));
        }
        if self.identifier.plugin.is_empty() || self.identifier.type_name.is_empty() {
            return Err(SampleError::MissingName(self.identifier.to_string()));
        }
        Ok(())
    }

    /// Name of the data source at `index`, as collectd's `DSName` reports it.
    pub fn ds_name(&self, index: usize) -> &str {
        &self.values[index].name
    }
}

/// Data-source names collectd assumes when no types database is available.
pub fn default_ds_names(count: usize) -> Vec<String> {
    if count == 1 {
        vec![DEFAULT_DS_NAME.to_string()]
    } else {
        (0..count).map(|i| i.to_string()).collect()
    }
}

/// Get the current timestamp in milliseconds since Unix epoch.
///
/// Returns 0 if system time is before Unix epoch.
pub fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Get the current time as fractional seconds since Unix epoch.
pub fn current_timestamp_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_id() -> Identifier {
        Identifier::new("example.com", "cpu", "cpu")
            .with_plugin_instance("0")
            .with_type_instance("user")
    }

    #[test]
    fn test_identifier_display() {
        assert_eq!(cpu_id().to_string(), "example.com/cpu-0/cpu-user");
        assert_eq!(
            Identifier::new("h", "load", "load").to_string(),
            "h/load/load"
        );
    }

    #[test]
    fn test_value_kind() {
        assert_eq!(Value::Gauge(1.5).kind(), ValueKind::Gauge);
        assert_eq!(Value::Counter(1).kind(), ValueKind::Counter);
        assert_eq!(Value::Derive(-1).kind(), ValueKind::Derive);
        assert!(ValueKind::Counter.is_counter_like());
        assert!(ValueKind::Derive.is_counter_like());
        assert!(!ValueKind::Gauge.is_counter_like());
    }

    #[test]
    fn test_value_kind_parse() {
        assert_eq!(ValueKind::parse("GAUGE"), Some(ValueKind::Gauge));
        assert_eq!(ValueKind::parse("derive"), Some(ValueKind::Derive));
        assert_eq!(ValueKind::parse("absolute"), None);
        assert_eq!(ValueKind::parse(""), None);
    }

    #[test]
    fn test_value_as_f64() {
        assert_eq!(Value::Counter(42).as_f64(), 42.0);
        assert_eq!(Value::Derive(-7).as_f64(), -7.0);
        assert_eq!(Value::Gauge(0.25).as_f64(), 0.25);
    }

    #[test]
    fn test_from_parts_default_names() {
        let single = Sample::from_parts(
            cpu_id(),
            0,
            Duration::from_secs(10),
            vec![Value::Derive(0)],
            None,
        )
        .unwrap();
        assert_eq!(single.ds_name(0), "value");

        let multi = Sample::from_parts(
            cpu_id(),
            0,
            Duration::from_secs(10),
            vec![Value::Counter(1), Value::Counter(2)],
            None,
        )
        .unwrap();
        assert_eq!(multi.ds_name(0), "0");
        assert_eq!(multi.ds_name(1), "1");
    }

    #[test]
    fn test_from_parts_length_mismatch() {
        let err = Sample::from_parts(
            cpu_id(),
            0,
            Duration::from_secs(10),
            vec![Value::Gauge(1.0)],
            Some(vec!["rx".into(), "tx".into()]),
        )
        .unwrap_err();
        assert!(matches!(err, SampleError::LengthMismatch { .. }));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let sample = Sample::new(
            cpu_id(),
            Duration::ZERO,
            vec![DataSource::new("value", Value::Gauge(1.0))],
        );
        assert!(matches!(
            sample.validate(),
            Err(SampleError::NonPositiveInterval(_))
        ));
    }

    #[test]
    fn test_validate_rejects_huge_interval() {
        let values = vec![DataSource::new("value", Value::Gauge(1.0))];

        let at_limit = Sample::new(cpu_id(), MAX_INTERVAL, values.clone());
        assert!(at_limit.validate().is_ok());

        let sample = Sample::new(cpu_id(), Duration::from_secs(u64::MAX), values);
        assert!(matches!(
            sample.validate(),
            Err(SampleError::IntervalTooLarge(_))
        ));
    }

    #[test]
    fn test_validate_rejects_empty_values() {
        let sample = Sample::new(cpu_id(), Duration::from_secs(10), Vec::new());
        assert!(matches!(sample.validate(), Err(SampleError::NoValues(_))));
    }
}

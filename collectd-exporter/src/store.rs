//! Expiring store holding the latest sample per identifier.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use collectd_common::{Identifier, MAX_INTERVAL, Sample};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

/// Number of sampling intervals a sample stays valid without being refreshed.
/// Mirrors collectd's top-level `Timeout` setting.
pub const TIMEOUT_MULTIPLIER: u32 = 2;

/// Store write failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store is full ({max_entries} entries), rejecting {identifier}")]
    Full {
        max_entries: usize,
        identifier: String,
    },
}

/// The latest sample for one identifier and the instant it stops being valid.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub sample: Arc<Sample>,
    /// When the sample was written.
    pub arrived: Instant,
    /// Last instant at which the sample may be exported.
    pub deadline: Instant,
}

impl StoredEntry {
    fn new(sample: Sample, arrived: Instant) -> Self {
        // Intervals past the representable range are clamped to the longest
        // accepted interval.
        let deadline = arrived
            .checked_add(validity_window(sample.interval))
            .or_else(|| arrived.checked_add(validity_window(MAX_INTERVAL)))
            .unwrap_or(arrived);
        Self {
            sample: Arc::new(sample),
            arrived,
            deadline,
        }
    }

    /// Whether the entry may be exported at `now`.
    pub fn is_valid_at(&self, now: Instant) -> bool {
        now <= self.deadline
    }
}

/// How long a sample with the given interval stays valid.
pub fn validity_window(interval: Duration) -> Duration {
    interval.saturating_mul(TIMEOUT_MULTIPLIER)
}

/// Store statistics.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Entries removed by sweeps.
    pub entries_evicted: u64,
    /// Writes rejected because `max_entries` was reached.
    pub writes_rejected_full: u64,
}

/// Thread-safe store of one entry per identifier.
///
/// Writers and sweeps take the write lock; snapshots hold the read lock only
/// while cloning entry handles, so filtering and value conversion never
/// stall producers.
pub struct MetricStore {
    entries: RwLock<HashMap<Identifier, StoredEntry>>,
    max_entries: Option<usize>,
    stats: RwLock<StoreStats>,
}

impl MetricStore {
    /// Create an unbounded store.
    pub fn new() -> Self {
        Self::with_capacity_limit(None)
    }

    /// Create a store that rejects new identifiers beyond `max_entries`.
    pub fn with_capacity_limit(max_entries: Option<usize>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries,
            stats: RwLock::new(StoreStats::default()),
        }
    }

    /// Insert or replace the entry for the sample's identifier, arriving now.
    pub fn put(&self, sample: Sample) -> Result<(), StoreError> {
        self.put_at(sample, Instant::now())
    }

    /// Insert or replace the entry for the sample's identifier.
    ///
    /// Replacing an existing identifier always succeeds, even at capacity.
    pub fn put_at(&self, sample: Sample, now: Instant) -> Result<(), StoreError> {
        let key = sample.identifier.clone();
        let entry = StoredEntry::new(sample, now);

        let mut entries = self.entries.write();

        if let Some(max_entries) = self.max_entries
            && entries.len() >= max_entries
            && !entries.contains_key(&key)
        {
            drop(entries);
            self.stats.write().writes_rejected_full += 1;
            warn!(max_entries, identifier = %key, "Store full, rejecting new identifier");
            return Err(StoreError::Full {
                max_entries,
                identifier: key.to_string(),
            });
        }

        entries.insert(key, entry);
        Ok(())
    }

    /// All entries valid right now.
    pub fn snapshot(&self) -> Vec<StoredEntry> {
        self.snapshot_at(Instant::now())
    }

    /// All entries valid at `now`, judged against that single instant.
    ///
    /// The result is independent of the store and may be iterated freely.
    pub fn snapshot_at(&self, now: Instant) -> Vec<StoredEntry> {
        let copied: Vec<StoredEntry> = self.entries.read().values().cloned().collect();

        copied
            .into_iter()
            .filter(|entry| entry.is_valid_at(now))
            .collect()
    }

    /// Remove every entry whose deadline is strictly before `now`.
    ///
    /// Returns the number of entries removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();

        entries.retain(|_, entry| entry.deadline >= now);

        let removed = before - entries.len();
        let remaining = entries.len();
        drop(entries);

        if removed > 0 {
            debug!(removed, remaining, "Evicted expired entries");
            self.stats.write().entries_evicted += removed as u64;
        }

        removed
    }

    /// The entry stored for `identifier`, whether or not it is still valid.
    pub fn get(&self, identifier: &Identifier) -> Option<StoredEntry> {
        self.entries.read().get(identifier).cloned()
    }

    /// Number of physically stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get store statistics.
    pub fn stats(&self) -> StoreStats {
        self.stats.read().clone()
    }
}

impl Default for MetricStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a shareable store handle.
pub type SharedStore = Arc<MetricStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use collectd_common::{DataSource, Value};
    use std::collections::HashSet;
    use std::thread;

    fn make_sample(host: &str, interval_secs: u64, value: f64) -> Sample {
        Sample::new(
            Identifier::new(host, "load", "load"),
            Duration::from_secs(interval_secs),
            vec![DataSource::new("value", Value::Gauge(value))],
        )
    }

    #[test]
    fn test_put_replaces_entry() {
        let store = MetricStore::new();
        let now = Instant::now();

        for i in 0..5 {
            store.put_at(make_sample("h1", 10, i as f64), now).unwrap();
        }

        assert_eq!(store.len(), 1);
        let snapshot = store.snapshot_at(now);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].sample.values[0].value, Value::Gauge(4.0));
    }

    #[test]
    fn test_put_recomputes_deadline() {
        let store = MetricStore::new();
        let t0 = Instant::now();

        store.put_at(make_sample("h1", 10, 1.0), t0).unwrap();
        let later = t0 + Duration::from_secs(15);
        store.put_at(make_sample("h1", 10, 2.0), later).unwrap();

        let entry = store.get(&Identifier::new("h1", "load", "load")).unwrap();
        assert_eq!(entry.arrived, later);
        assert_eq!(entry.deadline, later + Duration::from_secs(20));
    }

    #[test]
    fn test_expiry_boundary() {
        let store = MetricStore::new();
        let t = Instant::now();
        store.put_at(make_sample("h1", 10, 1.0), t).unwrap();

        assert_eq!(store.snapshot_at(t + Duration::from_secs(19)).len(), 1);
        assert_eq!(store.snapshot_at(t + Duration::from_secs(20)).len(), 1);
        assert_eq!(
            store
                .snapshot_at(t + Duration::from_secs(20) + Duration::from_nanos(1))
                .len(),
            0
        );
        assert_eq!(store.snapshot_at(t + Duration::from_secs(21)).len(), 0);

        // Not swept yet, only filtered.
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_unrepresentable_interval_is_clamped() {
        let store = MetricStore::new();
        let t = Instant::now();
        let sample = Sample::new(
            Identifier::new("h", "load", "load"),
            Duration::from_secs(u64::MAX),
            vec![DataSource::new("value", Value::Gauge(1.0))],
        );
        store.put_at(sample, t).unwrap();

        let entry = store.snapshot_at(t).pop().unwrap();
        assert!(entry.deadline > t);
        assert!(entry.deadline <= t + validity_window(MAX_INTERVAL));
    }

    #[test]
    fn test_snapshot_uses_one_instant() {
        let store = MetricStore::new();
        let t = Instant::now();
        store.put_at(make_sample("short", 1, 1.0), t).unwrap();
        store.put_at(make_sample("long", 60, 1.0), t).unwrap();

        let hosts: HashSet<String> = store
            .snapshot_at(t + Duration::from_secs(5))
            .iter()
            .map(|e| e.sample.identifier.host.clone())
            .collect();
        assert_eq!(hosts, HashSet::from(["long".to_string()]));
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let store = MetricStore::new();
        let t = Instant::now();
        store.put_at(make_sample("short", 1, 1.0), t).unwrap();
        store.put_at(make_sample("long", 60, 1.0), t).unwrap();

        // Deadline equal to now is kept.
        assert_eq!(store.sweep(t + Duration::from_secs(2)), 0);
        assert_eq!(store.sweep(t + Duration::from_secs(3)), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.stats().entries_evicted, 1);
    }

    #[test]
    fn test_sweep_does_not_change_valid_set() {
        let store = MetricStore::new();
        let t = Instant::now();
        for (host, interval) in [("a", 1), ("b", 5), ("c", 10), ("d", 30)] {
            store.put_at(make_sample(host, interval, 0.0), t).unwrap();
        }

        let now = t + Duration::from_secs(15);
        let hosts = |entries: Vec<StoredEntry>| -> HashSet<String> {
            entries
                .into_iter()
                .map(|e| e.sample.identifier.host.clone())
                .collect()
        };

        let before = hosts(store.snapshot_at(now));
        store.sweep(now);
        let after = hosts(store.snapshot_at(now));

        assert_eq!(before, after);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_capacity_rejects_new_identifiers() {
        let store = MetricStore::with_capacity_limit(Some(2));
        let now = Instant::now();

        store.put_at(make_sample("a", 10, 0.0), now).unwrap();
        store.put_at(make_sample("b", 10, 0.0), now).unwrap();
        let err = store.put_at(make_sample("c", 10, 0.0), now).unwrap_err();
        assert!(matches!(err, StoreError::Full { max_entries: 2, .. }));

        // Existing identifiers can still be refreshed.
        store.put_at(make_sample("a", 10, 1.0), now).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.stats().writes_rejected_full, 1);
    }

    #[test]
    fn test_capacity_frees_after_sweep() {
        let store = MetricStore::with_capacity_limit(Some(1));
        let t = Instant::now();

        store.put_at(make_sample("a", 1, 0.0), t).unwrap();
        let later = t + Duration::from_secs(10);
        assert!(store.put_at(make_sample("b", 1, 0.0), later).is_err());

        store.sweep(later);
        store.put_at(make_sample("b", 1, 0.0), later).unwrap();
        assert!(store.get(&Identifier::new("b", "load", "load")).is_some());
    }

    #[test]
    fn test_concurrent_writers_lose_nothing() {
        let store = Arc::new(MetricStore::new());
        let mut handles = Vec::new();

        for writer in 0..8 {
            let store = store.clone();
            handles.push(thread::spawn(move || {
                for i in 0..100 {
                    let sample = make_sample(&format!("host-{writer}-{i}"), 60, i as f64);
                    store.put(sample).unwrap();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len(), 800);
        assert_eq!(store.snapshot().len(), 800);
    }

    #[test]
    fn test_snapshot_is_independent_of_later_writes() {
        let store = MetricStore::new();
        let now = Instant::now();
        store.put_at(make_sample("a", 10, 1.0), now).unwrap();

        let snapshot = store.snapshot_at(now);
        store.put_at(make_sample("a", 10, 2.0), now).unwrap();
        store.put_at(make_sample("b", 10, 3.0), now).unwrap();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].sample.values[0].value, Value::Gauge(1.0));
    }
}

//! The single write path shared by every ingestion transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use collectd_common::{Sample, SampleError, current_timestamp_secs};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, trace};

use crate::store::{SharedStore, StoreError};

/// Why a sample was not written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    #[error(transparent)]
    Invalid(#[from] SampleError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Unix time of the most recent successful write, in seconds.
///
/// Zero until the first write.
#[derive(Debug, Default)]
pub struct LastPush {
    bits: AtomicU64,
}

impl LastPush {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful write at `timestamp_secs`.
    pub fn set(&self, timestamp_secs: f64) {
        self.bits.store(timestamp_secs.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Ingestion statistics.
#[derive(Debug, Clone, Default)]
pub struct IngestStats {
    /// Samples handed to the write path.
    pub samples_received: u64,
    /// Samples written to the store.
    pub samples_accepted: u64,
    /// Samples rejected as malformed or for capacity.
    pub samples_rejected: u64,
    /// Individual values dropped by a decoder (unknown kind, bad number).
    pub values_skipped: u64,
}

/// Outcome of writing a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub accepted: usize,
    pub rejected: usize,
    /// Values dropped from samples that were otherwise written.
    pub values_skipped: usize,
    pub errors: Vec<String>,
}

impl IngestReport {
    /// Whether every item of the batch was written.
    pub fn is_complete(&self) -> bool {
        self.rejected == 0
    }
}

/// Validates samples, writes them to the store and keeps the liveness value.
pub struct Ingestor {
    store: SharedStore,
    last_push: Arc<LastPush>,
    stats: RwLock<IngestStats>,
}

impl Ingestor {
    pub fn new(store: SharedStore, last_push: Arc<LastPush>) -> Self {
        Self {
            store,
            last_push,
            stats: RwLock::new(IngestStats::default()),
        }
    }

    /// Write one sample.
    pub fn write(&self, sample: Sample) -> Result<(), IngestError> {
        self.stats.write().samples_received += 1;

        let result = match sample.validate() {
            Ok(()) => {
                trace!(
                    identifier = %sample.identifier,
                    values = sample.values.len(),
                    "Writing sample"
                );
                self.store.put(sample).map_err(IngestError::from)
            }
            Err(e) => Err(e.into()),
        };

        match &result {
            Ok(()) => {
                self.last_push.set(current_timestamp_secs());
                self.stats.write().samples_accepted += 1;
            }
            Err(e) => {
                debug!(error = %e, "Sample rejected");
                self.stats.write().samples_rejected += 1;
            }
        }

        result
    }

    /// Write samples in order, continuing past individual failures.
    pub fn write_batch(&self, samples: impl IntoIterator<Item = Sample>) -> IngestReport {
        let mut report = IngestReport::default();

        for sample in samples {
            match self.write(sample) {
                Ok(()) => report.accepted += 1,
                Err(e) => {
                    report.rejected += 1;
                    report.errors.push(e.to_string());
                }
            }
        }

        report
    }

    /// Count a sample a decoder refused before it reached the write path.
    pub fn record_rejected(&self, count: usize) {
        let mut stats = self.stats.write();
        stats.samples_received += count as u64;
        stats.samples_rejected += count as u64;
    }

    /// Count values a decoder dropped from otherwise valid samples.
    pub fn record_skipped_values(&self, count: usize) {
        if count > 0 {
            self.stats.write().values_skipped += count as u64;
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn last_push(&self) -> &Arc<LastPush> {
        &self.last_push
    }

    /// Get ingestion statistics.
    pub fn stats(&self) -> IngestStats {
        self.stats.read().clone()
    }
}

/// Create a shareable ingestor handle.
pub type SharedIngestor = Arc<Ingestor>;

//! Periodic eviction of expired store entries.

use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::store::SharedStore;

/// Sweep period used when none is configured.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Spawn a task sweeping `store` every `period` until shutdown.
pub fn spawn_sweeper(
    store: SharedStore,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; nothing can have expired yet.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let removed = store.sweep(Instant::now());
                    tracing::trace!(removed, remaining = store.len(), "Sweep finished");
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::debug!("Sweeper stopping");
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MetricStore;
    use collectd_common::{DataSource, Identifier, Sample, Value};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_sweeper_evicts_and_stops() {
        let store = Arc::new(MetricStore::new());
        store
            .put(Sample::new(
                Identifier::new("h", "load", "load"),
                Duration::from_millis(10),
                vec![DataSource::new("value", Value::Gauge(1.0))],
            ))
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_sweeper(store.clone(), Duration::from_millis(10), shutdown_rx);

        for _ in 0..100 {
            if store.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.is_empty());
        assert_eq!(store.stats().entries_evicted, 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}

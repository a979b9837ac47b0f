/// Metric aggregation table.
///
/// Architecture:
///   - `record()` folds one worker message into its `(station, window)` bucket
///   - `drain_snapshot()` swaps the whole table out for an empty one
///   - the publish tick drains once per interval and hands the snapshot to
///     the change feed
///
/// Record and drain each take the table lock exactly once, so a message is
/// reported in exactly one snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use bench_protocol::bucket::window_start;
use bench_protocol::metrics::{Bucket, MetricMessage, Snapshot};

pub struct MetricAggregator {
    width_ms: u64,
    table: Mutex<Snapshot>,
    /// Messages recorded since startup
    total_messages: AtomicU64,
}

impl MetricAggregator {
    pub fn new(width_ms: u64) -> Self {
        Self {
            width_ms: width_ms.max(1),
            table: Mutex::new(Snapshot::default()),
            total_messages: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Snapshot> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn width_ms(&self) -> u64 {
        self.width_ms
    }

    pub fn record(&self, message: &MetricMessage, receive_ms: u64) {
        let mut table = self.lock();
        self.fold(&mut table, message, receive_ms);
    }

    /// Record a whole ingestion batch under one lock acquisition.
    pub fn record_batch(&self, messages: &[MetricMessage], receive_ms: u64) {
        if messages.is_empty() {
            return;
        }
        let mut table = self.lock();
        for message in messages {
            self.fold(&mut table, message, receive_ms);
        }
    }

    fn fold(&self, table: &mut Snapshot, message: &MetricMessage, receive_ms: u64) {
        let window = window_start(message.timestamp_ms, self.width_ms);
        let station = table.stations.entry(message.station_id.clone()).or_default();
        if message.coordinates.is_some() {
            station.coordinates = message.coordinates;
        }
        station
            .buckets
            .entry(window)
            .or_insert_with(|| Bucket::new(self.width_ms))
            .add(&message.concentrations, message.latency_ms(receive_ms));
        self.total_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Take everything accumulated since the previous drain.
    pub fn drain_snapshot(&self) -> Snapshot {
        std::mem::take(&mut *self.lock())
    }

    pub fn total_messages(&self) -> u64 {
        self.total_messages.load(Ordering::Relaxed)
    }

    /// Buckets waiting for the next drain.
    pub fn pending_buckets(&self) -> usize {
        self.lock().stations.values().map(|s| s.buckets.len()).sum()
    }
}

/// Metric messages emitted by workers and the bucket/snapshot types the
/// control plane aggregates them into.
///
/// Every message carries a station id, its occurrence timestamp and a fixed
/// set of pollutant concentrations. Latency is derived on receipt as
/// `receive_time - timestamp`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Every metric tracked per bucket, in column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Pm25,
    Pm10,
    No2,
    Co,
    O3,
    So2,
    Latency,
}

impl Metric {
    pub const ALL: [Metric; 7] = [
        Metric::Pm25,
        Metric::Pm10,
        Metric::No2,
        Metric::Co,
        Metric::O3,
        Metric::So2,
        Metric::Latency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Pm25 => "pm25",
            Metric::Pm10 => "pm10",
            Metric::No2 => "no2",
            Metric::Co => "co",
            Metric::O3 => "o3",
            Metric::So2 => "so2",
            Metric::Latency => "latency",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub long: f64,
}

/// Pollutant readings of a single observation. Any field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Concentrations {
    #[serde(default)]
    pub pm25: Option<f64>,
    #[serde(default)]
    pub pm10: Option<f64>,
    #[serde(default)]
    pub no2: Option<f64>,
    #[serde(default)]
    pub co: Option<f64>,
    #[serde(default)]
    pub o3: Option<f64>,
    #[serde(default)]
    pub so2: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricMessage {
    pub station_id: String,
    /// Occurrence time, Unix milliseconds
    pub timestamp_ms: u64,
    #[serde(default)]
    pub coordinates: Option<Coordinates>,
    #[serde(default)]
    pub concentrations: Concentrations,
}

impl MetricMessage {
    /// Latency of this message if it was received at `receive_ms`.
    pub fn latency_ms(&self, receive_ms: u64) -> f64 {
        receive_ms as f64 - self.timestamp_ms as f64
    }
}

/// Running sums for one `(station, window)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub pm25: f64,
    pub pm10: f64,
    pub no2: f64,
    pub co: f64,
    pub o3: f64,
    pub so2: f64,
    pub latency: f64,
    pub count: u64,
    pub size_ms: u64,
}

impl Bucket {
    pub fn new(size_ms: u64) -> Self {
        Self {
            pm25: 0.0,
            pm10: 0.0,
            no2: 0.0,
            co: 0.0,
            o3: 0.0,
            so2: 0.0,
            latency: 0.0,
            count: 0,
            size_ms,
        }
    }

    /// Add one observation. Missing readings contribute zero.
    pub fn add(&mut self, c: &Concentrations, latency_ms: f64) {
        self.pm25 += c.pm25.unwrap_or(0.0);
        self.pm10 += c.pm10.unwrap_or(0.0);
        self.no2 += c.no2.unwrap_or(0.0);
        self.co += c.co.unwrap_or(0.0);
        self.o3 += c.o3.unwrap_or(0.0);
        self.so2 += c.so2.unwrap_or(0.0);
        self.latency += latency_ms;
        self.count += 1;
    }

    /// Fold another partial bucket for the same window into this one.
    /// `size_ms` is assumed equal and kept as is.
    pub fn merge(&mut self, other: &Bucket) {
        self.pm25 += other.pm25;
        self.pm10 += other.pm10;
        self.no2 += other.no2;
        self.co += other.co;
        self.o3 += other.o3;
        self.so2 += other.so2;
        self.latency += other.latency;
        self.count += other.count;
    }

    pub fn sum(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Pm25 => self.pm25,
            Metric::Pm10 => self.pm10,
            Metric::No2 => self.no2,
            Metric::Co => self.co,
            Metric::O3 => self.o3,
            Metric::So2 => self.so2,
            Metric::Latency => self.latency,
        }
    }

    /// Window mean of `metric`, `None` for an empty bucket.
    pub fn average(&self, metric: Metric) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        Some(self.sum(metric) / self.count as f64)
    }

    /// Messages per second over the window.
    pub fn throughput(&self) -> f64 {
        if self.size_ms == 0 {
            return 0.0;
        }
        self.count as f64 / self.size_ms as f64 * 1000.0
    }
}

/// All buckets of one station in a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StationAggregate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    /// Keyed by window start (Unix ms)
    pub buckets: BTreeMap<u64, Bucket>,
}

/// Drained aggregation table: station → window start → bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub stations: BTreeMap<String, StationAggregate>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.stations.values().all(|s| s.buckets.is_empty())
    }

    /// Total messages represented by this snapshot.
    pub fn message_count(&self) -> u64 {
        self.stations
            .values()
            .flat_map(|s| s.buckets.values())
            .map(|b| b.count)
            .sum()
    }

    pub fn bucket(&self, station: &str, window_start_ms: u64) -> Option<&Bucket> {
        self.stations.get(station)?.buckets.get(&window_start_ms)
    }
}

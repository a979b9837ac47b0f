/// Client-side reconstruction of aggregate snapshots.
///
/// Dashboards receive one snapshot per publish tick. A window can be split
/// across two publishes (messages for it keep arriving after a drain), so the
/// dataset merges every `(window, station)` contribution instead of replacing
/// it. Nothing is evicted while a run is in progress; the visible range only
/// filters what is rendered. The dataset is reset when a new run's countdown
/// arrives and exported as CSV when the run completes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::Path;

use crate::bucket::window_key;
use crate::experiment::Experiment;
use crate::feed::FeedEvent;
use crate::metrics::{Bucket, Metric, Snapshot};

/// One rendered point of a series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub window_start_ms: u64,
    pub value: f64,
}

/// Per-station series, ordered by window start.
pub type SeriesMap = BTreeMap<String, Vec<Point>>;

/// What applying a feed event did to the dataset.
#[derive(Debug, Clone, PartialEq)]
pub enum DatasetUpdate {
    /// A new run started; the dataset was cleared.
    Reset { experiment_id: String, remaining_secs: u64 },
    /// Aggregates were merged into this many `(window, station)` cells.
    Merged { cells: usize },
    /// The run completed; the dataset is ready for export.
    Completed(Experiment),
    /// Event carries nothing for the dataset (experiment list).
    Ignored,
}

#[derive(Debug, Clone, Default)]
pub struct ClientDataset {
    /// window start → station → merged bucket
    windows: BTreeMap<u64, BTreeMap<String, Bucket>>,
}

impl ClientDataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Number of distinct windows held.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn reset(&mut self) {
        self.windows.clear();
    }

    /// Merge a snapshot. Returns the number of cells touched.
    pub fn ingest(&mut self, snapshot: &Snapshot) -> usize {
        let mut cells = 0;
        for (station, aggregate) in &snapshot.stations {
            for (&window, bucket) in &aggregate.buckets {
                let row = self.windows.entry(window).or_default();
                match row.get_mut(station) {
                    Some(existing) => existing.merge(bucket),
                    None => {
                        row.insert(station.clone(), *bucket);
                    }
                }
                cells += 1;
            }
        }
        cells
    }

    /// Apply one change-feed event.
    pub fn handle(&mut self, event: &FeedEvent) -> DatasetUpdate {
        match event {
            FeedEvent::Countdown {
                experiment_id,
                remaining_secs,
            } => {
                self.reset();
                DatasetUpdate::Reset {
                    experiment_id: experiment_id.clone(),
                    remaining_secs: *remaining_secs,
                }
            }
            FeedEvent::Aggregates { snapshot } => DatasetUpdate::Merged {
                cells: self.ingest(snapshot),
            },
            FeedEvent::Completed { experiment } => DatasetUpdate::Completed(experiment.clone()),
            FeedEvent::Experiments { .. } => DatasetUpdate::Ignored,
        }
    }

    pub fn get(&self, window_start_ms: u64, station: &str) -> Option<&Bucket> {
        self.windows.get(&window_start_ms)?.get(station)
    }

    /// Every station seen in any window, sorted.
    pub fn stations(&self) -> BTreeSet<String> {
        self.windows
            .values()
            .flat_map(|row| row.keys().cloned())
            .collect()
    }

    pub fn latest_window(&self) -> Option<u64> {
        self.windows.keys().next_back().copied()
    }

    /// Sliding `[from, to)` range of width `span_ms` that ends just after the
    /// newest window.
    pub fn visible_range(&self, span_ms: u64) -> Option<(u64, u64)> {
        let to = self.latest_window()? + 1;
        Some((to.saturating_sub(span_ms), to))
    }

    /// Window mean of `metric` per station for windows in `[from, to)`.
    pub fn metric_series(&self, metric: Metric, from: u64, to: u64) -> SeriesMap {
        self.series(from, to, |b| b.average(metric))
    }

    /// Messages per second per station for windows in `[from, to)`.
    pub fn throughput_series(&self, from: u64, to: u64) -> SeriesMap {
        self.series(from, to, |b| Some(b.throughput()))
    }

    fn series(&self, from: u64, to: u64, value: impl Fn(&Bucket) -> Option<f64>) -> SeriesMap {
        let mut out = SeriesMap::new();
        for (&window, row) in self.windows.range(from..to.max(from)) {
            for (station, bucket) in row {
                if let Some(v) = value(bucket) {
                    out.entry(station.clone()).or_default().push(Point {
                        window_start_ms: window,
                        value: v,
                    });
                }
            }
        }
        out
    }

    /// Render the whole dataset as CSV, one row per window in ascending order.
    ///
    /// Columns: `time`, `<station>_throughput`..., `total_throughput`,
    /// `<station>_latency`..., `average_latency`. A station with no bucket in a
    /// row leaves its cell empty and is left out of the total and the average.
    pub fn to_csv(&self) -> String {
        let stations: Vec<String> = self.stations().into_iter().collect();
        let mut out = String::new();

        let mut header = vec!["time".to_string()];
        header.extend(stations.iter().map(|s| format!("{s}_throughput")));
        header.push("total_throughput".into());
        header.extend(stations.iter().map(|s| format!("{s}_latency")));
        header.push("average_latency".into());
        push_record(&mut out, &header);

        for (&window, row) in &self.windows {
            let mut record = Vec::with_capacity(header.len());
            record.push(window_key(window));

            let mut total = 0.0;
            for station in &stations {
                match row.get(station) {
                    Some(b) => {
                        let t = b.throughput();
                        total += t;
                        record.push(t.to_string());
                    }
                    None => record.push(String::new()),
                }
            }
            record.push(total.to_string());

            let mut latency_sum = 0.0;
            let mut latency_n = 0usize;
            for station in &stations {
                match row.get(station).and_then(|b| b.average(Metric::Latency)) {
                    Some(l) => {
                        latency_sum += l;
                        latency_n += 1;
                        record.push(l.to_string());
                    }
                    None => record.push(String::new()),
                }
            }
            if latency_n > 0 {
                record.push((latency_sum / latency_n as f64).to_string());
            } else {
                record.push(String::new());
            }

            push_record(&mut out, &record);
        }

        out
    }

    pub fn write_csv(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.to_csv())
    }
}

/// `<Broker>-<producers>-<consumers>-<name>.csv`, with path-hostile
/// characters in the name replaced.
pub fn csv_file_name(experiment: &Experiment) -> String {
    let name: String = experiment
        .name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!(
        "{}-{}-{}-{}.csv",
        experiment.broker.display_name(),
        experiment.producers,
        experiment.consumers,
        name
    )
}

fn push_record(out: &mut String, fields: &[String]) {
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        if field.contains([',', '"', '\n']) {
            let _ = write!(out, "\"{}\"", field.replace('"', "\"\""));
        } else {
            out.push_str(field);
        }
    }
    out.push('\n');
}

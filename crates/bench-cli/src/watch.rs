/// Live subscription to the control plane's change feed.
///
/// Runs on a blocking thread (sync tungstenite) and drives a `ClientDataset`:
/// a countdown resets it, aggregates are merged, and a completion writes the
/// CSV artifact into the output directory. Reconnects with backoff while the
/// control plane is unreachable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};
use tungstenite::{connect, Message};

use bench_protocol::bucket::window_key;
use bench_protocol::dataset::{csv_file_name, ClientDataset, DatasetUpdate};
use bench_protocol::feed::FeedEvent;
use bench_protocol::metrics::Metric;
use bench_protocol::FEED_PATH;

pub struct WatchOptions {
    pub base_url: String,
    pub out_dir: PathBuf,
    pub span_ms: u64,
    /// Stop after the first CSV is written
    pub once: bool,
}

/// Headline numbers of the newest window in the visible range.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveSummary {
    pub window_start_ms: u64,
    pub stations: usize,
    pub total_throughput: f64,
    pub average_latency: Option<f64>,
}

/// `http(s)://host` → `ws(s)://host/ws/feed`
pub fn feed_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let ws = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{base}")
    };
    format!("{ws}{FEED_PATH}")
}

pub fn summarize(dataset: &ClientDataset, span_ms: u64) -> Option<LiveSummary> {
    let (from, to) = dataset.visible_range(span_ms)?;
    let latest = dataset.latest_window()?;

    let throughput = dataset.throughput_series(from, to);
    let latency = dataset.metric_series(Metric::Latency, from, to);

    let at_latest = |series: &bench_protocol::dataset::SeriesMap| -> Vec<f64> {
        series
            .values()
            .filter_map(|points| points.last())
            .filter(|p| p.window_start_ms == latest)
            .map(|p| p.value)
            .collect()
    };

    let throughputs = at_latest(&throughput);
    let latencies = at_latest(&latency);
    let average_latency = if latencies.is_empty() {
        None
    } else {
        Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
    };

    Some(LiveSummary {
        window_start_ms: latest,
        stations: throughputs.len(),
        total_throughput: throughputs.iter().sum(),
        average_latency,
    })
}

/// Apply one feed event and report it. Returns the CSV path when a run
/// completed and its artifact was written.
pub fn apply_event(
    dataset: &mut ClientDataset,
    event: &FeedEvent,
    opts: &WatchOptions,
) -> anyhow::Result<Option<PathBuf>> {
    match dataset.handle(event) {
        DatasetUpdate::Reset {
            experiment_id,
            remaining_secs,
        } => {
            println!("▶ {experiment_id} started, {remaining_secs}s remaining");
        }
        DatasetUpdate::Merged { cells } => {
            debug!(cells, windows = dataset.len(), "merged aggregates");
            if let Some(s) = summarize(dataset, opts.span_ms) {
                let latency = s
                    .average_latency
                    .map(|l| format!("{l:.1}ms"))
                    .unwrap_or_else(|| "-".into());
                println!(
                    "  {}  stations: {:<3} throughput: {:>10.1} msg/s  latency: {}",
                    window_key(s.window_start_ms),
                    s.stations,
                    s.total_throughput,
                    latency
                );
            }
        }
        DatasetUpdate::Completed(experiment) => {
            let path = opts.out_dir.join(csv_file_name(&experiment));
            if dataset.is_empty() {
                warn!(experiment = %experiment.id, "run completed without any aggregates");
            }
            dataset.write_csv(&path)?;
            println!("■ {} completed, wrote {}", experiment.id, path.display());
            return Ok(Some(path));
        }
        DatasetUpdate::Ignored => {
            if let FeedEvent::Experiments { experiments } = event {
                for e in experiments.iter().filter(|e| e.status.is_running()) {
                    println!("  {} [{}] {}", e.id, e.status.label(), e.name);
                }
            }
        }
    }
    Ok(None)
}

pub fn run(opts: WatchOptions) -> anyhow::Result<()> {
    let url = feed_url(&opts.base_url);
    let mut dataset = ClientDataset::new();
    let mut backoff = Duration::from_secs(1);
    let max_backoff = Duration::from_secs(8);

    ensure_dir(&opts.out_dir)?;

    loop {
        info!(url = %url, "Connecting to change feed");

        match connect(&url) {
            Ok((mut socket, _response)) => {
                println!("Watching {url}");
                backoff = Duration::from_secs(1); // reset on success

                loop {
                    match socket.read() {
                        Ok(Message::Text(text)) => match serde_json::from_str::<FeedEvent>(&text) {
                            Ok(event) => {
                                if apply_event(&mut dataset, &event, &opts)?.is_some() && opts.once {
                                    let _ = socket.close(None);
                                    return Ok(());
                                }
                            }
                            Err(e) => debug!("Failed to parse feed event: {}", e),
                        },
                        Ok(Message::Ping(data)) => {
                            let _ = socket.send(Message::Pong(data));
                        }
                        Ok(Message::Close(_)) => {
                            info!("Control plane closed the feed");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("Feed read error: {}", e);
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                debug!("Cannot connect to control plane: {}", e);
            }
        }

        // Backoff before reconnecting
        std::thread::sleep(backoff);
        backoff = (backoff * 2).min(max_backoff);
    }
}

fn ensure_dir(dir: &Path) -> anyhow::Result<()> {
    if !dir.as_os_str().is_empty() {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

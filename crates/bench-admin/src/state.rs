/// Shared application state for the control plane.
/// Everything a handler or background task needs hangs off one cloneable
/// handle passed through axum's State extractor.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::aggregator::MetricAggregator;
use crate::api::config::BenchConfig;
use crate::dispatcher::Dispatcher;
use crate::feed::{ChangeFeed, FeedVersions};
use crate::launcher::WorkerLauncher;
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct AppState {
    pub inner: Arc<AppStateInner>,
}

pub struct AppStateInner {
    pub start_time: Instant,
    pub config: BenchConfig,
    pub scheduler: Arc<Scheduler>,
    pub aggregator: Arc<MetricAggregator>,
    pub feed: ChangeFeed,
    pub dispatcher: Dispatcher,
    /// Connected feed WebSocket clients
    pub ws_client_count: AtomicU32,
}

impl AppState {
    pub fn new(config: BenchConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let versions = Arc::new(FeedVersions::default());
        let scheduler = Arc::new(Scheduler::new(
            versions.clone(),
            config.scheduler.launch_failure_policy,
            config.scheduler.completion_grace_secs,
        ));
        let aggregator = Arc::new(MetricAggregator::new(config.aggregation.window_ms));
        let feed = ChangeFeed::new(versions, scheduler.clone(), aggregator.clone());
        let dispatcher = Dispatcher::new(scheduler.clone(), launcher);

        Self {
            inner: Arc::new(AppStateInner {
                start_time: Instant::now(),
                config,
                scheduler,
                aggregator,
                feed,
                dispatcher,
                ws_client_count: AtomicU32::new(0),
            }),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }

    pub fn ws_clients(&self) -> u32 {
        self.inner.ws_client_count.load(Ordering::Relaxed)
    }
}

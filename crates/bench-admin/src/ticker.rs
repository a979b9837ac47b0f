/// Background interval loops.
///
/// Two independent ticks, each spawned as a tokio task from main:
///   publisher: drains the aggregator and broadcasts the snapshot
///   scheduler: runs the scheduler's deadline watchdog
///
/// The loops never return under normal operation.

use tracing::debug;

use bench_protocol::now_ms;

use crate::state::AppState;

pub async fn run_publisher(state: AppState) {
    let mut interval = tokio::time::interval(state.inner.config.feed.publish_interval());

    loop {
        interval.tick().await;

        if let Some(event) = state.inner.feed.publish_snapshot() {
            debug!(kind = event.kind(), observers = state.inner.feed.observer_count(), "snapshot tick");
        }
    }
}

pub async fn run_scheduler_tick(state: AppState) {
    let mut interval = tokio::time::interval(state.inner.config.scheduler.tick_interval());

    loop {
        interval.tick().await;

        let intents = state.inner.scheduler.tick(now_ms());
        if !intents.is_empty() {
            state.inner.dispatcher.dispatch(intents);
        }
    }
}

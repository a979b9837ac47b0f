use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use bench_protocol::now_ms;

use crate::state::AppState;

pub async fn get_status(State(state): State<AppState>) -> Json<Value> {
    let scheduler = &state.inner.scheduler;
    let queue = scheduler.queue_state();
    let running = scheduler.running();
    let countdown = scheduler.countdown(now_ms()).map(|(_, secs)| secs);

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.uptime_secs(),
        "experiments": scheduler.list().len(),
        "running": running.as_ref().map(|slot| json!({
            "experiment_id": slot.experiment_id,
            "run": slot.run,
            "remaining_secs": countdown,
            "pending_stop": slot.pending_stop,
        })),
        "queue": queue.queue,
        "launch_failure_policy": scheduler.policy(),
        "total_messages": state.inner.aggregator.total_messages(),
        "ws_clients": state.ws_clients(),
    }))
}

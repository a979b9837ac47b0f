use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use bench_protocol::metrics::MetricMessage;
use bench_protocol::now_ms;

use crate::state::AppState;

/// POST /api/metrics: ingest a batch of worker metric messages.
pub async fn ingest_metrics(
    State(state): State<AppState>,
    Json(messages): Json<Vec<MetricMessage>>,
) -> (StatusCode, Json<Value>) {
    let receive_ms = now_ms();
    state.inner.aggregator.record_batch(&messages, receive_ms);
    (StatusCode::ACCEPTED, Json(json!({ "accepted": messages.len() })))
}

/// GET /api/metrics: aggregation counters.
pub async fn get_metrics_summary(State(state): State<AppState>) -> Json<Value> {
    let agg = &state.inner.aggregator;
    Json(json!({
        "window_ms": agg.width_ms(),
        "total_messages": agg.total_messages(),
        "pending_buckets": agg.pending_buckets(),
    }))
}

pub mod config;
pub mod experiments;
pub mod metrics;
pub mod status;
pub mod workers;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::debug;

use bench_protocol::error::BenchError;
use bench_protocol::experiment::ControlOutcome;

use crate::state::AppState;
use crate::websocket;

pub type ApiResponse = (StatusCode, Json<Value>);

/// Outcomes are always 200, including `success: false` no-ops.
pub fn outcome_response(outcome: ControlOutcome) -> ApiResponse {
    (StatusCode::OK, Json(json!(outcome)))
}

pub fn error_response(err: BenchError) -> ApiResponse {
    let status = match &err {
        BenchError::NotFound(_) => StatusCode::NOT_FOUND,
        BenchError::DuplicateId(_) | BenchError::InvalidState(_) => StatusCode::CONFLICT,
        BenchError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
        // Already logged by the scheduler; the caller just learns it was ignored
        BenchError::StaleSignal { .. } => StatusCode::OK,
    };
    (status, Json(json!({ "success": false, "message": err.to_string() })))
}

/// Worker ingestion and dashboard polling, logged at trace level only.
const QUIET_PATHS: &[&str] = &["/api/metrics", "/api/status", "/api/queue"];

/// Lightweight middleware that logs every control request with its latency.
async fn log_api_requests(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let start = std::time::Instant::now();
    let resp = next.run(req).await;
    let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
    let status = resp.status().as_u16();

    if QUIET_PATHS.contains(&path.as_str()) {
        tracing::trace!(%method, %path, status, duration_ms, "api request");
    } else {
        debug!(%method, %path, status, duration_ms, uptime = state.uptime_secs(), "api request");
    }

    resp
}

pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/api/status", get(status::get_status))
        .route("/api/config", get(config::get_config))
        // Experiment registry
        .route(
            "/api/experiments",
            get(experiments::list_experiments).post(experiments::create_experiment),
        )
        .route(
            "/api/experiments/:id",
            get(experiments::get_experiment).delete(experiments::delete_experiment),
        )
        // Lifecycle
        .route(
            "/api/experiments/:id/queue",
            post(experiments::enqueue_experiment).delete(experiments::dequeue_experiment),
        )
        .route("/api/experiments/:id/stop", post(experiments::stop_experiment))
        .route("/api/queue", get(experiments::get_queue))
        // Worker signals
        .route("/api/workers/started", post(workers::workers_started))
        .route("/api/workers/finished", post(workers::workers_finished))
        // Metric ingestion
        .route(
            "/api/metrics",
            get(metrics::get_metrics_summary).post(metrics::ingest_metrics),
        )
        .layer(middleware::from_fn_with_state(state.clone(), log_api_requests));

    Router::new()
        .merge(api_routes)
        .route(bench_protocol::FEED_PATH, get(websocket::ws_feed_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::to_bytes;
    use tower::ServiceExt;

    use crate::api::config::BenchConfig;
    use crate::launcher::NoopLauncher;

    fn app() -> (Router, AppState) {
        let state = AppState::new(BenchConfig::default(), Arc::new(NoopLauncher));
        (build_router(state.clone()), state)
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    async fn create(app: &Router, id: &str) {
        let (status, body) = send(
            app,
            json_request(
                "POST",
                "/api/experiments",
                json!({ "id": id, "broker": "kafka", "producers": 2, "consumers": 1, "duration_secs": 60 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
    }

    async fn wait_for_status(app: &Router, id: &str, expected: &str) {
        for _ in 0..200 {
            let (_, body) = send(app, empty_request("GET", &format!("/api/experiments/{id}"))).await;
            if body["status"] == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{id} never reached {expected}");
    }

    #[tokio::test]
    async fn test_registry_status_codes() {
        let (app, _) = app();
        create(&app, "e1").await;

        let (status, body) = send(
            &app,
            json_request("POST", "/api/experiments", json!({ "id": "e1", "broker": "kafka", "producers": 1, "duration_secs": 5 })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);

        let (status, _) = send(
            &app,
            json_request("POST", "/api/experiments", json!({ "broker": "kafka", "producers": 0, "duration_secs": 5 })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = send(&app, empty_request("GET", "/api/experiments/ghost")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&app, empty_request("GET", "/api/experiments")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["experiments"].as_array().map(|a| a.len()), Some(1));
    }

    #[tokio::test]
    async fn test_full_lifecycle_over_http() {
        let (app, _) = app();
        create(&app, "e1").await;
        create(&app, "e2").await;

        let (status, body) = send(&app, empty_request("POST", "/api/experiments/e1/queue")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["experiment"]["status"], "starting");

        send(&app, empty_request("POST", "/api/experiments/e2/queue")).await;

        // Already queued: a no-op, still 200
        let (status, body) = send(&app, empty_request("POST", "/api/experiments/e2/queue")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);

        let (_, queue) = send(&app, empty_request("GET", "/api/queue")).await;
        assert_eq!(queue, json!({ "running": "e1", "queue": ["e2"] }));

        let (status, body) = send(&app, json_request("POST", "/api/workers/started", json!({ "experiment_id": "e1" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (status, _) = send(&app, empty_request("DELETE", "/api/experiments/e1")).await;
        assert_eq!(status, StatusCode::CONFLICT);

        send(&app, json_request("POST", "/api/workers/finished", json!({ "experiment_id": "e1" }))).await;
        wait_for_status(&app, "e1", "completed").await;
        wait_for_status(&app, "e2", "starting").await;

        // Stale completion for the experiment that just completed
        let (status, body) = send(&app, json_request("POST", "/api/workers/finished", json!({ "experiment_id": "e1" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_stop_and_dequeue_errors() {
        let (app, _) = app();
        create(&app, "e1").await;

        let (status, _) = send(&app, empty_request("POST", "/api/experiments/e1/stop")).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(&app, empty_request("DELETE", "/api/experiments/e1/queue")).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(&app, empty_request("POST", "/api/experiments/ghost/queue")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metric_ingestion_is_accepted_and_aggregated() {
        let (app, state) = app();
        let batch = json!([
            { "station_id": "a", "timestamp_ms": 1_000, "concentrations": { "pm25": 3.0 } },
            { "station_id": "a", "timestamp_ms": 1_500 },
            { "station_id": "b", "timestamp_ms": 2_100, "coordinates": { "lat": 1.0, "long": 2.0 } }
        ]);
        let (status, body) = send(&app, json_request("POST", "/api/metrics", batch)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["accepted"], 3);

        let snapshot = state.inner.aggregator.drain_snapshot();
        assert_eq!(snapshot.bucket("a", 1_000).map(|b| (b.count, b.pm25)), Some((2, 3.0)));
        assert_eq!(snapshot.bucket("b", 2_000).map(|b| b.count), Some(1));

        let (status, body) = send(&app, empty_request("GET", "/api/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_messages"], 3);
        assert_eq!(body["running"], Value::Null);
    }

    #[tokio::test]
    async fn test_malformed_metrics_rejected() {
        let (app, _) = app();
        let (status, _) = send(&app, json_request("POST", "/api/metrics", json!({ "not": "an array" }))).await;
        assert!(status.is_client_error());
    }
}

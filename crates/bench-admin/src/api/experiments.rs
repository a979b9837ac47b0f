use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use bench_protocol::experiment::{ControlOutcome, NewExperiment};

use super::{error_response, outcome_response, ApiResponse};
use crate::state::AppState;

pub async fn list_experiments(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "experiments": state.inner.scheduler.list() }))
}

pub async fn create_experiment(
    State(state): State<AppState>,
    Json(new): Json<NewExperiment>,
) -> ApiResponse {
    match state.inner.scheduler.add(new) {
        Ok(experiment) => outcome_response(
            ControlOutcome::ok(format!("experiment {} registered", experiment.id)).with_experiment(experiment),
        ),
        Err(e) => error_response(e),
    }
}

pub async fn get_experiment(State(state): State<AppState>, Path(id): Path<String>) -> ApiResponse {
    match state.inner.scheduler.get(&id) {
        Ok(experiment) => (StatusCode::OK, Json(json!(experiment))),
        Err(e) => error_response(e),
    }
}

pub async fn delete_experiment(State(state): State<AppState>, Path(id): Path<String>) -> ApiResponse {
    match state.inner.scheduler.remove(&id) {
        Ok(experiment) => outcome_response(
            ControlOutcome::ok(format!("experiment {id} deleted")).with_experiment(experiment),
        ),
        Err(e) => error_response(e),
    }
}

/// POST /api/experiments/:id/queue
pub async fn enqueue_experiment(State(state): State<AppState>, Path(id): Path<String>) -> ApiResponse {
    match state.inner.scheduler.enqueue(&id) {
        Ok(transition) => {
            state.inner.dispatcher.dispatch(transition.intents);
            outcome_response(transition.outcome)
        }
        Err(e) => error_response(e),
    }
}

/// DELETE /api/experiments/:id/queue
pub async fn dequeue_experiment(State(state): State<AppState>, Path(id): Path<String>) -> ApiResponse {
    match state.inner.scheduler.dequeue(&id) {
        Ok(outcome) => outcome_response(outcome),
        Err(e) => error_response(e),
    }
}

pub async fn stop_experiment(State(state): State<AppState>, Path(id): Path<String>) -> ApiResponse {
    match state.inner.scheduler.stop(&id) {
        Ok(transition) => {
            state.inner.dispatcher.dispatch(transition.intents);
            outcome_response(transition.outcome)
        }
        Err(e) => error_response(e),
    }
}

pub async fn get_queue(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.inner.scheduler.queue_state()))
}

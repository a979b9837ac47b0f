/// Signals reported by the worker processes of the running experiment.
/// A signal for a run that no longer holds the slot answers `success: false`.

use axum::extract::State;
use axum::Json;

use bench_protocol::experiment::WorkerSignal;
use bench_protocol::now_ms;

use super::{error_response, outcome_response, ApiResponse};
use crate::state::AppState;

/// POST /api/workers/started: start-ack
pub async fn workers_started(
    State(state): State<AppState>,
    Json(signal): Json<WorkerSignal>,
) -> ApiResponse {
    match state.inner.scheduler.start_ack(&signal.experiment_id, now_ms()) {
        Ok(transition) => {
            state.inner.dispatcher.dispatch(transition.intents);
            outcome_response(transition.outcome)
        }
        Err(e) => error_response(e),
    }
}

/// POST /api/workers/finished: completion signal
pub async fn workers_finished(
    State(state): State<AppState>,
    Json(signal): Json<WorkerSignal>,
) -> ApiResponse {
    match state.inner.scheduler.complete(&signal.experiment_id) {
        Ok(transition) => {
            state.inner.dispatcher.dispatch(transition.intents);
            outcome_response(transition.outcome)
        }
        Err(e) => error_response(e),
    }
}

//! Admission statistics.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// GET /api/v1/processes
///
/// Active and maximum slots per job class, plus the number of jobs waiting
/// in the queue.
pub async fn get_processes(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    Ok(Json(DataResponse {
        data: state.orchestrator.stats(),
    }))
}

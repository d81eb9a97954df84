//! Handlers for the `/simulations` resource.
//!
//! Starting a simulation answers with a server-sent event stream that
//! carries the job's progress until it reaches a terminal state. The other
//! endpoints are plain JSON.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use turbo_core::error::CoreError;
use turbo_core::process::JobClass;
use turbo_pipeline::orchestrator::CancelOutcome;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::sse;
use crate::state::AppState;

/// Response header carrying the id of a newly started scenario.
pub const SCENARIO_ID_HEADER: &str = "x-scenario-id";

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub accepted: bool,
}

fn not_found(id: &str) -> AppError {
    AppError::Core(CoreError::NotFound {
        entity: "Scenario",
        id: id.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

/// POST /api/v1/simulations
///
/// Start a simulation job. Admission and queue rejections are returned
/// synchronously; everything after acceptance (including validation
/// failures) arrives on the event stream.
pub async fn start_simulation(
    State(state): State<AppState>,
    Json(payload): Json<serde_json::Value>,
) -> AppResult<Response> {
    let handle = state
        .orchestrator
        .start(JobClass::Compute, payload)
        .await?;

    tracing::info!(
        job_id = %handle.job_id,
        queued = handle.queued,
        "Simulation started",
    );

    let scenario_id = HeaderValue::from_str(&handle.job_id.to_string())
        .map_err(|e| AppError::InternalError(e.to_string()))?;
    let heartbeat = Duration::from_secs(state.config.heartbeat_interval_secs);

    let mut response = sse::progress_sse(handle.stream, heartbeat).into_response();
    response
        .headers_mut()
        .insert(HeaderName::from_static(SCENARIO_ID_HEADER), scenario_id);
    Ok(response)
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// GET /api/v1/simulations/{id}
pub async fn get_simulation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let status = state
        .orchestrator
        .status(&id)
        .await?
        .ok_or_else(|| not_found(&id))?;
    Ok(Json(DataResponse { data: status }))
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

/// POST /api/v1/simulations/{id}/cancel
///
/// Returns `accepted: false` when the job already finished or was already
/// asked to cancel. Does not wait for the job to reach CANCELLED.
pub async fn cancel_simulation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let outcome = state.orchestrator.cancel(&id).await?;
    if outcome == CancelOutcome::NotFound {
        return Err(not_found(&id));
    }

    tracing::info!(scenario_id = %id, accepted = outcome.accepted(), "Cancellation requested");

    Ok(Json(DataResponse {
        data: CancelResponse {
            accepted: outcome.accepted(),
        },
    }))
}

// ---------------------------------------------------------------------------
// Discard
// ---------------------------------------------------------------------------

/// DELETE /api/v1/simulations/{id}
///
/// Remove a cancelled scenario. 409 for any other state.
pub async fn discard_simulation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    state.orchestrator.discard(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

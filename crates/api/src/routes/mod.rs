pub mod health;
pub mod processes;
pub mod simulations;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` routes that answer with a single JSON response.
///
/// ```text
/// /simulations/{id}                 status (GET), discard (DELETE)
/// /simulations/{id}/cancel          request cancellation (POST)
///
/// /processes                        admission statistics (GET)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/simulations", simulations::router())
        .merge(processes::router())
}

/// Build the `/api/v1` routes whose response body is a long-lived stream.
///
/// These are mounted outside the request timeout layer.
///
/// ```text
/// /simulations                      start a simulation, SSE progress (POST)
/// ```
pub fn streaming_routes() -> Router<AppState> {
    simulations::stream_router()
}

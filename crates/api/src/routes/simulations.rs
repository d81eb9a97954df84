//! Route definitions for the `/simulations` resource.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::simulations;
use crate::state::AppState;

/// Routes mounted at `/simulations`.
///
/// ```text
/// GET    /{id}            -> get_simulation
/// DELETE /{id}            -> discard_simulation
/// POST   /{id}/cancel     -> cancel_simulation
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/{id}",
            get(simulations::get_simulation).delete(simulations::discard_simulation),
        )
        .route("/{id}/cancel", post(simulations::cancel_simulation))
}

/// `POST /simulations -> start_simulation`, kept apart so it is not cut
/// off by the request timeout.
pub fn stream_router() -> Router<AppState> {
    Router::new().route("/simulations", post(simulations::start_simulation))
}

use axum::routing::get;
use axum::Router;

use crate::handlers::processes;
use crate::state::AppState;

/// `GET /processes -> get_processes`
pub fn router() -> Router<AppState> {
    Router::new().route("/processes", get(processes::get_processes))
}

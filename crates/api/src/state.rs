use std::sync::Arc;

use turbo_pipeline::orchestrator::Orchestrator;
use turbo_pipeline::store::ScenarioStore;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable; everything inside is behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// The job orchestration engine.
    pub orchestrator: Arc<Orchestrator>,
    /// Scenario persistence, shared with the engine. Used for health checks.
    pub store: Arc<dyn ScenarioStore>,
}

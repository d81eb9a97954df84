#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use turbo_api::config::{ServerConfig, StageCommands};
use turbo_api::router::build_app_router;
use turbo_api::state::AppState;
use turbo_core::process::{JobClass, ProcessConfig};
use turbo_pipeline::collaborators::{
    Collaborators, PreparedInputs, SimulationPass, SimulationRunner,
};
use turbo_pipeline::config::{EngineConfig, QueueConfig};
use turbo_pipeline::error::StageError;
use turbo_pipeline::orchestrator::Orchestrator;
use turbo_pipeline::store::InMemoryScenarioStore;

/// Build a test `ServerConfig`: one compute slot, a queue of
/// `queue_size`, and short timeouts.
pub fn test_config(queue_size: usize) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 30,
        heartbeat_interval_secs: 30,
        engine: EngineConfig {
            processes: [(JobClass::Compute, ProcessConfig::new(1, Duration::from_secs(5)))]
                .into_iter()
                .collect(),
            queue: QueueConfig {
                enabled: true,
                max_size: queue_size,
                timeout: Duration::from_secs(60),
            },
            channel_capacity: 64,
            poll_interval: Duration::from_millis(20),
        },
        stages: StageCommands::default(),
    }
}

/// The application router plus handles on the engine behind it.
pub struct TestApp {
    pub router: Router,
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<InMemoryScenarioStore>,
    shutdown: CancellationToken,
}

impl TestApp {
    /// Build the full application router with all middleware layers, backed
    /// by an in-memory store and the given simulation runner.
    pub fn new(config: ServerConfig, runner: Arc<dyn SimulationRunner>) -> Self {
        let store = Arc::new(InMemoryScenarioStore::new());
        let orchestrator = Arc::new(Orchestrator::new(
            config.engine.clone(),
            store.clone(),
            Collaborators::with_runner(runner),
        ));
        let shutdown = CancellationToken::new();
        orchestrator.spawn_dispatcher(shutdown.clone());

        let state = AppState {
            config: Arc::new(config.clone()),
            orchestrator: Arc::clone(&orchestrator),
            store: store.clone(),
        };
        Self {
            router: build_app_router(state, &config),
            orchestrator,
            store,
            shutdown,
        }
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.send(Method::GET, uri, Body::empty()).await
    }

    pub async fn delete(&self, uri: &str) -> Response<Body> {
        self.send(Method::DELETE, uri, Body::empty()).await
    }

    pub async fn post_json(&self, uri: &str, body: serde_json::Value) -> Response<Body> {
        self.send(Method::POST, uri, Body::from(body.to_string())).await
    }

    pub async fn send(&self, method: Method, uri: &str, body: Body) -> Response<Body> {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        self.router.clone().oneshot(request).await.unwrap()
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Read the full body as JSON.
pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// One parsed server-sent event.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event: String,
    pub data: serde_json::Value,
}

/// Read an SSE body to the end and parse its events.
pub async fn read_events(response: Response<Body>) -> Vec<SseEvent> {
    assert_eq!(response.status(), StatusCode::OK);
    let collected = tokio::time::timeout(Duration::from_secs(10), response.into_body().collect())
        .await
        .expect("event stream never ended")
        .unwrap()
        .to_bytes();
    let text = String::from_utf8(collected.to_vec()).unwrap();

    text.split("\n\n")
        .filter(|block| !block.trim().is_empty())
        .map(|block| {
            let mut event = String::new();
            let mut data = String::new();
            for line in block.lines() {
                if let Some(value) = line.strip_prefix("event:") {
                    event = value.trim().to_string();
                } else if let Some(value) = line.strip_prefix("data:") {
                    data.push_str(value.trim());
                }
            }
            SseEvent {
                event,
                data: serde_json::from_str(&data).unwrap(),
            }
        })
        .collect()
}

pub fn event_types(events: &[SseEvent]) -> Vec<&str> {
    events.iter().map(|e| e.event.as_str()).collect()
}

/// A request body the structural validator accepts.
pub fn valid_request() -> serde_json::Value {
    json!({
        "zones": [{
            "id": "3f2b8c1e-4d5a-4b6c-9e7f-0a1b2c3d4e5f",
            "coords": [[[-73.6, 45.5], [-73.5, 45.5], [-73.5, 45.6], [-73.6, 45.5]]],
            "trip": ["start", "end"],
            "policies": [{
                "vehicleType": "highEmission",
                "tier": 2,
                "period": ["07:00", "09:30"],
                "penalty": 4.5,
                "interval": 15
            }]
        }],
        "customSimulationAreas": [],
        "scaledSimulationAreas": [],
        "sources": {
            "population": { "year": 2021, "name": "census" },
            "network": { "year": 2024, "name": "osm" },
            "publicTransport": { "year": 2024, "name": "gtfs" }
        },
        "simulationOptions": { "iterations": 2, "percentage": 1 },
        "carDistribution": {
            "zeroEmission": 20.0,
            "nearZeroEmission": 20.0,
            "lowEmission": 20.0,
            "midEmission": 20.0,
            "highEmission": 20.0
        },
        "modeUtilities": { "walk": 0, "bike": 0, "car": 1, "ev": 0, "subway": 0, "bus": 0 }
    })
}

// ---------------------------------------------------------------------------
// Simulation runner
// ---------------------------------------------------------------------------

/// Runner whose baseline pass waits for a permit, so tests control when a
/// job may finish.
pub struct GatedRunner {
    gate: Semaphore,
}

impl GatedRunner {
    pub fn open() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(Semaphore::MAX_PERMITS),
        })
    }

    pub fn closed() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
        })
    }

    pub fn release(&self, jobs: usize) {
        self.gate.add_permits(jobs);
    }
}

#[async_trait]
impl SimulationRunner for GatedRunner {
    async fn run(
        &self,
        pass: SimulationPass,
        _inputs: &PreparedInputs,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, StageError> {
        if pass == SimulationPass::Baseline {
            tokio::select! {
                permit = self.gate.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                }
                _ = cancel.cancelled() => return Err(StageError::Cancelled),
            }
        }
        Ok(json!({ "pass": pass, "trips": 42 }))
    }
}

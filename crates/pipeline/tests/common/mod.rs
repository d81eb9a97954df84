//! Shared fakes for engine integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use turbo_core::process::{JobClass, ProcessConfig};
use turbo_pipeline::collaborators::{
    Collaborators, PassThrough, PreparedInputs, SimulationPass, SimulationRunner, Validator,
};
use turbo_pipeline::config::{EngineConfig, QueueConfig};
use turbo_pipeline::error::StageError;
use turbo_pipeline::orchestrator::Orchestrator;
use turbo_pipeline::progress::{ProgressMessage, ProgressStream};
use turbo_pipeline::store::InMemoryScenarioStore;

pub const STAGE_TIMEOUT: Duration = Duration::from_secs(5);

pub fn config(compute_max: usize, queue_size: usize, queue_timeout: Duration) -> EngineConfig {
    EngineConfig {
        processes: [(JobClass::Compute, ProcessConfig::new(compute_max, STAGE_TIMEOUT))]
            .into_iter()
            .collect(),
        queue: QueueConfig {
            enabled: true,
            max_size: queue_size,
            timeout: queue_timeout,
        },
        channel_capacity: 64,
        poll_interval: Duration::from_millis(20),
    }
}

pub struct Engine {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<InMemoryScenarioStore>,
    pub shutdown: CancellationToken,
}

impl Engine {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        let store = Arc::new(InMemoryScenarioStore::new());
        let orchestrator = Arc::new(Orchestrator::new(config, store.clone(), collaborators));
        let shutdown = CancellationToken::new();
        orchestrator.spawn_dispatcher(shutdown.clone());
        Self {
            orchestrator,
            store,
            shutdown,
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub fn collaborators(
    validator: Arc<dyn Validator>,
    runner: Arc<dyn SimulationRunner>,
) -> Collaborators {
    Collaborators {
        validator,
        zones: Arc::new(PassThrough),
        population: Arc::new(PassThrough),
        vehicles: Arc::new(PassThrough),
        simulation: runner,
        postprocess: Arc::new(PassThrough),
    }
}

/// Drain a progress stream until it closes.
pub async fn collect(mut stream: ProgressStream) -> Vec<ProgressMessage> {
    let mut messages = Vec::new();
    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(msg) = stream.recv().await {
            messages.push(msg);
        }
    })
    .await;
    assert!(drained.is_ok(), "progress stream never closed");
    messages
}

pub fn types(messages: &[ProgressMessage]) -> Vec<&'static str> {
    messages.iter().map(|m| m.message_type).collect()
}

// ---------------------------------------------------------------------------
// Validators
// ---------------------------------------------------------------------------

pub struct AcceptAll;

#[async_trait]
impl Validator for AcceptAll {
    async fn validate(
        &self,
        payload: &serde_json::Value,
        _cancel: &CancellationToken,
    ) -> Result<serde_json::Value, StageError> {
        Ok(payload.clone())
    }
}

/// Takes `delay` before accepting, honouring cancellation.
pub struct SlowValidator(pub Duration);

#[async_trait]
impl Validator for SlowValidator {
    async fn validate(
        &self,
        payload: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, StageError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(StageError::Cancelled),
            _ = tokio::time::sleep(self.0) => Ok(payload.clone()),
        }
    }
}

pub struct RejectingValidator(pub &'static str);

#[async_trait]
impl Validator for RejectingValidator {
    async fn validate(
        &self,
        _payload: &serde_json::Value,
        _cancel: &CancellationToken,
    ) -> Result<serde_json::Value, StageError> {
        Err(StageError::Validation(self.0.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Simulation runner
// ---------------------------------------------------------------------------

/// Runner driven by the payload's `"tag"` and `"outcome"` fields.
///
/// The baseline pass records the tag and then waits for a permit from
/// `release`, so tests decide when each job may proceed.
pub struct ScriptedRunner {
    pub release: Arc<Semaphore>,
    pub log: Mutex<Vec<String>>,
    running: AtomicUsize,
    pub peak: AtomicUsize,
}

impl ScriptedRunner {
    /// Every job proceeds immediately.
    pub fn free() -> Arc<Self> {
        Self::with_permits(Semaphore::MAX_PERMITS)
    }

    /// Every job blocks in its baseline pass until released.
    pub fn blocking() -> Arc<Self> {
        Self::with_permits(0)
    }

    fn with_permits(permits: usize) -> Arc<Self> {
        Arc::new(Self {
            release: Arc::new(Semaphore::new(permits)),
            log: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn release(&self, jobs: usize) {
        self.release.add_permits(jobs);
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Wait until `n` jobs have entered their baseline pass.
    pub async fn wait_started(&self, n: usize) {
        let reached = tokio::time::timeout(Duration::from_secs(5), async {
            while self.log.lock().unwrap().len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "expected {n} jobs to start");
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SimulationRunner for ScriptedRunner {
    async fn run(
        &self,
        pass: SimulationPass,
        inputs: &PreparedInputs,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, StageError> {
        if pass == SimulationPass::Policy {
            return Ok(json!({ "pass": "policy" }));
        }

        let tag = inputs.request["tag"].as_str().unwrap_or_default().to_string();
        let outcome = inputs.request["outcome"].as_str().unwrap_or("ok").to_string();
        self.log.lock().unwrap().push(tag);

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = RunningGuard(&self.running);

        tokio::select! {
            permit = self.release.acquire() => {
                if let Ok(permit) = permit {
                    permit.forget();
                }
            }
            _ = cancel.cancelled() => return Err(StageError::Cancelled),
        }

        match outcome.as_str() {
            "fail" => Err(StageError::Failed {
                stage: "simulation",
                message: "solver diverged".into(),
            }),
            "panic" => panic!("simulation crashed"),
            "wait_cancel" => {
                cancel.cancelled().await;
                Err(StageError::Cancelled)
            }
            _ => Ok(json!({ "pass": "baseline" })),
        }
    }
}

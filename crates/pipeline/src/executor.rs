//! Pipeline executor: drives one admitted job through the fixed stages.
//!
//! ```text
//! VALIDATING           validate -> zones -> population -> vehicles
//! SIMULATING_BASELINE  simulation(baseline)
//! SIMULATING_POLICY    simulation(policy)
//! POSTPROCESSING       postprocess, store session payload
//! COMPLETED
//! ```
//!
//! Cancellation is checked at every boundary, and each collaborator call is
//! raced against the job's token. The whole run shares one stage timeout.
//! Every exit path goes through [`PipelineExecutor::terminate`], which
//! writes the terminal state before the terminal event and is a no-op for a
//! job that is already terminal.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use turbo_core::job_events::{ERROR_INTERNAL, ERROR_STAGE_TIMEOUT};
use turbo_core::lifecycle::LifecycleState;
use turbo_core::types::JobId;

use crate::admission::Slot;
use crate::cancellation::CancellationRegistry;
use crate::collaborators::{Collaborators, PreparedInputs, SimulationPass};
use crate::error::{StageError, StoreError};
use crate::progress::{ProgressEvent, ProgressHub};
use crate::store::ScenarioStore;

/// Message recorded for a job stopped by a cancellation request.
pub const CANCELLED_MESSAGE: &str = "cancelled by request";

/// Everything needed to run one admitted job.
#[derive(Debug)]
pub struct ExecutionTicket {
    pub job_id: JobId,
    pub payload: serde_json::Value,
    pub slot: Slot,
    pub timeout: Duration,
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    Completed { result: serde_json::Value },
    Failed { code: &'static str, message: String },
    Cancelled { message: String },
}

impl Termination {
    pub fn failed(code: &'static str, message: impl Into<String>) -> Self {
        Termination::Failed {
            code,
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Termination::Cancelled {
            message: message.into(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        match self {
            Termination::Completed { .. } => LifecycleState::Completed,
            Termination::Failed { .. } => LifecycleState::Failed,
            Termination::Cancelled { .. } => LifecycleState::Cancelled,
        }
    }

    fn message(&self) -> Option<&str> {
        match self {
            Termination::Completed { .. } => None,
            Termination::Failed { message, .. } | Termination::Cancelled { message } => {
                Some(message)
            }
        }
    }

    fn into_event(self) -> ProgressEvent {
        match self {
            Termination::Completed { result } => ProgressEvent::Success { result },
            Termination::Failed { code, message } => ProgressEvent::Error { code, message },
            Termination::Cancelled { message } => ProgressEvent::Cancelled { message },
        }
    }
}

pub struct PipelineExecutor {
    store: Arc<dyn ScenarioStore>,
    hub: Arc<ProgressHub>,
    registry: Arc<CancellationRegistry>,
    collaborators: Collaborators,
}

impl PipelineExecutor {
    pub fn new(
        store: Arc<dyn ScenarioStore>,
        hub: Arc<ProgressHub>,
        registry: Arc<CancellationRegistry>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            store,
            hub,
            registry,
            collaborators,
        }
    }

    /// Run `ticket` on its own task inside a `job` span.
    pub fn spawn(self: &Arc<Self>, ticket: ExecutionTicket) -> JoinHandle<LifecycleState> {
        let span = tracing::info_span!("job", job_id = %ticket.job_id);
        let this = Arc::clone(self);
        tokio::spawn(async move { this.execute(ticket).await }.instrument(span))
    }

    /// Run a job to its terminal state and release its slot.
    pub async fn execute(&self, ticket: ExecutionTicket) -> LifecycleState {
        let ExecutionTicket {
            job_id,
            payload,
            slot,
            timeout,
        } = ticket;
        let token = self.registry.register(job_id);
        let started = Instant::now();

        tracing::info!(
            job_class = %slot.class(),
            timeout_ms = timeout.as_millis() as u64,
            "Pipeline started",
        );
        self.hub.emit(job_id, ProgressEvent::SimulationStart);

        let run = tokio::time::timeout(timeout, self.run_stages(job_id, payload, &token));
        let termination = match AssertUnwindSafe(run).catch_unwind().await {
            Ok(Ok(Ok(result))) => Termination::Completed { result },
            Ok(Ok(Err(StageError::Cancelled))) => Termination::cancelled(CANCELLED_MESSAGE),
            Ok(Ok(Err(err))) => {
                tracing::warn!(
                    error = %err,
                    stage = err.stage().unwrap_or("pipeline"),
                    "Pipeline stage failed",
                );
                Termination::failed(err.code(), err.to_string())
            }
            Ok(Err(_elapsed)) => {
                // Collaborators spawned outside this future still see the token.
                token.cancel();
                let err = StageError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                };
                tracing::warn!(error = %err, "Pipeline timed out");
                Termination::failed(ERROR_STAGE_TIMEOUT, err.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(panic = %message, "Pipeline panicked");
                Termination::failed(ERROR_INTERNAL, format!("internal error: {message}"))
            }
        };

        let state = self.terminate(job_id, termination).await;
        drop(slot);
        tracing::info!(
            state = %state,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Pipeline finished",
        );
        state
    }

    async fn run_stages(
        &self,
        job_id: JobId,
        payload: serde_json::Value,
        token: &CancellationToken,
    ) -> Result<serde_json::Value, StageError> {
        let c = &self.collaborators;

        self.enter(job_id, token, LifecycleState::Validating).await?;
        let request = guarded(token, c.validator.validate(&payload, token)).await?;
        let zones = self
            .step(job_id, token, c.zones.resolve_zones(&request, token))
            .await?;
        let population = self
            .step(job_id, token, c.population.prepare_population(&request, &zones, token))
            .await?;
        let vehicles = self
            .step(job_id, token, c.vehicles.assign_vehicles(&request, &population, token))
            .await?;
        let inputs = PreparedInputs {
            request,
            zones,
            population,
            vehicles,
        };

        self.enter(job_id, token, LifecycleState::SimulatingBaseline).await?;
        let baseline = guarded(
            token,
            c.simulation.run(SimulationPass::Baseline, &inputs, token),
        )
        .await?;

        self.enter(job_id, token, LifecycleState::SimulatingPolicy).await?;
        let policy = guarded(
            token,
            c.simulation.run(SimulationPass::Policy, &inputs, token),
        )
        .await?;

        self.enter(job_id, token, LifecycleState::Postprocessing).await?;
        let result = guarded(
            token,
            c.postprocess.postprocess(&inputs, &baseline, &policy, token),
        )
        .await?;

        let session = json!({
            "zones": inputs.zones,
            "population": inputs.population,
            "vehicles": inputs.vehicles,
            "baseline": baseline,
            "policy": policy,
        });
        self.store.store_session(job_id, &session).await?;

        // Last boundary: a request that arrived during postprocessing wins.
        self.check_cancelled(job_id, token)?;
        Ok(result)
    }

    fn check_cancelled(&self, job_id: JobId, token: &CancellationToken) -> Result<(), StageError> {
        if token.is_cancelled() || self.registry.is_requested(job_id) {
            tracing::info!("Cancellation observed at stage boundary");
            return Err(StageError::Cancelled);
        }
        Ok(())
    }

    /// Stage boundary: check for cancellation, then record and announce `state`.
    async fn enter(
        &self,
        job_id: JobId,
        token: &CancellationToken,
        state: LifecycleState,
    ) -> Result<(), StageError> {
        self.check_cancelled(job_id, token)?;
        self.store.update_status(job_id, state, None).await?;
        tracing::info!(state = %state, "Entered stage");
        self.hub.emit(job_id, ProgressEvent::StageProgress { state });
        Ok(())
    }

    /// A preparation sub-step inside VALIDATING, preceded by a boundary check.
    async fn step<F>(
        &self,
        job_id: JobId,
        token: &CancellationToken,
        call: F,
    ) -> Result<serde_json::Value, StageError>
    where
        F: Future<Output = Result<serde_json::Value, StageError>>,
    {
        self.check_cancelled(job_id, token)?;
        guarded(token, call).await
    }

    /// Record the terminal state, emit the terminal event, close the stream
    /// and forget the cancellation handle, in that order.
    ///
    /// Returns the state the job ended in. If the job was already terminal
    /// nothing is emitted and the stored state is returned.
    pub async fn terminate(&self, job_id: JobId, termination: Termination) -> LifecycleState {
        let target = termination.state();
        let state = match self
            .store
            .update_status(job_id, target, termination.message())
            .await
        {
            Ok(record) => record.state,
            Err(StoreError::InvalidTransition { from, .. }) => {
                tracing::debug!(%job_id, current = %from, "Job already terminal");
                self.registry.remove(job_id);
                return from.parse().unwrap_or(target);
            }
            Err(err) => {
                // The caller must still see a terminal event.
                tracing::error!(%job_id, error = %err, "Failed to persist terminal state");
                target
            }
        };

        self.hub.emit(job_id, termination.into_event());
        self.hub.close(job_id);
        self.registry.remove(job_id);
        state
    }
}

/// Await `call` unless the token fires first.
async fn guarded<F>(token: &CancellationToken, call: F) -> Result<serde_json::Value, StageError>
where
    F: Future<Output = Result<serde_json::Value, StageError>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(StageError::Cancelled),
        result = call => result,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

//! Engine entry point.
//!
//! The [`Orchestrator`] owns the shared registries and decides for each new
//! job whether it runs now (a slot is free and nobody is waiting ahead of
//! it), waits in the queue, or is rejected outright.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use turbo_core::lifecycle::LifecycleState;
use turbo_core::process::{ClassStats, JobClass};
use turbo_core::types::{JobId, Timestamp};

use crate::admission::AdmissionGate;
use crate::cancellation::CancellationRegistry;
use crate::collaborators::Collaborators;
use crate::config::EngineConfig;
use crate::dispatcher::JobDispatcher;
use crate::error::{EngineError, StoreError};
use crate::executor::{ExecutionTicket, PipelineExecutor, Termination, CANCELLED_MESSAGE};
use crate::progress::{ProgressEvent, ProgressHub, ProgressStream};
use crate::queue::JobQueue;
use crate::store::ScenarioStore;

/// Message recorded for jobs found unfinished at startup.
pub const RESTART_MESSAGE: &str = "interrupted by restart";

/// What the caller gets back for an accepted job.
#[derive(Debug)]
pub struct JobHandle {
    pub job_id: JobId,
    /// Whether the job had to wait for a slot.
    pub queued: bool,
    pub stream: ProgressStream,
}

/// Read-only projection of a scenario record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub state: LifecycleState,
    pub message: Option<String>,
    pub timestamp: Timestamp,
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The request was recorded; the job will reach CANCELLED.
    Accepted,
    /// The job is terminal or cancellation was already requested.
    Rejected,
    /// No job with that id (or the id is malformed).
    NotFound,
}

impl CancelOutcome {
    pub fn accepted(self) -> bool {
        self == CancelOutcome::Accepted
    }
}

/// Admission usage plus queue depth.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    pub classes: BTreeMap<JobClass, ClassStats>,
    pub queued: usize,
}

pub struct Orchestrator {
    config: EngineConfig,
    store: Arc<dyn ScenarioStore>,
    gate: Arc<AdmissionGate>,
    queue: Arc<JobQueue>,
    registry: Arc<CancellationRegistry>,
    hub: Arc<ProgressHub>,
    executor: Arc<PipelineExecutor>,
    wake: Arc<Notify>,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn ScenarioStore>,
        collaborators: Collaborators,
    ) -> Self {
        let gate = Arc::new(AdmissionGate::new(&config.processes));
        let queue = Arc::new(JobQueue::new(config.queue.max_size, config.queue.timeout));
        let registry = Arc::new(CancellationRegistry::new());
        let hub = Arc::new(ProgressHub::new(config.channel_capacity));
        let executor = Arc::new(PipelineExecutor::new(
            Arc::clone(&store),
            Arc::clone(&hub),
            Arc::clone(&registry),
            collaborators,
        ));
        Self {
            config,
            store,
            gate,
            queue,
            registry,
            hub,
            executor,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn registry(&self) -> &CancellationRegistry {
        &self.registry
    }

    /// Start the background dispatcher. Stops when `cancel` fires.
    pub fn spawn_dispatcher(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let dispatcher = JobDispatcher::new(
            self.config.clone(),
            Arc::clone(&self.queue),
            Arc::clone(&self.gate),
            Arc::clone(&self.executor),
            Arc::clone(&self.wake),
        );
        tokio::spawn(async move { dispatcher.run(cancel).await })
    }

    /// Accept a new job.
    ///
    /// On success the returned stream is already attached. Rejections
    /// (invalid payload, no capacity, full queue) are synchronous and leave
    /// no running or waiting job behind.
    pub async fn start(
        &self,
        class: JobClass,
        payload: serde_json::Value,
    ) -> Result<JobHandle, EngineError> {
        if !payload.is_object() {
            return Err(EngineError::InvalidPayload(
                "request body must be a JSON object".into(),
            ));
        }

        let job_id = JobId::new();
        self.store.create(job_id).await?;
        if let Err(err) = self.store.store_input(job_id, &payload).await {
            self.reject(job_id, "failed to store request input").await;
            return Err(err.into());
        }
        self.hub.open(job_id);
        self.registry.register(job_id);
        tracing::info!(%job_id, job_class = %class, "Job accepted");

        // Fast path: nobody is waiting ahead and a slot is free.
        if self.queue.is_empty(class) && self.gate.has_idle_slot(class) {
            if let Some(slot) = self.gate.try_acquire(job_id, class) {
                let stream = self
                    .hub
                    .attach(job_id, self.config.stream_timeout(class, false))?;
                self.executor.spawn(ExecutionTicket {
                    job_id,
                    payload,
                    slot,
                    timeout: self.config.process(class).timeout,
                });
                return Ok(JobHandle {
                    job_id,
                    queued: false,
                    stream,
                });
            }
        }

        if !self.config.queue.enabled || self.config.process(class).max == 0 {
            tracing::warn!(%job_id, job_class = %class, "No capacity, job rejected");
            self.reject(job_id, "no capacity available").await;
            return Err(EngineError::RejectedAdmission(class));
        }

        let Some(reservation) = self.queue.reserve(class) else {
            tracing::warn!(%job_id, job_class = %class, "Queue full, job rejected");
            self.reject(job_id, "queue full").await;
            return Err(EngineError::QueueFull(class));
        };
        if let Err(err) = self
            .store
            .update_status(job_id, LifecycleState::Queued, None)
            .await
        {
            drop(reservation);
            self.reject(job_id, "failed to record queued state").await;
            return Err(err.into());
        }
        let stream = self
            .hub
            .attach(job_id, self.config.stream_timeout(class, true))?;

        let hub = &self.hub;
        let position = reservation.submit(job_id, payload, |position| {
            hub.emit(job_id, ProgressEvent::RequestAccepted);
            hub.emit(job_id, ProgressEvent::Queued { position });
        });
        tracing::info!(%job_id, job_class = %class, position, "Job queued");
        self.wake.notify_one();
        Ok(JobHandle {
            job_id,
            queued: true,
            stream,
        })
    }

    /// Fail a job that never ran and tear down its stream and handle.
    async fn reject(&self, job_id: JobId, reason: &str) {
        if let Err(err) = self
            .store
            .update_status(job_id, LifecycleState::Failed, Some(reason))
            .await
        {
            tracing::error!(%job_id, error = %err, "Failed to record rejection");
        }
        self.hub.close(job_id);
        self.registry.remove(job_id);
    }

    /// Current state of a job. Malformed and unknown ids yield `None`.
    pub async fn status(&self, raw_id: &str) -> Result<Option<JobStatus>, EngineError> {
        let Some(job_id) = JobId::parse(raw_id) else {
            return Ok(None);
        };
        Ok(self.store.find(job_id).await?.map(|r| JobStatus {
            state: r.state,
            message: r.message,
            timestamp: r.updated_at,
        }))
    }

    /// Request cancellation. Returns without waiting for CANCELLED, except
    /// for a job still in the queue, which is cancelled on the spot.
    pub async fn cancel(&self, raw_id: &str) -> Result<CancelOutcome, EngineError> {
        let Some(job_id) = JobId::parse(raw_id) else {
            return Ok(CancelOutcome::NotFound);
        };
        let Some(record) = self.store.find(job_id).await? else {
            return Ok(CancelOutcome::NotFound);
        };
        if record.state.is_terminal() {
            return Ok(CancelOutcome::Rejected);
        }

        if !self.registry.cancel(job_id) {
            return Ok(CancelOutcome::Rejected);
        }
        if self.queue.remove(job_id).is_some() {
            tracing::info!(%job_id, "Queued job cancelled before admission");
            self.executor
                .terminate(job_id, Termination::cancelled(CANCELLED_MESSAGE))
                .await;
        }
        Ok(CancelOutcome::Accepted)
    }

    /// Delete a CANCELLED scenario record.
    pub async fn discard(&self, raw_id: &str) -> Result<(), EngineError> {
        let job_id =
            JobId::parse(raw_id).ok_or_else(|| EngineError::NotFound(raw_id.to_string()))?;
        match self.store.discard(job_id).await {
            Ok(true) => {
                tracing::info!(%job_id, "Scenario discarded");
                Ok(())
            }
            Ok(false) => {
                let state = self
                    .store
                    .find(job_id)
                    .await?
                    .map(|r| r.state)
                    .ok_or_else(|| EngineError::NotFound(raw_id.to_string()))?;
                Err(EngineError::NotCancelled { id: job_id, state })
            }
            Err(StoreError::NotFound(_)) => Err(EngineError::NotFound(raw_id.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            classes: self.gate.stats(),
            queued: self.queue.total_len(),
        }
    }

    /// Move every unfinished record that nothing in this process is running
    /// to CANCELLED. Called once at startup.
    pub async fn recover_incomplete(&self) -> Result<usize, EngineError> {
        let mut recovered = 0;
        for record in self.store.find_incomplete().await? {
            if self.gate.is_active(record.id) || self.registry.contains(record.id) {
                continue;
            }
            match self
                .store
                .update_status(record.id, LifecycleState::Cancelled, Some(RESTART_MESSAGE))
                .await
            {
                Ok(_) => {
                    tracing::info!(job_id = %record.id, previous = %record.state, "Recovered interrupted scenario");
                    recovered += 1;
                }
                Err(StoreError::InvalidTransition { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(recovered)
    }

    /// Cancel everything waiting or running. Running jobs reach CANCELLED
    /// at their next boundary; use [`wait_idle`](Self::wait_idle) to wait.
    pub async fn shutdown(&self) {
        let waiting = self.queue.drain_all();
        for entry in &waiting {
            self.registry.cancel(entry.job_id);
            self.executor
                .terminate(entry.job_id, Termination::cancelled(CANCELLED_MESSAGE))
                .await;
        }
        let running = self.registry.cancel_all();
        tracing::info!(queued = waiting.len(), running, "Engine shutdown requested");
    }

    /// Wait until no class holds a slot, or `timeout` elapses. Returns
    /// whether the engine went idle.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let idle = async {
            loop {
                if self.gate.stats().values().all(|s| s.active == 0) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(timeout, idle).await.is_ok()
    }
}

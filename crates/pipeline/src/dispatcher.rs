//! Background queue dispatcher.
//!
//! A single long-lived task that fails expired queue entries and hands the
//! head of each class queue to the executor whenever a slot is free. It
//! wakes on slot release and new submissions, with a periodic tick as a
//! fallback so deadlines are enforced even when nothing else happens.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use turbo_core::job_events::ERROR_QUEUE_TIMEOUT;
use turbo_core::process::JobClass;

use crate::admission::AdmissionGate;
use crate::config::EngineConfig;
use crate::executor::{ExecutionTicket, PipelineExecutor, Termination};
use crate::queue::JobQueue;

pub struct JobDispatcher {
    config: EngineConfig,
    queue: Arc<JobQueue>,
    gate: Arc<AdmissionGate>,
    executor: Arc<PipelineExecutor>,
    wake: Arc<Notify>,
}

impl JobDispatcher {
    pub fn new(
        config: EngineConfig,
        queue: Arc<JobQueue>,
        gate: Arc<AdmissionGate>,
        executor: Arc<PipelineExecutor>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            config,
            queue,
            gate,
            executor,
            wake,
        }
    }

    /// Run the dispatch loop until the cancellation token is triggered.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let released = self.gate.released();
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Job dispatcher started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Job dispatcher shutting down");
                    break;
                }
                _ = released.notified() => {}
                _ = self.wake.notified() => {}
                _ = ticker.tick() => {}
            }
            self.dispatch_cycle().await;
        }
    }

    /// One sweep: expire overdue entries, then admit from every class head.
    pub async fn dispatch_cycle(&self) {
        let now = Instant::now();

        for entry in self.queue.drain_expired(now) {
            let waited = now.saturating_duration_since(entry.enqueued_at);
            tracing::warn!(
                job_id = %entry.job_id,
                job_class = %entry.class,
                waited_ms = waited.as_millis() as u64,
                "Queue wait timed out",
            );
            self.executor
                .terminate(
                    entry.job_id,
                    Termination::failed(
                        ERROR_QUEUE_TIMEOUT,
                        format!(
                            "waited {} ms in queue without a free slot",
                            waited.as_millis()
                        ),
                    ),
                )
                .await;
        }

        // Deadlines may have passed while the expired jobs were written out.
        let now = Instant::now();
        for class in JobClass::ALL {
            while let Some((entry, slot)) = self
                .queue
                .pop_admitted(class, now, |e| self.gate.try_acquire(e.job_id, e.class))
            {
                tracing::info!(
                    job_id = %entry.job_id,
                    job_class = %class,
                    waited_ms = now.saturating_duration_since(entry.enqueued_at).as_millis() as u64,
                    "Queued job admitted",
                );
                self.executor.spawn(ExecutionTicket {
                    job_id: entry.job_id,
                    payload: entry.payload,
                    slot,
                    timeout: self.stage_timeout(class),
                });
            }
        }
    }

    fn stage_timeout(&self, class: JobClass) -> Duration {
        self.config.process(class).timeout
    }
}

//! Cancellation registry.
//!
//! Maps each live job to a flag plus the [`CancellationToken`] its pipeline
//! run observes. Requests are idempotent: only the first one for a job
//! reports success. Lookups by raw id parse first and treat malformed ids
//! exactly like unknown ones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use turbo_core::types::JobId;

#[derive(Debug, Default)]
struct CancellationHandle {
    requested: AtomicBool,
    token: CancellationToken,
}

#[derive(Debug, Default)]
pub struct CancellationRegistry {
    handles: Mutex<HashMap<JobId, Arc<CancellationHandle>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, Arc<CancellationHandle>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self, job_id: JobId) -> Option<Arc<CancellationHandle>> {
        self.lock().get(&job_id).cloned()
    }

    /// Register `job_id` and return the token its run should observe.
    ///
    /// Registering an id that is already present returns the existing token.
    pub fn register(&self, job_id: JobId) -> CancellationToken {
        self.lock()
            .entry(job_id)
            .or_default()
            .token
            .clone()
    }

    /// Request cancellation of a job by its caller-supplied id.
    ///
    /// Returns `true` only for the first request against a registered job.
    pub fn request_cancellation(&self, raw_id: &str) -> bool {
        JobId::parse(raw_id).is_some_and(|id| self.cancel(id))
    }

    /// Typed form of [`request_cancellation`](Self::request_cancellation).
    pub fn cancel(&self, job_id: JobId) -> bool {
        let Some(handle) = self.handle(job_id) else {
            return false;
        };
        if handle.requested.swap(true, Ordering::SeqCst) {
            return false;
        }
        handle.token.cancel();
        tracing::info!(%job_id, "Cancellation requested");
        true
    }

    pub fn is_cancellation_requested(&self, raw_id: &str) -> bool {
        JobId::parse(raw_id).is_some_and(|id| self.is_requested(id))
    }

    pub fn is_requested(&self, job_id: JobId) -> bool {
        self.handle(job_id)
            .is_some_and(|h| h.requested.load(Ordering::SeqCst))
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.lock().contains_key(&job_id)
    }

    /// Drop the handle once the job is terminal.
    pub fn remove(&self, job_id: JobId) {
        self.lock().remove(&job_id);
    }

    /// Request cancellation of every registered job. Returns how many were
    /// newly cancelled.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<JobId> = self.lock().keys().copied().collect();
        ids.into_iter().filter(|id| self.cancel(*id)).count()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_request_wins() {
        let registry = CancellationRegistry::new();
        let id = JobId::new();
        let token = registry.register(id);

        assert!(registry.request_cancellation(&id.to_string()));
        assert!(token.is_cancelled());
        assert!(registry.is_requested(id));
        assert!(!registry.request_cancellation(&id.to_string()));
    }

    #[test]
    fn malformed_and_unknown_ids_are_silent() {
        let registry = CancellationRegistry::new();
        assert!(!registry.request_cancellation("not-a-uuid"));
        assert!(!registry.request_cancellation(&JobId::new().to_string()));
        assert!(!registry.is_cancellation_requested("42"));
        assert!(registry.is_empty());
    }

    #[test]
    fn register_twice_shares_token() {
        let registry = CancellationRegistry::new();
        let id = JobId::new();
        let first = registry.register(id);
        let second = registry.register(id);
        registry.cancel(id);
        assert!(first.is_cancelled() && second.is_cancelled());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn removed_jobs_cannot_be_cancelled() {
        let registry = CancellationRegistry::new();
        let id = JobId::new();
        let token = registry.register(id);
        registry.remove(id);
        assert!(!registry.cancel(id));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn cancel_all_counts_new_requests() {
        let registry = CancellationRegistry::new();
        let a = JobId::new();
        let b = JobId::new();
        registry.register(a);
        registry.register(b);
        registry.cancel(a);
        assert_eq!(registry.cancel_all(), 1);
        assert!(registry.is_requested(b));
    }
}

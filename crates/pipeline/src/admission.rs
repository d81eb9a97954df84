//! Per-class concurrency ceilings.
//!
//! Each [`JobClass`] owns a semaphore sized to its configured `max`. A
//! granted [`Slot`] holds one permit and is released exactly once, when it
//! is dropped. The gate also remembers which job holds each slot so the same
//! job can never be admitted twice.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use turbo_core::process::{ClassStats, JobClass, ProcessConfig};
use turbo_core::types::JobId;

#[derive(Debug)]
struct ClassGate {
    semaphore: Arc<Semaphore>,
    max: usize,
}

#[derive(Debug, Default)]
struct Holders {
    active: Mutex<HashMap<JobId, JobClass>>,
    acquired: AtomicU64,
    released: AtomicU64,
}

impl Holders {
    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, JobClass>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admission ticket for one executing job.
#[derive(Debug)]
pub struct Slot {
    job_id: JobId,
    class: JobClass,
    permit: Option<OwnedSemaphorePermit>,
    holders: Arc<Holders>,
    released: Arc<Notify>,
}

impl Slot {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn class(&self) -> JobClass {
        self.class
    }

    /// Give the slot back. Equivalent to dropping it.
    pub fn release(self) {}
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.holders.lock().remove(&self.job_id);
        // Return the permit before waking the dispatcher so it can see it.
        drop(self.permit.take());
        self.holders.released.fetch_add(1, Ordering::SeqCst);
        self.released.notify_one();
        tracing::debug!(job_id = %self.job_id, job_class = %self.class, "Slot released");
    }
}

/// Grants and tracks [`Slot`]s per job class.
#[derive(Debug)]
pub struct AdmissionGate {
    classes: HashMap<JobClass, ClassGate>,
    holders: Arc<Holders>,
    released: Arc<Notify>,
}

impl AdmissionGate {
    pub fn new(processes: &BTreeMap<JobClass, ProcessConfig>) -> Self {
        let classes = processes
            .iter()
            .map(|(class, process)| {
                (
                    *class,
                    ClassGate {
                        semaphore: Arc::new(Semaphore::new(process.max)),
                        max: process.max,
                    },
                )
            })
            .collect();
        Self {
            classes,
            holders: Arc::default(),
            released: Arc::new(Notify::new()),
        }
    }

    /// Try to take a slot for `job_id` in `class` without waiting.
    ///
    /// Returns `None` when the class is at its ceiling, is not configured,
    /// or `job_id` already holds a slot.
    pub fn try_acquire(&self, job_id: JobId, class: JobClass) -> Option<Slot> {
        let gate = self.classes.get(&class)?;
        let mut active = self.holders.lock();
        if active.contains_key(&job_id) {
            tracing::warn!(%job_id, job_class = %class, "Job already holds a slot");
            return None;
        }
        let permit = Arc::clone(&gate.semaphore).try_acquire_owned().ok()?;
        active.insert(job_id, class);
        self.holders.acquired.fetch_add(1, Ordering::SeqCst);
        Some(Slot {
            job_id,
            class,
            permit: Some(permit),
            holders: Arc::clone(&self.holders),
            released: Arc::clone(&self.released),
        })
    }

    /// Non-mutating peek: is at least one slot free right now?
    pub fn has_idle_slot(&self, class: JobClass) -> bool {
        self.classes
            .get(&class)
            .is_some_and(|g| g.semaphore.available_permits() > 0)
    }

    pub fn is_active(&self, job_id: JobId) -> bool {
        self.holders.lock().contains_key(&job_id)
    }

    pub fn active(&self, class: JobClass) -> usize {
        self.classes
            .get(&class)
            .map(|g| g.max - g.semaphore.available_permits())
            .unwrap_or(0)
    }

    pub fn max(&self, class: JobClass) -> usize {
        self.classes.get(&class).map(|g| g.max).unwrap_or(0)
    }

    /// Usage for every configured class.
    pub fn stats(&self) -> BTreeMap<JobClass, ClassStats> {
        self.classes
            .keys()
            .map(|class| {
                (
                    *class,
                    ClassStats {
                        active: self.active(*class),
                        max: self.max(*class),
                    },
                )
            })
            .collect()
    }

    /// Lifetime `(acquired, released)` slot counts.
    pub fn lifetime_counts(&self) -> (u64, u64) {
        (
            self.holders.acquired.load(Ordering::SeqCst),
            self.holders.released.load(Ordering::SeqCst),
        )
    }

    /// Signalled each time a slot is released.
    pub fn released(&self) -> Arc<Notify> {
        Arc::clone(&self.released)
    }
}

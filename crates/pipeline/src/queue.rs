//! Bounded FIFO of jobs waiting for a slot.
//!
//! One queue per [`JobClass`]. Only the head of a class queue is ever
//! offered for admission, so jobs leave in the order they arrived. Entries
//! past their deadline are never admitted; the dispatcher sweeps them out
//! and fails their jobs.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use turbo_core::process::JobClass;
use turbo_core::types::JobId;

use crate::admission::Slot;

/// A job parked until a slot frees up.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub job_id: JobId,
    pub class: JobClass,
    pub payload: serde_json::Value,
    pub enqueued_at: Instant,
    pub deadline: Instant,
    pub admitted: bool,
}

impl QueueEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

#[derive(Debug, Default)]
struct Lines {
    waiting: HashMap<JobClass, VecDeque<QueueEntry>>,
    reserved: HashMap<JobClass, usize>,
}

impl Lines {
    fn occupied(&self, class: JobClass) -> usize {
        self.waiting.get(&class).map(VecDeque::len).unwrap_or(0)
            + self.reserved.get(&class).copied().unwrap_or(0)
    }
}

#[derive(Debug)]
pub struct JobQueue {
    capacity: usize,
    wait_timeout: Duration,
    lines: Mutex<Lines>,
}

/// A place held in a class queue ahead of [`Reservation::submit`].
///
/// Dropping it unused gives the place back.
#[derive(Debug)]
pub struct Reservation<'a> {
    queue: &'a JobQueue,
    class: JobClass,
    held: bool,
}

impl Reservation<'_> {
    /// Append the job to the tail of the reserved class queue.
    ///
    /// `on_enqueued` runs under the queue lock with the 1-based position, so
    /// anything it reports is ordered before the entry can be dequeued. It
    /// must not block.
    pub fn submit<F>(mut self, job_id: JobId, payload: serde_json::Value, on_enqueued: F) -> usize
    where
        F: FnOnce(usize),
    {
        let mut lines = self.queue.lock();
        release_place(&mut lines, self.class);
        self.held = false;

        let now = Instant::now();
        let queue = lines.waiting.entry(self.class).or_default();
        queue.push_back(QueueEntry {
            job_id,
            class: self.class,
            payload,
            enqueued_at: now,
            deadline: now + self.queue.wait_timeout,
            admitted: false,
        });
        let position = queue.len();
        on_enqueued(position);
        position
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.held {
            release_place(&mut self.queue.lock(), self.class);
        }
    }
}

fn release_place(lines: &mut Lines, class: JobClass) {
    if let Some(count) = lines.reserved.get_mut(&class) {
        *count = count.saturating_sub(1);
    }
}

impl JobQueue {
    pub fn new(capacity: usize, wait_timeout: Duration) -> Self {
        Self {
            capacity,
            wait_timeout,
            lines: Mutex::new(Lines::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Lines> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    /// Hold a place in the `class` queue, or `None` when it is full.
    ///
    /// Reserved places count against capacity until submitted or dropped.
    pub fn reserve(&self, class: JobClass) -> Option<Reservation<'_>> {
        let mut lines = self.lock();
        if lines.occupied(class) >= self.capacity {
            return None;
        }
        *lines.reserved.entry(class).or_default() += 1;
        Some(Reservation {
            queue: self,
            class,
            held: true,
        })
    }

    /// Reserve and submit in one step. Returns the payload back when the
    /// queue is full.
    pub fn submit<F>(
        &self,
        job_id: JobId,
        class: JobClass,
        payload: serde_json::Value,
        on_enqueued: F,
    ) -> Result<usize, serde_json::Value>
    where
        F: FnOnce(usize),
    {
        match self.reserve(class) {
            Some(reservation) => Ok(reservation.submit(job_id, payload, on_enqueued)),
            None => Err(payload),
        }
    }

    /// Offer the head of `class` to `admit`; dequeue it if a slot is granted.
    ///
    /// An expired head is never offered. `admit` runs under the queue lock.
    pub fn pop_admitted<F>(
        &self,
        class: JobClass,
        now: Instant,
        admit: F,
    ) -> Option<(QueueEntry, Slot)>
    where
        F: FnOnce(&QueueEntry) -> Option<Slot>,
    {
        let mut lines = self.lock();
        let queue = lines.waiting.get_mut(&class)?;
        let head = queue.front()?;
        if head.is_expired(now) {
            return None;
        }
        let slot = admit(head)?;
        let mut entry = queue.pop_front()?;
        entry.admitted = true;
        Some((entry, slot))
    }

    /// Remove and return every entry whose deadline has passed.
    pub fn drain_expired(&self, now: Instant) -> Vec<QueueEntry> {
        let mut expired = Vec::new();
        for queue in self.lock().waiting.values_mut() {
            let (keep, gone): (VecDeque<_>, VecDeque<_>) =
                queue.drain(..).partition(|e| !e.is_expired(now));
            *queue = keep;
            expired.extend(gone);
        }
        expired
    }

    /// Remove a specific job, e.g. when it is cancelled while waiting.
    pub fn remove(&self, job_id: JobId) -> Option<QueueEntry> {
        let mut lines = self.lock();
        for queue in lines.waiting.values_mut() {
            if let Some(index) = queue.iter().position(|e| e.job_id == job_id) {
                return queue.remove(index);
            }
        }
        None
    }

    /// Remove everything, used on shutdown.
    pub fn drain_all(&self) -> Vec<QueueEntry> {
        self.lock().waiting.values_mut().flat_map(|q| q.drain(..)).collect()
    }

    /// 1-based position of `job_id` within its class queue.
    pub fn position(&self, job_id: JobId) -> Option<usize> {
        self.lock()
            .waiting
            .values()
            .find_map(|q| q.iter().position(|e| e.job_id == job_id))
            .map(|i| i + 1)
    }

    pub fn len(&self, class: JobClass) -> usize {
        self.lock().waiting.get(&class).map(VecDeque::len).unwrap_or(0)
    }

    pub fn is_empty(&self, class: JobClass) -> bool {
        self.len(class) == 0
    }

    pub fn total_len(&self) -> usize {
        self.lock().waiting.values().map(VecDeque::len).sum()
    }
}

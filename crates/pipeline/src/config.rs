//! Engine configuration: per-class admission budgets and queue settings.

use std::collections::BTreeMap;
use std::time::Duration;

use turbo_core::error::CoreError;
use turbo_core::process::{JobClass, ProcessConfig};

/// Default interval between dispatcher sweeps when nothing wakes it earlier.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Default bound on buffered progress messages per job.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub enabled: bool,
    /// Maximum waiting entries per class. Zero means nothing can wait.
    pub max_size: usize,
    /// How long an entry may wait for a slot.
    pub timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 16,
            timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub processes: BTreeMap<JobClass, ProcessConfig>,
    pub queue: QueueConfig,
    pub channel_capacity: usize,
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let processes = BTreeMap::from([
            (JobClass::Admin, ProcessConfig::new(2, Duration::from_secs(30))),
            (JobClass::Read, ProcessConfig::new(8, Duration::from_secs(30))),
            (JobClass::Compute, ProcessConfig::new(1, Duration::from_secs(3600))),
        ]);
        Self {
            processes,
            queue: QueueConfig::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl EngineConfig {
    /// Budget for `class`. Unconfigured classes have no capacity.
    pub fn process(&self, class: JobClass) -> ProcessConfig {
        self.processes
            .get(&class)
            .copied()
            .unwrap_or(ProcessConfig::new(0, Duration::from_millis(1)))
    }

    /// Check the settings the engine cannot run without.
    pub fn validate(&self) -> Result<(), CoreError> {
        for (class, process) in &self.processes {
            process.validate(*class)?;
        }
        if self.processes.values().all(|p| p.max == 0) {
            return Err(CoreError::Validation(
                "at least one job class must allow one or more concurrent jobs".into(),
            ));
        }
        if self.queue.enabled && self.process(JobClass::Compute).max == 0 {
            return Err(CoreError::Validation(
                "compute max must be at least 1 when the queue is enabled".into(),
            ));
        }
        if self.queue.enabled && self.queue.timeout.is_zero() {
            return Err(CoreError::Validation(
                "queue timeout must be at least 1 ms".into(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(CoreError::Validation(
                "progress channel capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Caller-visible budget for a job's progress stream.
    pub fn stream_timeout(&self, class: JobClass, queued: bool) -> Duration {
        let stage = self.process(class).timeout;
        if queued {
            stage + self.queue.timeout
        } else {
            stage
        }
    }
}

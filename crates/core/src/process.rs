//! Job classes and their admission budgets.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A category of jobs sharing one concurrency ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobClass {
    Admin,
    Read,
    Compute,
}

impl JobClass {
    pub const ALL: [JobClass; 3] = [JobClass::Admin, JobClass::Read, JobClass::Compute];

    pub fn as_str(self) -> &'static str {
        match self {
            JobClass::Admin => "admin",
            JobClass::Read => "read",
            JobClass::Compute => "compute",
        }
    }
}

impl fmt::Display for JobClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobClass {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "admin" => Ok(JobClass::Admin),
            "read" => Ok(JobClass::Read),
            "compute" => Ok(JobClass::Compute),
            other => Err(CoreError::Validation(format!("Unknown job class: {other}"))),
        }
    }
}

/// Admission ceiling and per-run stage timeout for one [`JobClass`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessConfig {
    /// Maximum concurrently executing jobs. Zero disables the class.
    pub max: usize,
    /// Budget for one pipeline run once admitted.
    pub timeout: Duration,
}

impl ProcessConfig {
    pub fn new(max: usize, timeout: Duration) -> Self {
        Self { max, timeout }
    }

    pub fn validate(&self, class: JobClass) -> Result<(), CoreError> {
        if self.timeout.is_zero() {
            return Err(CoreError::Validation(format!(
                "timeout for job class '{class}' must be at least 1 ms"
            )));
        }
        Ok(())
    }
}

/// Point-in-time admission usage for one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClassStats {
    pub active: usize,
    pub max: usize,
}

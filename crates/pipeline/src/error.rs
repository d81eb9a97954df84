use turbo_core::job_events::{
    ERROR_INTERNAL, ERROR_PIPELINE, ERROR_STAGE_TIMEOUT, ERROR_VALIDATION,
};
use turbo_core::lifecycle::LifecycleState;
use turbo_core::process::JobClass;
use turbo_core::types::JobId;

/// Failures of the scenario store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Scenario not found: {0}")]
    NotFound(JobId),

    #[error("Scenario {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: String,
        to: LifecycleState,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Failures raised while running a pipeline stage.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("{0}")]
    Validation(String),

    /// `stage` names the collaborator for logging; only `message` is shown.
    #[error("{message}")]
    Failed { stage: &'static str, message: String },

    #[error("cancelled")]
    Cancelled,

    #[error("exceeded stage timeout of {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl StageError {
    /// Collaborator that raised the error, when known.
    pub fn stage(&self) -> Option<&'static str> {
        match self {
            StageError::Failed { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Error code reported in the progress stream.
    pub fn code(&self) -> &'static str {
        match self {
            StageError::Validation(_) => ERROR_VALIDATION,
            StageError::Failed { .. } => ERROR_PIPELINE,
            StageError::Timeout { .. } => ERROR_STAGE_TIMEOUT,
            StageError::Cancelled | StageError::Internal(_) => ERROR_INTERNAL,
        }
    }
}

impl From<StoreError> for StageError {
    fn from(err: StoreError) -> Self {
        StageError::Internal(err.to_string())
    }
}

/// Synchronous failures surfaced to the caller of the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("No capacity available for job class '{0}'")]
    RejectedAdmission(JobClass),

    #[error("Queue for job class '{0}' is full")]
    QueueFull(JobClass),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Progress stream for {0} is already attached")]
    AlreadyAttached(JobId),

    #[error("Scenario not found: {0}")]
    NotFound(String),

    #[error("Scenario {id} is {state}, only CANCELLED scenarios can be discarded")]
    NotCancelled { id: JobId, state: LifecycleState },

    #[error(transparent)]
    Store(#[from] StoreError),
}

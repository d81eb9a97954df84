//! Progress message types and error codes.
//!
//! These strings form the `messageType` field of every message written to a
//! scenario's progress stream, and the `code` field of error payloads.

/// The request was accepted into the system but is waiting for a slot.
pub const MSG_TYPE_REQUEST_ACCEPTED: &str = "pa_request_accepted";

/// The request is waiting in the queue (carries its position).
pub const MSG_TYPE_QUEUED: &str = "pa_queued";

/// A slot was granted and the pipeline started.
pub const MSG_TYPE_SIMULATION_START: &str = "pa_simulation_start";

/// The pipeline entered a new stage.
pub const MSG_TYPE_STAGE_PROGRESS: &str = "stage_progress";

/// The pipeline completed; payload carries the result summary.
pub const MSG_TYPE_SUCCESS: &str = "success_process";

/// The pipeline observed a cancellation request.
pub const MSG_TYPE_CANCELLED: &str = "cancelled_process";

/// The job failed; payload carries `{ code, message }`.
pub const MSG_TYPE_ERROR: &str = "error_global";

/// Keep-alive written by the transport while the stream is idle.
pub const MSG_TYPE_HEARTBEAT: &str = "heartbeat";

/// Waited in the queue past its deadline.
pub const ERROR_QUEUE_TIMEOUT: &str = "QUEUE_TIMEOUT";

/// The request payload failed validation.
pub const ERROR_VALIDATION: &str = "VALIDATION_ERROR";

/// A pipeline collaborator reported a failure.
pub const ERROR_PIPELINE: &str = "PIPELINE_ERROR";

/// The run exceeded the class stage timeout.
pub const ERROR_STAGE_TIMEOUT: &str = "STAGE_TIMEOUT";

/// Unexpected fault inside the executor.
pub const ERROR_INTERNAL: &str = "INTERNAL_ERROR";

//! Per-job progress streams.
//!
//! Every accepted job gets one bounded channel. The caller may attach to it
//! once; the engine writes lifecycle events into it and closes it after the
//! terminal event. Writes to a closed, full or abandoned channel are
//! dropped: delivery is best-effort and a disconnected caller does not
//! affect the job. The last buffer slot is held back for the terminal
//! event, so a slow reader loses progress updates but never the outcome.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use turbo_core::job_events::{
    MSG_TYPE_CANCELLED, MSG_TYPE_ERROR, MSG_TYPE_HEARTBEAT, MSG_TYPE_QUEUED,
    MSG_TYPE_REQUEST_ACCEPTED, MSG_TYPE_SIMULATION_START, MSG_TYPE_STAGE_PROGRESS,
    MSG_TYPE_SUCCESS,
};
use turbo_core::lifecycle::LifecycleState;
use turbo_core::types::{JobId, Timestamp};

use crate::error::EngineError;

/// Something the engine reports about a job.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Accepted into the system but waiting for a slot.
    RequestAccepted,
    Queued { position: usize },
    SimulationStart,
    StageProgress { state: LifecycleState },
    Success { result: serde_json::Value },
    Cancelled { message: String },
    Error { code: &'static str, message: String },
}

impl ProgressEvent {
    pub fn message_type(&self) -> &'static str {
        match self {
            ProgressEvent::RequestAccepted => MSG_TYPE_REQUEST_ACCEPTED,
            ProgressEvent::Queued { .. } => MSG_TYPE_QUEUED,
            ProgressEvent::SimulationStart => MSG_TYPE_SIMULATION_START,
            ProgressEvent::StageProgress { .. } => MSG_TYPE_STAGE_PROGRESS,
            ProgressEvent::Success { .. } => MSG_TYPE_SUCCESS,
            ProgressEvent::Cancelled { .. } => MSG_TYPE_CANCELLED,
            ProgressEvent::Error { .. } => MSG_TYPE_ERROR,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Success { .. }
                | ProgressEvent::Cancelled { .. }
                | ProgressEvent::Error { .. }
        )
    }

    fn payload(&self, job_id: JobId) -> serde_json::Value {
        match self {
            ProgressEvent::RequestAccepted | ProgressEvent::SimulationStart => {
                json!({ "requestId": job_id })
            }
            ProgressEvent::Queued { position } => {
                json!({ "requestId": job_id, "position": position })
            }
            ProgressEvent::StageProgress { state } => {
                json!({ "requestId": job_id, "state": state })
            }
            ProgressEvent::Success { result } => {
                json!({ "requestId": job_id, "result": result })
            }
            ProgressEvent::Cancelled { message } => {
                json!({ "requestId": job_id, "message": message })
            }
            ProgressEvent::Error { code, message } => {
                json!({ "requestId": job_id, "code": code, "message": message })
            }
        }
    }
}

/// Wire envelope for a progress message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressMessage {
    pub message_type: &'static str,
    pub payload: serde_json::Value,
    pub timestamp: Timestamp,
}

impl ProgressMessage {
    pub fn from_event(job_id: JobId, event: &ProgressEvent) -> Self {
        Self {
            message_type: event.message_type(),
            payload: event.payload(job_id),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            message_type: MSG_TYPE_HEARTBEAT,
            payload: json!({}),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Receiving half handed to the caller that attached to a job.
#[derive(Debug)]
pub struct ProgressStream {
    receiver: mpsc::Receiver<ProgressMessage>,
    timeout: Duration,
}

impl ProgressStream {
    /// Caller-visible budget for the whole stream.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn recv(&mut self) -> Option<ProgressMessage> {
        self.receiver.recv().await
    }

    /// Stream of messages that ends when the channel closes or the timeout
    /// elapses, whichever comes first.
    pub fn into_stream(self) -> impl Stream<Item = ProgressMessage> + Send + 'static {
        ReceiverStream::new(self.receiver).take_until(tokio::time::sleep(self.timeout))
    }
}

#[derive(Debug)]
struct Channel {
    sender: mpsc::Sender<ProgressMessage>,
    receiver: Option<mpsc::Receiver<ProgressMessage>>,
}

/// Owns the open progress channels, keyed by job.
#[derive(Debug)]
pub struct ProgressHub {
    capacity: usize,
    channels: Mutex<HashMap<JobId, Channel>>,
}

impl ProgressHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, Channel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the channel for a newly accepted job.
    pub fn open(&self, job_id: JobId) {
        let (sender, receiver) = mpsc::channel(self.capacity);
        self.lock().insert(
            job_id,
            Channel {
                sender,
                receiver: Some(receiver),
            },
        );
    }

    /// Take the receiving half. Only the first call succeeds.
    pub fn attach(&self, job_id: JobId, timeout: Duration) -> Result<ProgressStream, EngineError> {
        let receiver = self
            .lock()
            .get_mut(&job_id)
            .and_then(|c| c.receiver.take())
            .ok_or(EngineError::AlreadyAttached(job_id))?;
        Ok(ProgressStream { receiver, timeout })
    }

    /// Write an event. Returns whether it was delivered to the buffer.
    pub fn emit(&self, job_id: JobId, event: ProgressEvent) -> bool {
        let channels = self.lock();
        let Some(channel) = channels.get(&job_id) else {
            tracing::debug!(%job_id, message_type = event.message_type(), "Progress channel closed, event dropped");
            return false;
        };
        // Checked and sent under the hub lock so two writers cannot both
        // take the reserved slot.
        if !event.is_terminal() && channel.sender.capacity() <= 1 {
            tracing::warn!(%job_id, message_type = event.message_type(), "Progress channel full, event dropped");
            return false;
        }
        match channel.sender.try_send(ProgressMessage::from_event(job_id, &event)) {
            Ok(()) => true,
            Err(TrySendError::Full(msg)) => {
                tracing::warn!(%job_id, message_type = msg.message_type, "Progress channel full, event dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(%job_id, "Caller disconnected, event dropped");
                false
            }
        }
    }

    /// Close the channel. Messages already buffered are still delivered.
    ///
    /// Returns `true` only on the call that actually closed it.
    pub fn close(&self, job_id: JobId) -> bool {
        self.lock().remove(&job_id).is_some()
    }

    pub fn is_open(&self, job_id: JobId) -> bool {
        self.lock().contains_key(&job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn second_attach_is_rejected() {
        let hub = ProgressHub::new(8);
        let id = JobId::new();
        hub.open(id);
        let _stream = hub.attach(id, TIMEOUT).unwrap();
        assert_matches!(hub.attach(id, TIMEOUT), Err(EngineError::AlreadyAttached(_)));
    }

    #[tokio::test]
    async fn buffered_events_survive_close() {
        let hub = ProgressHub::new(8);
        let id = JobId::new();
        hub.open(id);
        let mut stream = hub.attach(id, TIMEOUT).unwrap();

        assert!(hub.emit(id, ProgressEvent::SimulationStart));
        assert!(hub.emit(id, ProgressEvent::Success { result: json!({ "ok": true }) }));
        assert!(hub.close(id));
        assert!(!hub.close(id), "close must only succeed once");

        let first = stream.recv().await.unwrap();
        assert_eq!(first.message_type, "pa_simulation_start");
        let second = stream.recv().await.unwrap();
        assert_eq!(second.message_type, "success_process");
        assert_eq!(second.payload["result"]["ok"], true);
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn writes_after_close_are_dropped() {
        let hub = ProgressHub::new(8);
        let id = JobId::new();
        hub.open(id);
        hub.close(id);
        assert!(!hub.emit(id, ProgressEvent::SimulationStart));
    }

    #[tokio::test]
    async fn full_channel_drops_instead_of_blocking() {
        let hub = ProgressHub::new(2);
        let id = JobId::new();
        hub.open(id);
        assert!(hub.emit(id, ProgressEvent::SimulationStart));
        assert!(!hub.emit(id, ProgressEvent::RequestAccepted));
    }

    #[tokio::test]
    async fn terminal_event_survives_a_full_channel() {
        let hub = ProgressHub::new(2);
        let id = JobId::new();
        hub.open(id);
        let mut stream = hub.attach(id, TIMEOUT).unwrap();

        assert!(hub.emit(id, ProgressEvent::SimulationStart));
        for state in [LifecycleState::Validating, LifecycleState::SimulatingBaseline] {
            assert!(!hub.emit(id, ProgressEvent::StageProgress { state }));
        }
        assert!(hub.emit(id, ProgressEvent::Success { result: json!({}) }));
        hub.close(id);

        assert_eq!(stream.recv().await.unwrap().message_type, "pa_simulation_start");
        assert_eq!(stream.recv().await.unwrap().message_type, "success_process");
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn single_slot_channel_carries_only_the_outcome() {
        let hub = ProgressHub::new(1);
        let id = JobId::new();
        hub.open(id);
        let mut stream = hub.attach(id, TIMEOUT).unwrap();

        assert!(!hub.emit(id, ProgressEvent::SimulationStart));
        assert!(hub.emit(id, ProgressEvent::Cancelled { message: "stop".into() }));
        hub.close(id);

        assert_eq!(stream.recv().await.unwrap().message_type, "cancelled_process");
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn disconnected_caller_does_not_error() {
        let hub = ProgressHub::new(4);
        let id = JobId::new();
        hub.open(id);
        drop(hub.attach(id, TIMEOUT).unwrap());
        assert!(!hub.emit(id, ProgressEvent::SimulationStart));
        assert!(hub.close(id));
    }

    #[test]
    fn envelope_serializes_camel_case() {
        let id = JobId::new();
        let msg = ProgressMessage::from_event(
            id,
            &ProgressEvent::Error {
                code: "QUEUE_TIMEOUT",
                message: "waited too long".into(),
            },
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["messageType"], "error_global");
        assert_eq!(json["payload"]["code"], "QUEUE_TIMEOUT");
        assert_eq!(json["payload"]["requestId"], id.to_string());
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test(start_paused = true)]
    async fn stream_ends_at_timeout() {
        let hub = ProgressHub::new(4);
        let id = JobId::new();
        hub.open(id);
        let stream = hub.attach(id, Duration::from_millis(50)).unwrap();
        let collected: Vec<_> = stream.into_stream().collect().await;
        assert!(collected.is_empty());
        assert!(hub.is_open(id));
    }
}

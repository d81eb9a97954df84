//! Server-sent events transport for job progress.
//!
//! Each progress message becomes one SSE event whose `event:` field is the
//! message type and whose `data:` field is the JSON envelope
//! `{ messageType, payload, timestamp }`. Heartbeats are interleaved while
//! the progress stream is open and stop as soon as it ends.

use std::time::Duration;

use axum::response::sse::{Event, Sse};
use futures::stream::{self, Stream, StreamExt};
use tokio_stream::wrappers::IntervalStream;
use turbo_pipeline::progress::{ProgressMessage, ProgressStream};

/// Serialise a progress message as an SSE event.
pub fn to_event(message: &ProgressMessage) -> Result<Event, axum::Error> {
    Event::default().event(message.message_type).json_data(message)
}

/// Progress messages followed by heartbeats every `heartbeat`, ending when
/// the job's channel closes or its caller-visible timeout elapses.
pub fn with_heartbeat(
    progress: ProgressStream,
    heartbeat: Duration,
) -> impl Stream<Item = ProgressMessage> + Send + 'static {
    // `None` marks the end of the progress stream.
    let messages = progress
        .into_stream()
        .map(Some)
        .chain(stream::once(async { None }));

    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let heartbeats = IntervalStream::new(interval).map(|_| Some(ProgressMessage::heartbeat()));

    stream::select(messages, heartbeats)
        .take_while(|item| futures::future::ready(item.is_some()))
        .filter_map(futures::future::ready)
}

/// Wrap a job's progress stream as an SSE response body.
pub fn progress_sse(
    progress: ProgressStream,
    heartbeat: Duration,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>> + Send + 'static> {
    Sse::new(with_heartbeat(progress, heartbeat).map(|message| to_event(&message)))
}

#[cfg(test)]
mod tests {
    use turbo_core::types::JobId;
    use turbo_pipeline::progress::{ProgressEvent, ProgressHub};

    use super::*;

    #[tokio::test]
    async fn heartbeats_stop_when_channel_closes() {
        let hub = ProgressHub::new(8);
        let id = JobId::new();
        hub.open(id);
        let progress = hub.attach(id, Duration::from_secs(5)).unwrap();

        let messages = with_heartbeat(progress, Duration::from_millis(20));
        futures::pin_mut!(messages);

        let first = messages.next().await.unwrap();
        assert_eq!(first.message_type, "heartbeat");

        hub.emit(id, ProgressEvent::SimulationStart);
        hub.close(id);
        let rest: Vec<_> = tokio::time::timeout(Duration::from_secs(2), messages.collect())
            .await
            .expect("stream must end after close");
        assert!(rest.iter().any(|m| m.message_type == "pa_simulation_start"));
    }

    #[tokio::test]
    async fn stream_ends_at_caller_timeout() {
        let hub = ProgressHub::new(8);
        let id = JobId::new();
        hub.open(id);
        let progress = hub.attach(id, Duration::from_millis(50)).unwrap();

        let messages: Vec<_> = tokio::time::timeout(
            Duration::from_secs(2),
            with_heartbeat(progress, Duration::from_secs(30)).collect(),
        )
        .await
        .expect("stream must end at its timeout");
        assert!(messages.is_empty());
        assert!(hub.is_open(id), "the timeout only ends the caller's view");
    }

    #[test]
    fn event_carries_message_type() {
        let event = to_event(&ProgressMessage::heartbeat());
        assert!(event.is_ok());
    }
}

//! Bridge between the serializer's per-request event channel and callers.
//!
//! A [`ResponseStream`] yields zero or more [`StreamEvent::Token`] followed by
//! exactly one terminal event. The channel behind it is bounded, so a slow
//! reader suspends the producer instead of growing a buffer. Dropping the
//! stream before the terminal event cancels the request.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    error::ServiceError,
    model::{GenerationResult, GenerationSummary, StopReason},
    scheduler::{AdmissionQueue, QueueEntry},
};

#[derive(Debug)]
pub enum StreamEvent {
    Token(String),
    Done(GenerationSummary),
    Error(ServiceError),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Token(_))
    }

    /// Render as a named SSE event.
    pub fn to_sse(&self) -> Event {
        match self {
            StreamEvent::Token(token) => sse_event(
                "token",
                &TokenPayload {
                    token,
                    done: false,
                },
            ),
            StreamEvent::Done(summary) => sse_event(
                "done",
                &DonePayload {
                    done: true,
                    prompt_tokens: summary.prompt_tokens,
                    completion_tokens: summary.completion_tokens,
                    total_tokens: summary.total_tokens,
                    stop_reason: summary.stop_reason,
                    ttft_ms: summary.ttft_ms,
                    latency_ms: summary.latency_ms,
                },
            ),
            StreamEvent::Error(err) => sse_event(
                "error",
                &ErrorPayload {
                    error: err.kind(),
                    message: err.to_string(),
                },
            ),
        }
    }
}

#[derive(Serialize)]
struct TokenPayload<'a> {
    token: &'a str,
    done: bool,
}

#[derive(Serialize)]
struct DonePayload {
    done: bool,
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
    stop_reason: StopReason,
    ttft_ms: Option<f64>,
    latency_ms: f64,
}

#[derive(Serialize)]
struct ErrorPayload {
    error: &'static str,
    message: String,
}

fn sse_event<T: Serialize>(name: &str, payload: &T) -> Event {
    let data = serde_json::to_string(payload).unwrap_or_default();
    Event::default().event(name).data(data)
}

pub struct ResponseStream {
    entry: Arc<QueueEntry>,
    queue: Arc<AdmissionQueue>,
    events: mpsc::Receiver<StreamEvent>,
    finished: bool,
}

impl ResponseStream {
    pub(crate) fn new(
        entry: Arc<QueueEntry>,
        queue: Arc<AdmissionQueue>,
        events: mpsc::Receiver<StreamEvent>,
    ) -> Self {
        Self {
            entry,
            queue,
            events,
            finished: false,
        }
    }

    pub fn id(&self) -> &str {
        self.entry.id()
    }

    /// Drain the whole generation and return it as one result. Shares every
    /// cancellation and timeout rule with the streaming path.
    pub async fn collect(mut self) -> Result<GenerationResult, ServiceError> {
        let mut text = String::new();
        while let Some(event) = self.next().await {
            match event {
                StreamEvent::Token(token) => text.push_str(&token),
                StreamEvent::Done(summary) => return Ok(GenerationResult::from_parts(text, summary)),
                StreamEvent::Error(err) => return Err(err),
            }
        }
        Err(ServiceError::Inference("generation ended without a result".into()))
    }

    pub fn into_sse(self) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static> {
        let events = self.map(|event| Ok(event.to_sse()));
        Sse::new(events).keep_alive(KeepAlive::default())
    }
}

impl Stream for ResponseStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.events.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                this.finished = event.is_terminal();
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                // Producer went away without a terminal event (panic or shutdown).
                this.finished = true;
                Poll::Ready(Some(StreamEvent::Error(ServiceError::Inference(
                    "generation aborted".into(),
                ))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        debug!(request_id = self.entry.id(), "response stream dropped early");
        self.entry.cancel();
        self.queue.withdraw(self.entry.id());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::model::{GenerationRequest, SamplingParams};
    use crate::scheduler::serializer::TurnGate;

    fn summary() -> GenerationSummary {
        GenerationSummary {
            prompt_tokens: 3,
            completion_tokens: 2,
            total_tokens: 5,
            stop_reason: StopReason::Stop,
            queue_ms: 0.0,
            ttft_ms: Some(1.0),
            latency_ms: 2.0,
        }
    }

    fn fixture() -> (ResponseStream, mpsc::Sender<StreamEvent>, Arc<AdmissionQueue>) {
        let params = SamplingParams {
            max_tokens: 4,
            temperature: 0.0,
            top_p: 1.0,
            top_k: 1,
            stop: Vec::new(),
            seed: None,
        };
        let entry = Arc::new(QueueEntry::new(GenerationRequest::new("p", params, "t"), None));
        let queue = Arc::new(AdmissionQueue::new(4, 1, Arc::new(TurnGate::new())));
        let (tx, rx) = mpsc::channel(4);
        // The backlog keeps its own sender so dropping `tx` closes the stream.
        queue.admit(entry.clone(), mpsc::channel(1).0).unwrap();
        (ResponseStream::new(entry, queue.clone(), rx), tx, queue)
    }

    #[tokio::test]
    async fn test_collect_concatenates_tokens() {
        let (stream, tx, _queue) = fixture();
        tx.send(StreamEvent::Token("Hel".into())).await.unwrap();
        tx.send(StreamEvent::Token("lo".into())).await.unwrap();
        tx.send(StreamEvent::Done(summary())).await.unwrap();

        let result = stream.collect().await.unwrap();
        assert_eq!(result.text, "Hello");
        assert_eq!(result.total_tokens, 5);
    }

    #[tokio::test]
    async fn test_collect_surfaces_error_event() {
        let (stream, tx, _queue) = fixture();
        tx.send(StreamEvent::Token("x".into())).await.unwrap();
        tx.send(StreamEvent::Error(ServiceError::ModelStall(Duration::from_secs(1))))
            .await
            .unwrap();

        let err = stream.collect().await.unwrap_err();
        assert!(matches!(err, ServiceError::ModelStall(_)));
    }

    #[tokio::test]
    async fn test_closed_channel_yields_single_error() {
        let (mut stream, tx, _queue) = fixture();
        drop(tx);
        assert!(matches!(stream.next().await, Some(StreamEvent::Error(_))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_unfinished_stream_cancels_and_withdraws() {
        let (stream, _tx, queue) = fixture();
        let entry = stream.entry.clone();
        assert_eq!(queue.stats().queue_size, 1);

        drop(stream);
        assert!(entry.is_cancelled());
        assert_eq!(queue.stats().queue_size, 0);
    }

    #[tokio::test]
    async fn test_finished_stream_drop_does_not_cancel() {
        let (mut stream, tx, _queue) = fixture();
        tx.send(StreamEvent::Done(summary())).await.unwrap();
        assert!(matches!(stream.next().await, Some(StreamEvent::Done(_))));
        let entry = stream.entry.clone();
        drop(stream);
        assert!(!entry.is_cancelled());
    }

    #[test]
    fn test_event_payload_shapes() {
        let err = StreamEvent::Error(ServiceError::QueueFull { capacity: 1 });
        assert!(err.is_terminal());
        assert!(!StreamEvent::Token("a".into()).is_terminal());

        let payload = serde_json::to_value(DonePayload {
            done: true,
            prompt_tokens: 1,
            completion_tokens: 2,
            total_tokens: 3,
            stop_reason: StopReason::Length,
            ttft_ms: None,
            latency_ms: 1.5,
        })
        .unwrap();
        assert_eq!(payload["stop_reason"], "length");
        assert_eq!(payload["total_tokens"], 3);
    }
}

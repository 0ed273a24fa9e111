use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{
    error::ServiceError,
    model::{
        GenerationSummary, ModelRuntime, RuntimeChunk, RuntimeRequest, RuntimeSummary,
        StopReason, estimate_tokens,
    },
    scheduler::queue::{Dispatched, QueueEntry},
    streaming::StreamEvent,
};

struct TurnState {
    next_ticket: u64,
    serving: u64,
    finished: BTreeSet<u64>,
}

/// Ticket lock over the model runtime. Tickets are served strictly in
/// issue order; a ticket dropped before its turn is skipped.
pub struct TurnGate {
    state: Mutex<TurnState>,
    advanced: Notify,
}

/// One ticket. Finishes its turn when dropped, whether or not it was served.
pub struct Turn {
    gate: Arc<TurnGate>,
    ticket: u64,
}

impl TurnGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TurnState {
                next_ticket: 0,
                serving: 0,
                finished: BTreeSet::new(),
            }),
            advanced: Notify::new(),
        }
    }

    pub fn issue(self: &Arc<Self>) -> Turn {
        let mut state = self.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        Turn {
            gate: Arc::clone(self),
            ticket,
        }
    }

    /// Ticket currently allowed to use the runtime.
    pub fn serving(&self) -> u64 {
        self.state.lock().serving
    }

    fn finish(&self, ticket: u64) {
        {
            let mut state = self.state.lock();
            state.finished.insert(ticket);
            loop {
                let serving = state.serving;
                if !state.finished.remove(&serving) {
                    break;
                }
                state.serving += 1;
            }
        }
        self.advanced.notify_waiters();
    }
}

impl Default for TurnGate {
    fn default() -> Self {
        Self::new()
    }
}

impl Turn {
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Suspend until every earlier ticket has finished.
    pub async fn acquire(&self) {
        loop {
            let notified = self.gate.advanced.notified();
            if self.gate.state.lock().serving == self.ticket {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for Turn {
    fn drop(&mut self) {
        self.gate.finish(self.ticket);
    }
}

/// Runs dispatched entries against the runtime, one generation at a time.
pub struct InferenceSerializer {
    runtime: Arc<dyn ModelRuntime>,
    stall_timeout: Duration,
    context_size: usize,
}

impl InferenceSerializer {
    pub fn new(runtime: Arc<dyn ModelRuntime>, stall_timeout: Duration, context_size: usize) -> Self {
        Self {
            runtime,
            stall_timeout,
            context_size,
        }
    }

    /// Serve one entry to completion. Every exit path releases the turn and
    /// the dispatch slot, and every non-cancelled path ends the event stream
    /// with exactly one terminal event.
    pub async fn run(&self, dispatched: Dispatched) {
        let Dispatched {
            entry,
            sink,
            turn,
            lease,
        } = dispatched;

        tokio::select! {
            _ = turn.acquire() => {}
            _ = entry.cancelled() => {
                info!(request_id = entry.id(), "request cancelled before reaching the runtime");
                return;
            }
        }

        let started = Instant::now();
        let queue_ms = millis(started.duration_since(entry.enqueued_at()));
        debug!(
            request_id = entry.id(),
            ticket = turn.ticket(),
            queue_ms,
            "runtime acquired"
        );

        let outcome = self.generate(&entry, &sink, started, queue_ms).await;
        // Runtime is free for the next ticket before the client hears about it.
        drop(turn);

        match outcome {
            Ok(summary) => {
                info!(
                    request_id = entry.id(),
                    owner = %entry.request().owner,
                    completion_tokens = summary.completion_tokens,
                    latency_ms = summary.latency_ms,
                    "generation finished"
                );
                let _ = sink.send(StreamEvent::Done(summary)).await;
            }
            Err(ServiceError::Cancelled) => {
                info!(request_id = entry.id(), "generation cancelled by client");
            }
            Err(err @ ServiceError::ModelStall(_)) => {
                warn!(request_id = entry.id(), error = %err, "generation stalled");
                let _ = sink.send(StreamEvent::Error(err)).await;
            }
            Err(err) => {
                warn!(request_id = entry.id(), error = %err, "generation failed");
                let _ = sink.send(StreamEvent::Error(err)).await;
            }
        }
        drop(lease);
    }

    async fn generate(
        &self,
        entry: &QueueEntry,
        sink: &mpsc::Sender<StreamEvent>,
        started: Instant,
        queue_ms: f64,
    ) -> Result<GenerationSummary, ServiceError> {
        let request = entry.request();
        let max_tokens = request.params.max_tokens;
        let runtime_request = RuntimeRequest {
            prompt: request.prompt.clone(),
            system: request.system.clone(),
            params: request.params.clone(),
            context_size: entry.context_size().unwrap_or(self.context_size),
        };

        let mut tokens = tokio::select! {
            opened = timeout(self.stall_timeout, self.runtime.generate(runtime_request)) => {
                opened.map_err(|_| ServiceError::ModelStall(self.stall_timeout))??
            }
            _ = entry.cancelled() => return Err(ServiceError::Cancelled),
        };

        let mut produced = 0u32;
        let mut ttft_ms = None;
        let mut reported: Option<RuntimeSummary> = None;
        let mut truncated = false;

        loop {
            if entry.is_cancelled() {
                return Err(ServiceError::Cancelled);
            }
            if produced >= max_tokens {
                // The runtime's own summary may still trail the last fragment.
                let trailing = tokio::select! {
                    next = timeout(self.stall_timeout, tokens.next()) => next,
                    _ = entry.cancelled() => return Err(ServiceError::Cancelled),
                };
                match trailing {
                    Ok(Some(Ok(RuntimeChunk::Finished(summary)))) => reported = Some(summary),
                    _ => truncated = true,
                }
                break;
            }

            let next = tokio::select! {
                next = timeout(self.stall_timeout, tokens.next()) => next,
                _ = entry.cancelled() => return Err(ServiceError::Cancelled),
            };
            match next {
                Err(_) => return Err(ServiceError::ModelStall(self.stall_timeout)),
                Ok(None) => break,
                Ok(Some(Err(err))) => return Err(err),
                Ok(Some(Ok(RuntimeChunk::Finished(summary)))) => {
                    reported = Some(summary);
                    break;
                }
                Ok(Some(Ok(RuntimeChunk::Text(fragment)))) => {
                    if fragment.is_empty() {
                        continue;
                    }
                    ttft_ms.get_or_insert_with(|| millis(started.elapsed()));
                    produced += 1;
                    tokio::select! {
                        sent = sink.send(StreamEvent::Token(fragment)) => {
                            if sent.is_err() {
                                return Err(ServiceError::Cancelled);
                            }
                        }
                        _ = entry.cancelled() => return Err(ServiceError::Cancelled),
                    }
                }
            }
        }
        drop(tokens);

        let reported = reported.unwrap_or_default();
        let prompt_tokens = reported
            .prompt_tokens
            .unwrap_or_else(|| estimate_tokens(&request.prompt));
        let (completion_tokens, stop_reason) = if truncated {
            (produced, StopReason::Length)
        } else {
            (
                reported.completion_tokens.unwrap_or(produced),
                reported.stop_reason.unwrap_or(StopReason::Stop),
            )
        };

        Ok(GenerationSummary {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            stop_reason,
            queue_ms,
            ttft_ms,
            latency_ms: millis(started.elapsed()),
        })
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_turns_are_served_in_issue_order() {
        let gate = Arc::new(TurnGate::new());
        let first = gate.issue();
        let second = gate.issue();
        let third = gate.issue();

        first.acquire().await;
        let blocked =
            tokio::time::timeout(Duration::from_millis(30), second.acquire()).await;
        assert!(blocked.is_err());

        drop(first);
        second.acquire().await;
        assert_eq!(gate.serving(), 1);
        drop(second);
        third.acquire().await;
    }

    #[tokio::test]
    async fn test_abandoned_ticket_is_skipped() {
        let gate = Arc::new(TurnGate::new());
        let first = gate.issue();
        let second = gate.issue();
        let third = gate.issue();

        // Second gives up while first still holds the runtime.
        drop(second);
        assert_eq!(gate.serving(), 0);

        drop(first);
        assert_eq!(gate.serving(), 2);
        tokio::time::timeout(Duration::from_millis(100), third.acquire())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let gate = Arc::new(TurnGate::new());
        let first = gate.issue();
        let second = gate.issue();

        let waiter = tokio::spawn(async move {
            second.acquire().await;
            second.ticket()
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(first);

        let ticket = tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ticket, 1);
    }
}

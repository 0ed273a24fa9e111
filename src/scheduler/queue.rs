//! Bounded FIFO backlog with a dispatch concurrency gate.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    error::ServiceError,
    model::GenerationRequest,
    scheduler::serializer::{Turn, TurnGate},
    streaming::StreamEvent,
};

/// An admitted request. Consumed exactly once by the serializer.
#[derive(Debug)]
pub struct QueueEntry {
    id: String,
    request: GenerationRequest,
    context_size: Option<usize>,
    enqueued_at: Instant,
    cancelled: AtomicBool,
    cancel_notify: Notify,
}

impl QueueEntry {
    pub fn new(request: GenerationRequest, context_size: Option<usize>) -> Self {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(8);
        Self {
            id,
            request,
            context_size,
            enqueued_at: Instant::now(),
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn request(&self) -> &GenerationRequest {
        &self.request
    }

    /// Context window override; `None` means the configured default.
    pub fn context_size(&self) -> Option<usize> {
        self.context_size
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    /// Set by the transport when the client goes away.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.cancel_notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.cancel_notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue_size: usize,
    pub active_requests: usize,
    pub max_concurrent: usize,
}

struct Pending {
    entry: Arc<QueueEntry>,
    sink: mpsc::Sender<StreamEvent>,
}

struct QueueState {
    backlog: VecDeque<Pending>,
    active: usize,
    closed: bool,
}

pub struct AdmissionQueue {
    state: Mutex<QueueState>,
    available: Notify,
    gate: Arc<TurnGate>,
    max_queue_size: usize,
    max_concurrent: usize,
}

/// A dequeued entry on its way to the serializer. Holds one of the
/// `max_concurrent` dispatch slots until dropped.
pub struct Dispatched {
    pub entry: Arc<QueueEntry>,
    pub sink: mpsc::Sender<StreamEvent>,
    pub turn: Turn,
    pub lease: ActiveLease,
}

pub struct ActiveLease {
    queue: Arc<AdmissionQueue>,
}

impl Drop for ActiveLease {
    fn drop(&mut self) {
        self.queue.release();
    }
}

impl AdmissionQueue {
    pub fn new(max_queue_size: usize, max_concurrent: usize, gate: Arc<TurnGate>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                backlog: VecDeque::with_capacity(max_queue_size.min(1024)),
                active: 0,
                closed: false,
            }),
            available: Notify::new(),
            gate,
            max_queue_size,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Place an entry at the tail, or reject without blocking when the
    /// backlog is at capacity. Check and insert happen under one lock.
    pub fn admit(
        &self,
        entry: Arc<QueueEntry>,
        sink: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ServiceError> {
        let queue_size = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ServiceError::ShuttingDown);
            }
            if state.backlog.len() >= self.max_queue_size {
                drop(state);
                warn!(
                    request_id = entry.id(),
                    capacity = self.max_queue_size,
                    "queue full, rejecting request"
                );
                return Err(ServiceError::QueueFull {
                    capacity: self.max_queue_size,
                });
            }
            state.backlog.push_back(Pending {
                entry: entry.clone(),
                sink,
            });
            state.backlog.len()
        };

        debug!(request_id = entry.id(), queue_size, "request queued");
        self.available.notify_waiters();
        Ok(())
    }

    /// Wait for the head entry and a free dispatch slot, then take both.
    /// Returns `None` once the queue is closed.
    pub async fn dequeue(self: &Arc<Self>) -> Option<Dispatched> {
        loop {
            let notified = self.available.notified();
            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if state.active < self.max_concurrent {
                    if let Some(pending) = state.backlog.pop_front() {
                        state.active += 1;
                        // Issued under the queue lock so turns follow FIFO order.
                        let turn = self.gate.issue();
                        debug!(
                            request_id = pending.entry.id(),
                            ticket = turn.ticket(),
                            active = state.active,
                            queue_size = state.backlog.len(),
                            "request dispatched"
                        );
                        return Some(Dispatched {
                            entry: pending.entry,
                            sink: pending.sink,
                            turn,
                            lease: ActiveLease {
                                queue: Arc::clone(self),
                            },
                        });
                    }
                }
            }
            notified.await;
        }
    }

    /// Drop a still-queued entry, e.g. after its client disconnected.
    pub fn withdraw(&self, id: &str) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let before = state.backlog.len();
            state.backlog.retain(|pending| pending.entry.id() != id);
            before != state.backlog.len()
        };
        if removed {
            debug!(request_id = id, "queued request withdrawn");
        }
        removed
    }

    /// Read-only snapshot for health reporting.
    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            queue_size: state.backlog.len(),
            active_requests: state.active,
            max_concurrent: self.max_concurrent,
        }
    }

    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    /// Reject new work, drop the backlog and wake every waiting dispatcher.
    pub fn close(&self) {
        let drained: Vec<Pending> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.backlog.drain(..).collect()
        };
        for pending in &drained {
            pending.entry.cancel();
        }
        self.available.notify_waiters();
    }

    fn release(&self) {
        {
            let mut state = self.state.lock();
            state.active = state.active.saturating_sub(1);
        }
        self.available.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::model::{GenerationRequest, SamplingParams};

    fn params() -> SamplingParams {
        SamplingParams {
            max_tokens: 8,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            stop: Vec::new(),
            seed: None,
        }
    }

    fn entry(tag: &str) -> Arc<QueueEntry> {
        Arc::new(QueueEntry::new(
            GenerationRequest::new(tag, params(), "tester"),
            None,
        ))
    }

    fn queue(max_queue: usize, max_concurrent: usize) -> Arc<AdmissionQueue> {
        Arc::new(AdmissionQueue::new(
            max_queue,
            max_concurrent,
            Arc::new(TurnGate::new()),
        ))
    }

    fn sink() -> mpsc::Sender<StreamEvent> {
        mpsc::channel(1).0
    }

    #[tokio::test]
    async fn test_dequeue_is_fifo() {
        let queue = queue(8, 8);
        for tag in ["a", "b", "c"] {
            queue.admit(entry(tag), sink()).unwrap();
        }

        let mut order = Vec::new();
        let mut held = Vec::new();
        for _ in 0..3 {
            let dispatched = queue.dequeue().await.unwrap();
            order.push(dispatched.entry.request().prompt.clone());
            held.push(dispatched);
        }
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(
            held.iter().map(|d| d.turn.ticket()).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[tokio::test]
    async fn test_admission_rejects_at_capacity() {
        let queue = queue(2, 1);
        queue.admit(entry("1"), sink()).unwrap();
        queue.admit(entry("2"), sink()).unwrap();

        let err = queue.admit(entry("3"), sink()).unwrap_err();
        assert!(matches!(err, ServiceError::QueueFull { capacity: 2 }));
        assert_eq!(queue.stats().queue_size, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admissions_never_exceed_limit() {
        let queue = queue(10, 1);
        let mut handles = Vec::new();
        for i in 0..15 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.admit(entry(&i.to_string()), sink()).is_ok()
            }));
        }

        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 10);
        assert_eq!(queue.stats().queue_size, 10);
    }

    #[tokio::test]
    async fn test_concurrency_gate_blocks_until_release() {
        let queue = queue(8, 1);
        queue.admit(entry("first"), sink()).unwrap();
        queue.admit(entry("second"), sink()).unwrap();

        let first = queue.dequeue().await.unwrap();
        assert_eq!(queue.stats().active_requests, 1);

        // Slot is taken: the second dequeue must wait.
        let blocked = tokio::time::timeout(Duration::from_millis(50), queue.dequeue()).await;
        assert!(blocked.is_err());
        assert_eq!(queue.stats().queue_size, 1);

        drop(first);
        let second = tokio::time::timeout(Duration::from_millis(500), queue.dequeue())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.entry.request().prompt, "second");
    }

    #[tokio::test]
    async fn test_withdraw_frees_backlog_slot() {
        let queue = queue(1, 1);
        let e = entry("gone");
        queue.admit(e.clone(), sink()).unwrap();
        assert!(queue.withdraw(e.id()));
        assert!(!queue.withdraw(e.id()));
        queue.admit(entry("next"), sink()).unwrap();
    }

    #[tokio::test]
    async fn test_close_wakes_dispatchers() {
        let queue = queue(4, 1);
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await.is_none() })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();
        assert!(waiter.await.unwrap());
        assert!(matches!(
            queue.admit(entry("late"), sink()),
            Err(ServiceError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_cancel_notifies_waiters() {
        let e = entry("x");
        let waiter = {
            let e = e.clone();
            tokio::spawn(async move { e.cancelled().await })
        };
        e.cancel();
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(e.is_cancelled());
    }
}

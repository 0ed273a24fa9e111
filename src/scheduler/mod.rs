//! Admission-controlled, single-runtime scheduling.
//!
//! Requests are admitted into a bounded FIFO [`AdmissionQueue`]. Up to
//! `max_concurrent` dispatcher tasks pull from its head; each dispatched entry
//! takes a turn ticket and waits at the [`InferenceSerializer`] until every
//! earlier ticket has finished, so the runtime only ever serves one
//! generation at a time and in arrival order.

mod queue;
pub(crate) mod serializer;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info};

pub use queue::{ActiveLease, AdmissionQueue, Dispatched, QueueEntry, QueueStats};
pub use serializer::{InferenceSerializer, Turn, TurnGate};

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{GenerationRequest, ModelRuntime},
    streaming::ResponseStream,
};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub max_queue_size: usize,
    pub stall_timeout: Duration,
    pub stream_buffer: usize,
    pub context_size: usize,
}

impl SchedulerConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent_requests,
            max_queue_size: config.max_queue_size,
            stall_timeout: config.stall_timeout,
            stream_buffer: config.stream_buffer,
            context_size: config.n_ctx,
        }
    }
}

pub struct Scheduler {
    queue: Arc<AdmissionQueue>,
    stream_buffer: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Build the queue and serializer and spawn the dispatchers. Must be
    /// called from within a tokio runtime.
    pub fn start(runtime: Arc<dyn ModelRuntime>, config: SchedulerConfig) -> Arc<Self> {
        let gate = Arc::new(TurnGate::new());
        let queue = Arc::new(AdmissionQueue::new(
            config.max_queue_size,
            config.max_concurrent,
            gate,
        ));
        let serializer = Arc::new(InferenceSerializer::new(
            runtime,
            config.stall_timeout,
            config.context_size,
        ));

        let dispatchers = config.max_concurrent.max(1);
        let workers = (0..dispatchers)
            .map(|worker| tokio::spawn(dispatch_loop(worker, queue.clone(), serializer.clone())))
            .collect();

        info!(
            max_concurrent = dispatchers,
            max_queue_size = config.max_queue_size,
            stall_timeout_secs = config.stall_timeout.as_secs_f64(),
            "scheduler started"
        );

        Arc::new(Self {
            queue,
            stream_buffer: config.stream_buffer.max(1),
            workers: Mutex::new(workers),
        })
    }

    /// Admit a request with the default context window.
    pub fn submit(&self, request: GenerationRequest) -> Result<ResponseStream, ServiceError> {
        self.submit_with_context(request, None)
    }

    /// Admit a request, optionally overriding the runtime context window.
    /// Fails immediately with `QueueFull` when the backlog is saturated.
    pub fn submit_with_context(
        &self,
        request: GenerationRequest,
        context_size: Option<usize>,
    ) -> Result<ResponseStream, ServiceError> {
        let entry = Arc::new(QueueEntry::new(request, context_size));
        let (tx, rx) = mpsc::channel(self.stream_buffer);
        self.queue.admit(entry.clone(), tx)?;
        debug!(
            request_id = entry.id(),
            owner = %entry.request().owner,
            stream = entry.request().stream,
            "request admitted"
        );
        Ok(ResponseStream::new(entry, self.queue.clone(), rx))
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Stop accepting work, cancel the backlog and stop the dispatchers.
    /// Generations already at the runtime run to their next token boundary.
    pub fn shutdown(&self) {
        self.queue.close();
        for handle in self.workers.lock().drain(..) {
            handle.abort();
        }
        info!("scheduler stopped");
    }
}

async fn dispatch_loop(
    worker: usize,
    queue: Arc<AdmissionQueue>,
    serializer: Arc<InferenceSerializer>,
) {
    while let Some(dispatched) = queue.dequeue().await {
        let request_id = dispatched.entry.id().to_string();
        let serializer = serializer.clone();
        // A panicking generation must not take the dispatcher down with it.
        let run = tokio::spawn(async move { serializer.run(dispatched).await });
        if let Err(err) = run.await {
            error!(worker, request_id = %request_id, error = %err, "generation task aborted");
        }
    }
    debug!(worker, "dispatcher stopped");
}

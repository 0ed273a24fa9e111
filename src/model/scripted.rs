//! Deterministic in-process runtime.
//!
//! Echoes the prompt back word by word unless a fixed script is configured.
//! Used as the `scripted` backend for smoke-testing a deployment without a
//! model, and as the runtime in the scheduler's tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    error::ServiceError,
    model::{
        ModelRuntime, RuntimeChunk, RuntimeRequest, RuntimeSummary, StopReason, TokenStream,
        estimate_tokens,
    },
};

pub struct ScriptedRuntime {
    name: String,
    script: Option<Vec<String>>,
    token_delay: Duration,
    stall_at: Option<usize>,
    fail_at: Option<usize>,
    summary_delay: Duration,
    loaded: AtomicBool,
    load_failures: AtomicUsize,
    emitted: Arc<AtomicUsize>,
    in_service: Arc<AtomicUsize>,
    peak_in_service: Arc<AtomicUsize>,
    calls: Mutex<Vec<RuntimeRequest>>,
}

impl ScriptedRuntime {
    /// Echo runtime with no artificial delay.
    pub fn echo() -> Self {
        Self {
            name: "scripted-echo".to_string(),
            script: None,
            token_delay: Duration::ZERO,
            stall_at: None,
            fail_at: None,
            summary_delay: Duration::ZERO,
            loaded: AtomicBool::new(true),
            load_failures: AtomicUsize::new(0),
            emitted: Arc::new(AtomicUsize::new(0)),
            in_service: Arc::new(AtomicUsize::new(0)),
            peak_in_service: Arc::new(AtomicUsize::new(0)),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Always produce these fragments, regardless of the prompt.
    pub fn with_script<I, S>(mut self, fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script = Some(fragments.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Stop producing output forever before fragment `index`.
    pub fn stall_at(mut self, index: usize) -> Self {
        self.stall_at = Some(index);
        self
    }

    /// Fail with a runtime error before fragment `index`.
    pub fn fail_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }

    /// Hold the final summary back for `delay` after the last fragment.
    pub fn with_summary_delay(mut self, delay: Duration) -> Self {
        self.summary_delay = delay;
        self
    }

    pub fn unloaded(self) -> Self {
        self.loaded.store(false, Ordering::Release);
        self
    }

    /// Start unloaded and fail the next `attempts` calls to `load`.
    pub fn failing_loads(self, attempts: usize) -> Self {
        self.load_failures.store(attempts, Ordering::Release);
        self.unloaded()
    }

    /// Fragments handed out across every generation so far.
    pub fn emitted(&self) -> usize {
        self.emitted.load(Ordering::SeqCst)
    }

    /// Highest number of generations observed running at once.
    pub fn peak_in_service(&self) -> usize {
        self.peak_in_service.load(Ordering::SeqCst)
    }

    pub fn in_service(&self) -> usize {
        self.in_service.load(Ordering::SeqCst)
    }

    /// Requests in the order the runtime received them.
    pub fn calls(&self) -> Vec<RuntimeRequest> {
        self.calls.lock().clone()
    }

    fn fragments_for(&self, request: &RuntimeRequest) -> Vec<String> {
        match &self.script {
            Some(script) => script.clone(),
            None => request
                .prompt
                .split_inclusive(char::is_whitespace)
                .map(str::to_string)
                .collect(),
        }
    }
}

/// Tracks one running generation; lives as long as its token stream.
struct ServiceMark {
    in_service: Arc<AtomicUsize>,
}

impl ServiceMark {
    fn enter(in_service: Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
        let now = in_service.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { in_service }
    }
}

impl Drop for ServiceMark {
    fn drop(&mut self) {
        self.in_service.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ModelRuntime for ScriptedRuntime {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn model_path(&self) -> &str {
        "scripted://echo"
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    async fn load(&self) -> Result<(), ServiceError> {
        let failing = self
            .load_failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ServiceError::ModelLoading);
        }
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    async fn generate(&self, request: RuntimeRequest) -> Result<TokenStream, ServiceError> {
        if !self.is_loaded() {
            return Err(ServiceError::ModelLoading);
        }
        self.calls.lock().push(request.clone());

        let mark = ServiceMark::enter(self.in_service.clone(), &self.peak_in_service);
        let fragments = self.fragments_for(&request);
        let prompt_tokens = estimate_tokens(&request.prompt);
        let max_tokens = request.params.max_tokens as usize;
        let stop = request.params.stop.clone();
        let delay = self.token_delay;
        let stall_at = self.stall_at;
        let fail_at = self.fail_at;
        let summary_delay = self.summary_delay;
        let emitted = self.emitted.clone();

        let stream = stream! {
            let _mark = mark;
            let mut produced = 0usize;
            let mut text = String::new();
            let mut stop_reason = StopReason::Stop;

            for (index, fragment) in fragments.into_iter().enumerate() {
                if produced == max_tokens {
                    stop_reason = StopReason::Length;
                    break;
                }
                if stall_at == Some(index) {
                    futures::future::pending::<()>().await;
                }
                if fail_at == Some(index) {
                    yield Err(ServiceError::Inference("scripted runtime failure".into()));
                    return;
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }

                text.push_str(&fragment);
                if let Some(needle) = stop.iter().find(|s| !s.is_empty() && text.contains(s.as_str())) {
                    // Emit only what precedes the stop sequence.
                    let cut = text.len() - fragment.len();
                    let end = text.find(needle.as_str()).unwrap_or(text.len());
                    if end > cut {
                        produced += 1;
                        emitted.fetch_add(1, Ordering::SeqCst);
                        yield Ok(RuntimeChunk::Text(text[cut..end].to_string()));
                    }
                    break;
                }

                produced += 1;
                emitted.fetch_add(1, Ordering::SeqCst);
                yield Ok::<_, ServiceError>(RuntimeChunk::Text(fragment));
            }

            if !summary_delay.is_zero() {
                tokio::time::sleep(summary_delay).await;
            }
            yield Ok(RuntimeChunk::Finished(RuntimeSummary {
                prompt_tokens: Some(prompt_tokens),
                completion_tokens: Some(produced as u32),
                stop_reason: Some(stop_reason),
            }));
        };

        Ok(Box::pin(stream))
    }
}

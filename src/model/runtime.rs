use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::{
    error::ServiceError,
    model::{SamplingParams, StopReason},
};

/// What the runtime is asked to do for one generation.
#[derive(Debug, Clone)]
pub struct RuntimeRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub params: SamplingParams,
    pub context_size: usize,
}

/// Counts reported by the runtime once it has finished. Any field may be
/// missing, in which case the serializer derives it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeSummary {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub stop_reason: Option<StopReason>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeChunk {
    Text(String),
    Finished(RuntimeSummary),
}

/// Lazy token sequence produced by a runtime. Dropping it abandons the generation.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<RuntimeChunk, ServiceError>> + Send>>;

/// The single local model. Implementations need not be safe for concurrent
/// `generate` calls; the scheduler never issues more than one at a time.
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    fn model_name(&self) -> &str;

    fn model_path(&self) -> &str;

    fn is_loaded(&self) -> bool;

    async fn load(&self) -> Result<(), ServiceError>;

    async fn generate(&self, request: RuntimeRequest) -> Result<TokenStream, ServiceError>;
}

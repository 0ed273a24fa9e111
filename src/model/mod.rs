#[cfg(feature = "tch-backend")]
mod loader;
mod ollama;
mod runtime;
pub mod sampling;
mod scripted;
mod types;

#[cfg(feature = "tch-backend")]
pub use loader::TorchRuntime;
pub use ollama::OllamaRuntime;
pub use runtime::{ModelRuntime, RuntimeChunk, RuntimeRequest, RuntimeSummary, TokenStream};
pub use scripted::ScriptedRuntime;
pub use types::{
    GenerationRequest, GenerationResult, GenerationSummary, SamplingParams, StopReason,
    estimate_tokens,
};

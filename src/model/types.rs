use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sampling controls forwarded to the runtime unmodified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub stop: Vec<String>,
    pub seed: Option<u64>,
}

/// A validated generation request. Immutable once enqueued.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub params: SamplingParams,
    pub stream: bool,
    pub owner: String,
    pub received_at: DateTime<Utc>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, params: SamplingParams, owner: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            params,
            stream: false,
            owner: owner.into(),
            received_at: Utc::now(),
        }
    }

    pub fn with_system(mut self, system: Option<String>) -> Self {
        self.system = system;
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural end of sequence or a stop sequence matched.
    Stop,
    /// `max_tokens` bound reached.
    Length,
}

/// Accounting attached to the terminal `done` event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationSummary {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub stop_reason: StopReason,
    pub queue_ms: f64,
    pub ttft_ms: Option<f64>,
    pub latency_ms: f64,
}

/// Outcome of a fully drained generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResult {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub stop_reason: StopReason,
    pub ttft_ms: Option<f64>,
    pub latency_ms: f64,
}

impl GenerationResult {
    pub fn from_parts(text: String, summary: GenerationSummary) -> Self {
        Self {
            text,
            prompt_tokens: summary.prompt_tokens,
            completion_tokens: summary.completion_tokens,
            total_tokens: summary.total_tokens,
            stop_reason: summary.stop_reason,
            ttft_ms: summary.ttft_ms,
            latency_ms: summary.latency_ms,
        }
    }
}

/// Rough token estimate used when the runtime reports no counts.
pub fn estimate_tokens(text: &str) -> u32 {
    let words = text.split_whitespace().count() as f64;
    (words * 1.3).ceil() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("one"), 2);
        assert_eq!(estimate_tokens("what is the capital of france"), 8);
    }

    #[test]
    fn test_stop_reason_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&StopReason::Length).unwrap(), "\"length\"");
        assert_eq!(serde_json::to_string(&StopReason::Stop).unwrap(), "\"stop\"");
    }
}

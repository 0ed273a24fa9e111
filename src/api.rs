//! Request and response bodies of the HTTP surface.

use serde::{Deserialize, Serialize};

use crate::{
    benchmark::BenchmarkPlan,
    config::AppConfig,
    error::ServiceError,
    model::{GenerationRequest, GenerationResult, SamplingParams, StopReason},
    scheduler::QueueStats,
};

pub const MAX_PROMPT_CHARS: usize = 8192;
pub const MAX_SYSTEM_CHARS: usize = 4096;
pub const MAX_OWNER_CHARS: usize = 128;
pub const MAX_STOP_SEQUENCES: usize = 4;
pub const MAX_BENCHMARK_RUNS: usize = 10;
pub const MAX_BENCHMARK_CONTEXTS: usize = 8;
const MAX_TOKENS_LIMIT: u32 = 2048;
const CONTEXT_RANGE: std::ops::RangeInclusive<usize> = 128..=32768;

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateBody {
    pub prompt: String,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_stream() -> bool {
    true
}

impl GenerateBody {
    /// Check every bound and fill omitted fields from the configured defaults.
    pub fn into_request(
        self,
        config: &AppConfig,
        owner: &str,
    ) -> Result<GenerationRequest, ServiceError> {
        check_len("prompt", &self.prompt, 1, MAX_PROMPT_CHARS)?;
        if let Some(system) = &self.system {
            check_len("system", system, 0, MAX_SYSTEM_CHARS)?;
        }
        let stop = self.stop.unwrap_or_default();
        if stop.len() > MAX_STOP_SEQUENCES {
            return Err(ServiceError::Validation(format!(
                "stop accepts at most {MAX_STOP_SEQUENCES} sequences"
            )));
        }

        let defaults = config.default_sampling();
        let params = SamplingParams {
            max_tokens: self.max_tokens.unwrap_or(defaults.max_tokens),
            temperature: self.temperature.unwrap_or(defaults.temperature),
            top_p: self.top_p.unwrap_or(defaults.top_p),
            top_k: self.top_k.unwrap_or(defaults.top_k),
            stop,
            seed: self.seed,
        };
        validate_sampling(&params)?;

        Ok(GenerationRequest::new(self.prompt, params, owner)
            .with_system(self.system.filter(|s| !s.is_empty()))
            .streaming(self.stream))
    }
}

fn validate_sampling(params: &SamplingParams) -> Result<(), ServiceError> {
    if !(1..=MAX_TOKENS_LIMIT).contains(&params.max_tokens) {
        return Err(ServiceError::Validation(format!(
            "max_tokens must be within 1..={MAX_TOKENS_LIMIT}"
        )));
    }
    if !(0.0..=2.0).contains(&params.temperature) {
        return Err(ServiceError::Validation(
            "temperature must be within 0.0..=2.0".into(),
        ));
    }
    if !(0.0..=1.0).contains(&params.top_p) {
        return Err(ServiceError::Validation("top_p must be within 0.0..=1.0".into()));
    }
    if !(1..=100).contains(&params.top_k) {
        return Err(ServiceError::Validation("top_k must be within 1..=100".into()));
    }
    Ok(())
}

fn check_len(field: &str, value: &str, min: usize, max: usize) -> Result<(), ServiceError> {
    let chars = value.chars().count();
    if chars < min || chars > max {
        return Err(ServiceError::Validation(format!(
            "{field} must be {min}..={max} characters, got {chars}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateResponse {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub stop_reason: StopReason,
}

impl From<GenerationResult> for GenerateResponse {
    fn from(result: GenerationResult) -> Self {
        Self {
            text: result.text,
            prompt_tokens: result.prompt_tokens,
            completion_tokens: result.completion_tokens,
            total_tokens: result.total_tokens,
            stop_reason: result.stop_reason,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyRequest {
    pub owner: String,
}

impl KeyRequest {
    pub fn validate(&self) -> Result<&str, ServiceError> {
        let owner = self.owner.trim();
        check_len("owner", owner, 1, MAX_OWNER_CHARS)?;
        Ok(owner)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BenchmarkBody {
    pub prompt: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<u32>,
    pub runs: usize,
    pub context_sizes: Vec<usize>,
}

impl BenchmarkBody {
    pub fn into_plan(self, config: &AppConfig) -> Result<BenchmarkPlan, ServiceError> {
        check_len("prompt", &self.prompt, 1, MAX_PROMPT_CHARS)?;
        if !(1..=MAX_BENCHMARK_RUNS).contains(&self.runs) {
            return Err(ServiceError::Validation(format!(
                "runs must be within 1..={MAX_BENCHMARK_RUNS}"
            )));
        }
        if self.context_sizes.is_empty() || self.context_sizes.len() > MAX_BENCHMARK_CONTEXTS {
            return Err(ServiceError::Validation(format!(
                "context_sizes must list 1..={MAX_BENCHMARK_CONTEXTS} values"
            )));
        }
        if let Some(bad) = self
            .context_sizes
            .iter()
            .find(|&&size| !CONTEXT_RANGE.contains(&size))
        {
            return Err(ServiceError::Validation(format!(
                "context size {bad} outside {}..={}",
                CONTEXT_RANGE.start(),
                CONTEXT_RANGE.end()
            )));
        }

        let defaults = config.default_sampling();
        let params = SamplingParams {
            max_tokens: self.max_tokens.unwrap_or(defaults.max_tokens),
            temperature: self.temperature.unwrap_or(defaults.temperature),
            top_p: self.top_p.unwrap_or(defaults.top_p),
            top_k: self.top_k.unwrap_or(defaults.top_k),
            stop: Vec::new(),
            seed: None,
        };
        validate_sampling(&params)?;

        Ok(BenchmarkPlan {
            prompt: self.prompt,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            top_k: params.top_k,
            runs: self.runs,
            context_sizes: self.context_sizes,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub model_loaded: bool,
    pub model_path: String,
    pub queue_size: usize,
    pub active_requests: usize,
    pub max_concurrent: usize,
}

impl HealthResponse {
    pub fn new(model_loaded: bool, model_path: &str, stats: QueueStats) -> Self {
        Self {
            status: if model_loaded { "healthy" } else { "degraded" },
            model_loaded,
            model_path: model_path.to_string(),
            queue_size: stats.queue_size,
            active_requests: stats.active_requests,
            max_concurrent: stats.max_concurrent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(json: serde_json::Value) -> GenerateBody {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = AppConfig::default();
        let request = body(serde_json::json!({"prompt": "hi"}))
            .into_request(&config, "alice")
            .unwrap();

        assert!(request.stream);
        assert_eq!(request.owner, "alice");
        assert_eq!(request.params.max_tokens, 512);
        assert_eq!(request.params.top_k, 40);
        assert!(request.params.stop.is_empty());
    }

    #[test]
    fn test_out_of_range_parameters_rejected() {
        let config = AppConfig::default();
        let cases = [
            serde_json::json!({"prompt": ""}),
            serde_json::json!({"prompt": "x".repeat(MAX_PROMPT_CHARS + 1)}),
            serde_json::json!({"prompt": "x", "system": "s".repeat(MAX_SYSTEM_CHARS + 1)}),
            serde_json::json!({"prompt": "x", "max_tokens": 0}),
            serde_json::json!({"prompt": "x", "max_tokens": 4096}),
            serde_json::json!({"prompt": "x", "temperature": 2.5}),
            serde_json::json!({"prompt": "x", "top_p": 1.5}),
            serde_json::json!({"prompt": "x", "top_k": 0}),
            serde_json::json!({"prompt": "x", "stop": ["a", "b", "c", "d", "e"]}),
        ];
        for case in cases {
            let err = body(case.clone()).into_request(&config, "o").unwrap_err();
            assert!(matches!(err, ServiceError::Validation(_)), "{case}");
        }
    }

    #[test]
    fn test_prompt_length_counts_chars() {
        let config = AppConfig::default();
        let prompt = "é".repeat(MAX_PROMPT_CHARS);
        assert!(body(serde_json::json!({"prompt": prompt})).into_request(&config, "o").is_ok());
    }

    #[test]
    fn test_benchmark_plan_validation() {
        let config = AppConfig::default();
        let plan: BenchmarkBody = serde_json::from_value(serde_json::json!({
            "prompt": "bench", "runs": 3, "context_sizes": [512, 1024], "max_tokens": 64
        }))
        .unwrap();
        let plan = plan.into_plan(&config).unwrap();
        assert_eq!(plan.max_tokens, 64);
        assert_eq!(plan.context_sizes, vec![512, 1024]);

        for bad in [
            serde_json::json!({"prompt": "b", "runs": 0, "context_sizes": [512]}),
            serde_json::json!({"prompt": "b", "runs": 11, "context_sizes": [512]}),
            serde_json::json!({"prompt": "b", "runs": 1, "context_sizes": []}),
            serde_json::json!({"prompt": "b", "runs": 1, "context_sizes": [64]}),
        ] {
            let body: BenchmarkBody = serde_json::from_value(bad).unwrap();
            assert!(body.into_plan(&config).is_err());
        }
    }

    #[test]
    fn test_owner_is_trimmed_and_bounded() {
        let ok = KeyRequest { owner: "  svc  ".into() };
        assert_eq!(ok.validate().unwrap(), "svc");
        let empty = KeyRequest { owner: "   ".into() };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_health_status_reflects_model() {
        let stats = QueueStats {
            queue_size: 2,
            active_requests: 1,
            max_concurrent: 4,
        };
        assert_eq!(HealthResponse::new(true, "m", stats).status, "healthy");
        assert_eq!(HealthResponse::new(false, "m", stats).status, "degraded");
    }
}

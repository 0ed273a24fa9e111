use std::collections::BTreeMap;

use serde::Serialize;
use tracing::info;

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{GenerationRequest, GenerationResult, SamplingParams},
    scheduler::Scheduler,
};

/// Worker threads recommended regardless of the measured winner.
pub const RECOMMENDED_THREADS: usize = 4;
pub const RECOMMENDED_KEEP_ALIVE: &str = "30m";

/// What to measure. Built from a validated `/benchmark` body.
#[derive(Debug, Clone)]
pub struct BenchmarkPlan {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub runs: usize,
    pub context_sizes: Vec<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSample {
    pub latency_ms: f64,
    pub ttft_ms: f64,
    pub completion_tokens: u32,
    pub tokens_per_second: f64,
}

impl RunSample {
    fn from_result(result: &GenerationResult) -> Self {
        let seconds = result.latency_ms / 1000.0;
        let tokens_per_second = if seconds > 0.0 {
            result.completion_tokens as f64 / seconds
        } else {
            0.0
        };
        Self {
            latency_ms: result.latency_ms,
            // No output at all: the first token never came before the end.
            ttft_ms: result.ttft_ms.unwrap_or(result.latency_ms),
            completion_tokens: result.completion_tokens,
            tokens_per_second,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkProfile {
    pub context_size: usize,
    pub runs: usize,
    pub samples: Vec<RunSample>,
    pub avg_latency_ms: f64,
    pub avg_ttft_ms: f64,
    pub avg_completion_tokens: f64,
    pub avg_completion_tokens_per_second: f64,
}

impl BenchmarkProfile {
    pub fn from_samples(context_size: usize, samples: Vec<RunSample>) -> Self {
        Self {
            context_size,
            runs: samples.len(),
            avg_latency_ms: mean(samples.iter().map(|s| s.latency_ms)),
            avg_ttft_ms: mean(samples.iter().map(|s| s.ttft_ms)),
            avg_completion_tokens: mean(samples.iter().map(|s| s.completion_tokens as f64)),
            avg_completion_tokens_per_second: mean(samples.iter().map(|s| s.tokens_per_second)),
            samples,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestDefaults {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
}

/// Advisory settings. Never applied to the running service.
#[derive(Debug, Clone, Serialize)]
pub struct RecommendedConfig {
    pub env: BTreeMap<String, String>,
    pub request_defaults: RequestDefaults,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    pub model: String,
    pub runs: usize,
    pub prompt_chars: usize,
    pub profiles: Vec<BenchmarkProfile>,
    pub recommended: RecommendedConfig,
}

/// Run `plan.runs` sequential generations per context size through the
/// regular admission path. Any failed run aborts the benchmark.
pub async fn run_benchmark(
    scheduler: &Scheduler,
    plan: &BenchmarkPlan,
    owner: &str,
) -> Result<Vec<BenchmarkProfile>, ServiceError> {
    let mut profiles = Vec::with_capacity(plan.context_sizes.len());

    for &context_size in &plan.context_sizes {
        let mut samples = Vec::with_capacity(plan.runs);
        for run in 0..plan.runs {
            let params = SamplingParams {
                max_tokens: plan.max_tokens,
                temperature: plan.temperature,
                top_p: plan.top_p,
                top_k: plan.top_k,
                stop: Vec::new(),
                seed: None,
            };
            let request = GenerationRequest::new(plan.prompt.clone(), params, owner);
            let result = scheduler
                .submit_with_context(request, Some(context_size))?
                .collect()
                .await?;
            let sample = RunSample::from_result(&result);
            info!(
                context_size,
                run,
                latency_ms = sample.latency_ms,
                tokens_per_second = sample.tokens_per_second,
                "benchmark run finished"
            );
            samples.push(sample);
        }
        profiles.push(BenchmarkProfile::from_samples(context_size, samples));
    }

    Ok(profiles)
}

/// Highest average throughput wins; equal throughput goes to the lower
/// average time-to-first-token, then to the earlier profile.
pub fn select_best(profiles: &[BenchmarkProfile]) -> Option<&BenchmarkProfile> {
    profiles.iter().fold(None, |best, candidate| match best {
        None => Some(candidate),
        Some(current) => {
            let faster = candidate.avg_completion_tokens_per_second
                > current.avg_completion_tokens_per_second;
            let tied = candidate.avg_completion_tokens_per_second
                == current.avg_completion_tokens_per_second;
            if faster || (tied && candidate.avg_ttft_ms < current.avg_ttft_ms) {
                Some(candidate)
            } else {
                Some(current)
            }
        }
    })
}

pub fn recommend(
    profiles: &[BenchmarkProfile],
    plan: &BenchmarkPlan,
    config: &AppConfig,
) -> Result<RecommendedConfig, ServiceError> {
    let best = select_best(profiles).ok_or_else(|| {
        ServiceError::Validation("at least one context size is required".into())
    })?;

    let max_tokens = plan.max_tokens.min(config.max_tokens);
    let mut env = BTreeMap::new();
    env.insert("N_CTX".to_string(), best.context_size.to_string());
    env.insert("N_THREADS".to_string(), RECOMMENDED_THREADS.to_string());
    env.insert("MAX_TOKENS".to_string(), max_tokens.to_string());
    env.insert("KEEP_ALIVE".to_string(), RECOMMENDED_KEEP_ALIVE.to_string());

    Ok(RecommendedConfig {
        env,
        request_defaults: RequestDefaults {
            max_tokens,
            temperature: plan.temperature,
            top_p: plan.top_p,
            top_k: plan.top_k,
        },
        reason: format!(
            "context size {} had the highest average throughput ({:.2} tok/s, avg TTFT {:.1} ms) over {} runs",
            best.context_size, best.avg_completion_tokens_per_second, best.avg_ttft_ms, best.runs
        ),
    })
}

/// Measure every context size and attach a recommendation.
pub async fn run_report(
    scheduler: &Scheduler,
    plan: &BenchmarkPlan,
    config: &AppConfig,
    model: &str,
    owner: &str,
) -> Result<BenchmarkReport, ServiceError> {
    let profiles = run_benchmark(scheduler, plan, owner).await?;
    let recommended = recommend(&profiles, plan, config)?;

    Ok(BenchmarkReport {
        model: model.to_string(),
        runs: plan.runs,
        prompt_chars: plan.prompt.chars().count(),
        profiles,
        recommended,
    })
}

fn mean<I>(values: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    let mut count = 0usize;
    let mut acc = 0.0;
    for value in values {
        count += 1;
        acc += value;
    }
    if count == 0 { 0.0 } else { acc / count as f64 }
}

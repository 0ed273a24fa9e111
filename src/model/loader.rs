use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_stream::stream;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{SeedableRng, rngs::StdRng};
use tch::{Device, Kind, Tensor, no_grad};
use tokenizers::Tokenizer;
use tokio::{sync::mpsc, task};
use tracing::{info, warn};

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{
        ModelRuntime, RuntimeChunk, RuntimeRequest, RuntimeSummary, SamplingParams, StopReason,
        TokenStream, sampling::sample_next,
    },
};

const EOS_CANDIDATES: [&str; 4] = ["<|endoftext|>", "</s>", "<eos>", "<|eot_id|>"];

/// A traced causal LM plus its tokenizer.
struct ModelArtifacts {
    tokenizer: Tokenizer,
    module: Mutex<tch::CModule>,
    eos_id: Option<u32>,
}

/// TorchScript runtime. Generation runs on a blocking thread and hands each
/// decoded fragment to the async side through a bounded channel.
pub struct TorchRuntime {
    name: String,
    module_path: PathBuf,
    tokenizer_path: PathBuf,
    module_path_display: String,
    device: Device,
    artifacts: Mutex<Option<Arc<ModelArtifacts>>>,
    loaded: AtomicBool,
}

impl TorchRuntime {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            name: config.model_name.clone(),
            module_path: config.torch_module_path.clone(),
            tokenizer_path: config.tokenizer_path.clone(),
            module_path_display: config.torch_module_path.display().to_string(),
            device: parse_device(&config.device),
            artifacts: Mutex::new(None),
            loaded: AtomicBool::new(false),
        }
    }
}

impl ModelArtifacts {
    fn load(module_path: &Path, tokenizer_path: &Path, device: Device) -> Result<Self, ServiceError> {
        if !module_path.exists() {
            return Err(ServiceError::Other(format!(
                "model artifact missing: {}",
                module_path.display()
            )));
        }
        let size_bytes = fs::metadata(module_path)?.len();
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        let mut module = tch::CModule::load_on_device(module_path, device)
            .map_err(|e| ServiceError::Inference(e.to_string()))?;
        module.set_eval();

        let eos_id = EOS_CANDIDATES
            .iter()
            .find_map(|token| tokenizer.token_to_id(token));
        info!(size_bytes, ?eos_id, "TorchScript module loaded");

        Ok(Self {
            tokenizer,
            module: Mutex::new(module),
            eos_id,
        })
    }

    /// Autoregressive loop. Returns once the channel closes, a stop
    /// condition is hit, or the forward pass fails.
    fn generate_blocking(
        &self,
        request: RuntimeRequest,
        device: Device,
        tx: mpsc::Sender<Result<RuntimeChunk, ServiceError>>,
    ) -> Result<(), ServiceError> {
        let prompt = match &request.system {
            Some(system) => format!("{system}\n\n{}", request.prompt),
            None => request.prompt.clone(),
        };
        let encoding = self
            .tokenizer
            .encode(prompt.as_str(), true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        let mut input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        if input_ids.is_empty() {
            input_ids.push(0);
        }
        let prompt_tokens = input_ids.len() as u32;

        let params: &SamplingParams = &request.params;
        let mut rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let window = request.context_size.max(1);

        let mut generated: Vec<u32> = Vec::new();
        let mut emitted = String::new();
        let mut stop_reason = StopReason::Stop;

        let module = self.module.lock();
        no_grad(|| {
            for _ in 0..params.max_tokens {
                // Keep only the trailing context window.
                let start = input_ids.len().saturating_sub(window);
                let context = &input_ids[start..];
                let input_tensor = Tensor::from_slice(context)
                    .reshape([1, context.len() as i64])
                    .to(device);

                let output = module
                    .forward_is(&[tch::IValue::Tensor(input_tensor)])
                    .map_err(|e| ServiceError::Inference(e.to_string()))?;
                let logits = match output {
                    tch::IValue::Tensor(t) => t,
                    tch::IValue::Tuple(ref tuple) if !tuple.is_empty() => match &tuple[0] {
                        tch::IValue::Tensor(t) => t.shallow_clone(),
                        _ => {
                            return Err(ServiceError::Inference(
                                "expected tensor as first tuple element".into(),
                            ));
                        }
                    },
                    _ => {
                        return Err(ServiceError::Inference(
                            "unexpected model output format".into(),
                        ));
                    }
                };

                let last_logits = logits
                    .select(1, -1)
                    .squeeze()
                    .to_kind(Kind::Float)
                    .to(Device::Cpu);
                let scores = Vec::<f32>::try_from(&last_logits)
                    .map_err(|e| ServiceError::Inference(e.to_string()))?;
                let next_id = sample_next(&scores, params, &mut rng);

                if Some(next_id) == self.eos_id {
                    break;
                }
                input_ids.push(next_id as i64);
                generated.push(next_id);

                let decoded = self
                    .tokenizer
                    .decode(&generated, true)
                    .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
                let Some(fresh) = decoded.strip_prefix(emitted.as_str()) else {
                    continue;
                };
                if fresh.is_empty() {
                    continue;
                }

                let mut fragment = fresh.to_string();
                let mut hit_stop = false;
                let candidate = format!("{emitted}{fragment}");
                if let Some(end) = params
                    .stop
                    .iter()
                    .filter(|s| !s.is_empty())
                    .filter_map(|s| candidate.find(s.as_str()))
                    .min()
                {
                    fragment = candidate[emitted.len().min(end)..end].to_string();
                    hit_stop = true;
                }

                if !fragment.is_empty() {
                    emitted.push_str(&fragment);
                    if tx.blocking_send(Ok(RuntimeChunk::Text(fragment))).is_err() {
                        // Receiver gone: the generation was abandoned.
                        return Ok(());
                    }
                }
                if hit_stop {
                    return Ok(());
                }
                if generated.len() as u32 == params.max_tokens {
                    stop_reason = StopReason::Length;
                }
            }
            Ok(())
        })?;

        let _ = tx.blocking_send(Ok(RuntimeChunk::Finished(RuntimeSummary {
            prompt_tokens: Some(prompt_tokens),
            completion_tokens: Some(generated.len() as u32),
            stop_reason: Some(stop_reason),
        })));
        Ok(())
    }
}

#[async_trait]
impl ModelRuntime for TorchRuntime {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn model_path(&self) -> &str {
        &self.module_path_display
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    async fn load(&self) -> Result<(), ServiceError> {
        let module_path = self.module_path.clone();
        let tokenizer_path = self.tokenizer_path.clone();
        let device = self.device;
        let artifacts = task::spawn_blocking(move || {
            ModelArtifacts::load(&module_path, &tokenizer_path, device)
        })
        .await
        .map_err(|err| ServiceError::Inference(format!("model load task failed: {err}")))??;

        self.artifacts.lock().replace(Arc::new(artifacts));
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    async fn generate(&self, request: RuntimeRequest) -> Result<TokenStream, ServiceError> {
        let artifacts = self
            .artifacts
            .lock()
            .clone()
            .ok_or(ServiceError::ModelLoading)?;
        let device = self.device;
        let (tx, mut rx) = mpsc::channel(1);

        let worker = task::spawn_blocking(move || {
            let failure_tx = tx.clone();
            if let Err(err) = artifacts.generate_blocking(request, device, tx) {
                warn!(error = %err, "torch generation failed");
                let _ = failure_tx.blocking_send(Err(err));
            }
        });

        let stream = stream! {
            while let Some(item) = rx.recv().await {
                yield item;
            }
            if let Err(err) = worker.await {
                yield Err(ServiceError::Inference(format!("inference task failed: {err}")));
            }
        };
        Ok(Box::pin(stream))
    }
}

fn parse_device(raw: &str) -> Device {
    let lower = raw.to_lowercase();
    if lower == "cpu" {
        Device::Cpu
    } else if lower.starts_with("cuda") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        if tch::Cuda::is_available() {
            Device::Cuda(idx)
        } else {
            Device::Cpu
        }
    } else {
        Device::Cpu
    }
}

use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use anyhow::bail;

use crate::model::SamplingParams;

/// Which model runtime backs the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeBackend {
    Ollama,
    Scripted,
    Torch,
}

impl FromStr for RuntimeBackend {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "ollama" => Ok(RuntimeBackend::Ollama),
            "scripted" | "echo" => Ok(RuntimeBackend::Scripted),
            "torch" | "tch" => Ok(RuntimeBackend::Torch),
            other => bail!("unknown RUNTIME_BACKEND '{other}'"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub backend: RuntimeBackend,
    pub model_name: String,
    pub model_path: String,
    pub ollama_host: String,
    pub torch_module_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub device: String,
    pub n_ctx: usize,
    pub n_threads: usize,
    pub keep_alive: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_concurrent_requests: usize,
    pub max_queue_size: usize,
    pub stall_timeout: Duration,
    pub stream_buffer: usize,
    pub api_keys: Vec<(String, String)>,
    pub api_key_pepper: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8000),
            backend: RuntimeBackend::Ollama,
            model_name: "gemma:2b".to_string(),
            model_path: "models/gemma-3-1b-it.Q4_K_M.gguf".to_string(),
            ollama_host: "http://127.0.0.1:11434".to_string(),
            torch_module_path: PathBuf::from("models/model.ts"),
            tokenizer_path: PathBuf::from("models/tokenizer.json"),
            device: "cpu".to_string(),
            n_ctx: 2048,
            n_threads: 4,
            keep_alive: "30m".to_string(),
            max_tokens: 512,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            max_concurrent_requests: 4,
            max_queue_size: 100,
            stall_timeout: Duration::from_secs(60),
            stream_buffer: 16,
            api_keys: Vec::new(),
            api_key_pepper: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let listen_addr = env::var("SERVER_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.listen_addr);

        let backend = match env::var("RUNTIME_BACKEND") {
            Ok(raw) => raw.parse()?,
            Err(_) => defaults.backend,
        };

        let model_name = env::var("MODEL_NAME").unwrap_or(defaults.model_name);
        let model_path = env::var("MODEL_PATH").unwrap_or(defaults.model_path);
        let ollama_host = env::var("OLLAMA_HOST")
            .map(|host| normalize_host(&host))
            .unwrap_or(defaults.ollama_host);
        let torch_module_path = env::var("TORCH_MODULE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.torch_module_path);
        let tokenizer_path = env::var("TOKENIZER_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.tokenizer_path);
        let device = env::var("DEVICE").unwrap_or(defaults.device);

        let n_ctx = parse_env("N_CTX").unwrap_or(defaults.n_ctx);
        let n_threads = parse_env("N_THREADS").unwrap_or(defaults.n_threads);
        let keep_alive = env::var("KEEP_ALIVE").unwrap_or(defaults.keep_alive);
        let max_tokens = parse_env("MAX_TOKENS").unwrap_or(defaults.max_tokens);
        let temperature = parse_env("TEMPERATURE").unwrap_or(defaults.temperature);
        let top_p = parse_env("TOP_P").unwrap_or(defaults.top_p);
        let top_k = parse_env("TOP_K").unwrap_or(defaults.top_k);

        let max_concurrent_requests =
            parse_env("MAX_CONCURRENT_REQUESTS").unwrap_or(defaults.max_concurrent_requests);
        let max_queue_size = parse_env("MAX_QUEUE_SIZE").unwrap_or(defaults.max_queue_size);
        let stall_timeout = parse_env::<u64>("STALL_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.stall_timeout);
        let stream_buffer = parse_env("STREAM_BUFFER").unwrap_or(defaults.stream_buffer);

        let api_keys = env::var("API_KEYS")
            .map(|raw| parse_api_keys(&raw))
            .unwrap_or_default();
        let api_key_pepper = env::var("API_KEY_PEPPER").ok().filter(|p| !p.is_empty());

        let config = Self {
            listen_addr,
            backend,
            model_name,
            model_path,
            ollama_host,
            torch_module_path,
            tokenizer_path,
            device,
            n_ctx,
            n_threads,
            keep_alive,
            max_tokens,
            temperature,
            top_p,
            top_k,
            max_concurrent_requests,
            max_queue_size,
            stall_timeout,
            stream_buffer,
            api_keys,
            api_key_pepper,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_concurrent_requests == 0 {
            bail!("MAX_CONCURRENT_REQUESTS must be at least 1");
        }
        if self.max_queue_size == 0 {
            bail!("MAX_QUEUE_SIZE must be at least 1");
        }
        if self.stall_timeout.is_zero() {
            bail!("STALL_TIMEOUT_SECS must be positive");
        }
        if self.stream_buffer == 0 {
            bail!("STREAM_BUFFER must be at least 1");
        }
        if !(1..=2048).contains(&self.max_tokens) {
            bail!("MAX_TOKENS must be within 1..=2048");
        }
        Ok(())
    }

    /// Sampling defaults applied to fields a request leaves out.
    pub fn default_sampling(&self) -> SamplingParams {
        SamplingParams {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            stop: Vec::new(),
            seed: None,
        }
    }
}

fn parse_env<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn normalize_host(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

/// `owner:secret` pairs or bare secrets, comma separated.
fn parse_api_keys(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| match item.split_once(':') {
            Some((owner, secret)) if !owner.is_empty() && !secret.is_empty() => {
                (owner.to_string(), secret.to_string())
            }
            _ => ("env".to_string(), item.to_string()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_api_keys() {
        let keys = parse_api_keys("alice:sk_one, sk_two ,,bob:sk_three");
        assert_eq!(
            keys,
            vec![
                ("alice".to_string(), "sk_one".to_string()),
                ("env".to_string(), "sk_two".to_string()),
                ("bob".to_string(), "sk_three".to_string()),
            ]
        );
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("127.0.0.1:11434"), "http://127.0.0.1:11434");
        assert_eq!(normalize_host("http://pi.local:11434/"), "http://pi.local:11434");
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("Ollama".parse::<RuntimeBackend>().unwrap(), RuntimeBackend::Ollama);
        assert_eq!("echo".parse::<RuntimeBackend>().unwrap(), RuntimeBackend::Scripted);
        assert!("gpu-farm".parse::<RuntimeBackend>().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = AppConfig {
            max_concurrent_requests: 0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(AppConfig::default().validate().is_ok());
    }
}

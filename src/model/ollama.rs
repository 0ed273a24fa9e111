//! Ollama-backed model runtime.
//!
//! Talks to a local Ollama server over its NDJSON streaming API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{
    error::ServiceError,
    model::{
        ModelRuntime, RuntimeChunk, RuntimeRequest, RuntimeSummary, StopReason, TokenStream,
    },
};

#[derive(Debug, Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    keep_alive: &'a str,
    options: GenerateOptions<'a>,
}

#[derive(Debug, Serialize)]
struct GenerateOptions<'a> {
    num_predict: u32,
    temperature: f32,
    top_p: f32,
    top_k: u32,
    stop: &'a [String],
    num_ctx: usize,
    num_thread: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GenerateLine {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    done_reason: Option<String>,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
    #[serde(default)]
    model: Option<String>,
}

pub struct OllamaRuntime {
    client: Client,
    base_url: String,
    model: String,
    model_path: String,
    keep_alive: String,
    threads: usize,
    loaded: AtomicBool,
}

impl OllamaRuntime {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        model_path: impl Into<String>,
        keep_alive: impl Into<String>,
        threads: usize,
    ) -> Result<Self, ServiceError> {
        // No overall request timeout: the serializer owns the stall policy.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
            model_path: model_path.into(),
            keep_alive: keep_alive.into(),
            threads,
            loaded: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl ModelRuntime for OllamaRuntime {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn model_path(&self) -> &str {
        &self.model_path
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    #[instrument(skip(self), fields(model = %self.model))]
    async fn load(&self) -> Result<(), ServiceError> {
        let url = format!("{}/api/tags", self.base_url);
        debug!(url = %url, "probing Ollama");

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            self.loaded.store(false, Ordering::Release);
            return Err(ServiceError::Inference(format!(
                "Ollama returned status {}",
                response.status()
            )));
        }

        let tags: TagsResponse = response.json().await?;
        let present = tags.models.iter().any(|entry| {
            entry.name == self.model || entry.model.as_deref() == Some(self.model.as_str())
        });
        self.loaded.store(present, Ordering::Release);

        if present {
            info!("Ollama ready");
            Ok(())
        } else {
            warn!("model not available in Ollama, pull it first");
            Err(ServiceError::ModelLoading)
        }
    }

    async fn generate(&self, request: RuntimeRequest) -> Result<TokenStream, ServiceError> {
        if !self.is_loaded() {
            return Err(ServiceError::ModelLoading);
        }

        let body = GenerateBody {
            model: &self.model,
            prompt: &request.prompt,
            system: request.system.as_deref(),
            stream: true,
            keep_alive: &self.keep_alive,
            options: GenerateOptions {
                num_predict: request.params.max_tokens,
                temperature: request.params.temperature,
                top_p: request.params.top_p,
                top_k: request.params.top_k,
                stop: &request.params.stop,
                num_ctx: request.context_size,
                num_thread: self.threads,
                seed: request.params.seed,
            },
        };

        let url = format!("{}/api/generate", self.base_url);
        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ServiceError::Inference(format!(
                "Ollama returned status {status}: {detail}"
            )));
        }

        Ok(Box::pin(ndjson_chunks(response.bytes_stream())))
    }
}

/// Split a byte stream into NDJSON lines and decode each one. Lines may be
/// split arbitrarily across network chunks.
fn ndjson_chunks<S, B, E>(bytes: S) -> impl Stream<Item = Result<RuntimeChunk, ServiceError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Send,
    ServiceError: From<E>,
{
    try_stream! {
        let mut bytes = Box::pin(bytes);
        let mut pending: Vec<u8> = Vec::new();
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(ServiceError::from)?;
            pending.extend_from_slice(chunk.as_ref());
            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                for item in decode_line(&line)? {
                    yield item;
                }
            }
        }
        for item in decode_line(&pending)? {
            yield item;
        }
    }
}

/// Decode one NDJSON line of `/api/generate` output.
fn decode_line(line: &[u8]) -> Result<Vec<RuntimeChunk>, ServiceError> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let parsed: GenerateLine = serde_json::from_slice(trimmed)
        .map_err(|e| ServiceError::Inference(format!("malformed runtime output: {e}")))?;
    if let Some(error) = parsed.error {
        return Err(ServiceError::Inference(error));
    }

    let mut chunks = Vec::with_capacity(2);
    if !parsed.response.is_empty() {
        chunks.push(RuntimeChunk::Text(parsed.response));
    }
    if parsed.done {
        let stop_reason = match parsed.done_reason.as_deref() {
            Some("length") => Some(StopReason::Length),
            Some(_) => Some(StopReason::Stop),
            None => None,
        };
        chunks.push(RuntimeChunk::Finished(RuntimeSummary {
            prompt_tokens: parsed.prompt_eval_count,
            completion_tokens: parsed.eval_count,
            stop_reason,
        }));
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_token_line() {
        let chunks = decode_line(br#"{"model":"gemma:2b","response":"Par","done":false}"#).unwrap();
        assert_eq!(chunks, vec![RuntimeChunk::Text("Par".into())]);
    }

    #[test]
    fn test_decode_final_line() {
        let line = br#"{"response":"","done":true,"done_reason":"length","prompt_eval_count":12,"eval_count":64}"#;
        let chunks = decode_line(line).unwrap();
        assert_eq!(
            chunks,
            vec![RuntimeChunk::Finished(RuntimeSummary {
                prompt_tokens: Some(12),
                completion_tokens: Some(64),
                stop_reason: Some(StopReason::Length),
            })]
        );
    }

    #[test]
    fn test_decode_error_and_blank_lines() {
        assert!(decode_line(b"   \n").unwrap().is_empty());
        let err = decode_line(br#"{"error":"model not found"}"#).unwrap_err();
        assert!(matches!(err, ServiceError::Inference(msg) if msg == "model not found"));
        assert!(decode_line(b"{not json").is_err());
    }

    #[tokio::test]
    async fn test_lines_split_across_chunks() {
        let parts: Vec<Result<&'static [u8], ServiceError>> = vec![
            Ok(&br#"{"response":"Hel"#[..]),
            Ok(&b"lo\",\"done\":false}\n{\"response\":\" world\",\"done\":false}\n"[..]),
            Ok(&br#"{"response":"","done":true,"done_reason":"stop","eval_count":2}"#[..]),
        ];
        let chunks: Vec<_> = ndjson_chunks(futures::stream::iter(parts))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], RuntimeChunk::Text("Hello".into()));
        assert_eq!(chunks[1], RuntimeChunk::Text(" world".into()));
        assert!(matches!(
            &chunks[2],
            RuntimeChunk::Finished(summary) if summary.stop_reason == Some(StopReason::Stop)
        ));
    }

    #[test]
    fn test_request_body_shape() {
        let stop = vec!["\n\n".to_string()];
        let body = GenerateBody {
            model: "gemma:2b",
            prompt: "hi",
            system: None,
            stream: true,
            keep_alive: "30m",
            options: GenerateOptions {
                num_predict: 32,
                temperature: 0.7,
                top_p: 0.9,
                top_k: 40,
                stop: &stop,
                num_ctx: 1024,
                num_thread: 4,
                seed: Some(7),
            },
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["options"]["num_predict"], 32);
        assert_eq!(value["options"]["num_ctx"], 1024);
        assert_eq!(value["options"]["seed"], 7);
        assert!(value.get("system").is_none());
    }
}

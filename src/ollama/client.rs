use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::types::{model_matches, GenerateChunk, GenerateRequest, TagsResponse};
use crate::backend::{InferenceBackend, StreamStats, TokenSink};
use crate::error::{BenchError, Result};

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const MAX_ERROR_BODY_CHARS: usize = 500;

pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        // No overall request timeout: generations are bounded by the caller's per-call timeout.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| BenchError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_generate(&self, request: &GenerateRequest<'_>) -> Result<reqwest::Response> {
        let resp = self
            .client
            .post(self.url("/api/generate"))
            .json(request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let body: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
            return Err(BenchError::Inference(format!(
                "Ollama returned HTTP {} for model {}: {}",
                status.as_u16(),
                request.model,
                body
            )));
        }
        Ok(resp)
    }
}

fn parse_line(line: &[u8]) -> Result<Option<GenerateChunk>> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let chunk: GenerateChunk = serde_json::from_str(line)
        .map_err(|e| BenchError::Inference(format!("malformed stream chunk: {}", e)))?;
    if let Some(err) = chunk.error {
        return Err(BenchError::Inference(err));
    }
    Ok(Some(chunk))
}

#[async_trait]
impl InferenceBackend for OllamaClient {
    async fn list_models(&self) -> Result<Vec<String>> {
        let resp = self.client.get(self.url("/api/tags")).send().await?;
        if !resp.status().is_success() {
            return Err(BenchError::BackendUnavailable(format!(
                "model listing returned HTTP {}",
                resp.status().as_u16()
            )));
        }
        let tags: TagsResponse = resp.json().await?;
        let mut names: Vec<String> = tags.models.into_iter().map(|m| m.name).collect();
        names.sort();
        debug!(count = names.len(), "Listed Ollama models");
        Ok(names)
    }

    async fn health_check(&self, model: &str) -> bool {
        match self.list_models().await {
            Ok(names) => {
                let found = names.iter().any(|n| model_matches(n, model));
                if !found {
                    warn!(model = %model, "Model not present on Ollama server");
                }
                found
            }
            Err(e) => {
                warn!(model = %model, error = %e, "Ollama health check failed");
                false
            }
        }
    }

    async fn stream_generate(
        &self,
        model: &str,
        prompt: &str,
        on_token: TokenSink<'_>,
    ) -> Result<StreamStats> {
        let request = GenerateRequest {
            model,
            prompt,
            system: None,
            stream: true,
        };
        let resp = self.post_generate(&request).await?;

        let mut stats = StreamStats::default();
        let mut buf: Vec<u8> = Vec::new();
        let mut stream = resp.bytes_stream();

        let mut handle = |chunk: GenerateChunk, stats: &mut StreamStats| {
            if !chunk.response.is_empty() {
                stats.chunks += 1;
                on_token(&chunk.response);
            }
            if chunk.done {
                stats.eval_count = chunk.eval_count;
            }
        };

        while let Some(bytes) = stream.next().await {
            buf.extend_from_slice(&bytes?);
            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                if let Some(chunk) = parse_line(&line)? {
                    handle(chunk, &mut stats);
                }
            }
        }
        if let Some(chunk) = parse_line(&buf)? {
            handle(chunk, &mut stats);
        }

        debug!(model = %model, chunks = stats.chunks, eval_count = ?stats.eval_count, "Stream finished");
        Ok(stats)
    }

    async fn generate(&self, model: &str, prompt: &str, system: Option<&str>) -> Result<String> {
        let request = GenerateRequest {
            model,
            prompt,
            system,
            stream: false,
        };
        let resp = self.post_generate(&request).await?;
        let chunk: GenerateChunk = resp.json().await?;
        if let Some(err) = chunk.error {
            return Err(BenchError::Inference(err));
        }
        info!(model = %model, chars = chunk.response.len(), "Generation returned");
        Ok(chunk.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = OllamaClient::new("http://localhost:11434/").expect("should build");
        assert_eq!(client.base_url(), "http://localhost:11434");
        assert_eq!(client.url("/api/tags"), "http://localhost:11434/api/tags");
    }

    #[test]
    fn test_parse_line_skips_blank() {
        assert!(parse_line(b"   \n").unwrap().is_none());
    }

    #[test]
    fn test_parse_line_surfaces_backend_error() {
        let err = parse_line(br#"{"error":"out of memory"}"#).unwrap_err();
        assert_eq!(err, BenchError::Inference("out of memory".into()));
    }

    #[test]
    fn test_parse_line_rejects_garbage() {
        let err = parse_line(b"not json").unwrap_err();
        assert_eq!(err.code(), "inference_error");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unhealthy() {
        // Port 9 (discard) is essentially never served locally.
        let client = OllamaClient::new("http://127.0.0.1:9").unwrap();
        assert!(!client.health_check("llama3").await);
        let err = client.list_models().await.unwrap_err();
        assert!(matches!(err, BenchError::BackendUnavailable(_) | BenchError::Inference(_)));
    }
}

//! Adapters for an OpenAI-compatible local inference server.
//!
//! Any endpoint speaking the OpenAI completions/embeddings shape works:
//! llama.cpp's server, Ollama in OpenAI mode, LM Studio, vLLM. The node
//! talks only to a server on the school LAN; these adapters never reach
//! the public internet.

use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::PortError;
use crate::ports::embedder::EmbedderPort;
use crate::ports::llm::{GenerationRequest, LlmPort, TokenEvent, TokenStream, TokenUsage};

const LLM_PORT: &str = "llm";
const EMBEDDER_PORT: &str = "embedder";

/// Build `{base}/v1/{path}`, tolerating a base URL that already ends in `/v1`.
fn api_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let base = base.strip_suffix("/v1").unwrap_or(base);
    format!("{base}/v1/{path}")
}

/// Translate an HTTP error status into a port error.
fn status_error(port: &'static str, status: reqwest::StatusCode, retry_after: Option<Duration>) -> PortError {
    if status.as_u16() == 429 || status.is_server_error() {
        PortError::Overloaded { port, retry_after }
    } else if status.as_u16() == 400 {
        PortError::MalformedInput {
            port,
            reason: format!("server rejected request: HTTP {status}"),
        }
    } else {
        PortError::Unavailable {
            port,
            reason: format!("HTTP {status}"),
        }
    }
}

fn retry_after_header(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}

// ── Completions ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    prompt: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
    stream: bool,
    stream_options: StreamOptions,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// Streaming completions client for an OpenAI-compatible server.
pub struct OpenAiCompatLlm {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiCompatLlm {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, PortError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PortError::Unavailable {
                port: LLM_PORT,
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
            api_key,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("Authorization", format!("Bearer {key}")),
            None => request,
        }
    }
}

#[async_trait]
impl LlmPort for OpenAiCompatLlm {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<TokenStream, PortError> {
        let body = CompletionBody {
            model: &self.model,
            prompt: &request.prompt,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stop: request.stop.clone(),
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
        };

        let resp = self
            .authorize(self.client.post(api_url(&self.base_url, "completions")))
            .json(&body)
            .send()
            .await
            .map_err(|e| PortError::Unavailable {
                port: LLM_PORT,
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let retry_after = retry_after_header(&resp);
            return Err(status_error(LLM_PORT, resp.status(), retry_after));
        }

        let mut events = resp.bytes_stream().eventsource();
        let stream = try_stream! {
            let mut usage = TokenUsage::default();
            let mut counted_tokens = 0u32;
            while let Some(event) = events.next().await {
                if cancel.is_cancelled() {
                    // Dropping `events` aborts the HTTP body; the server
                    // notices the closed connection and stops generating.
                    break;
                }
                let event = event.map_err(|e| PortError::Unavailable {
                    port: LLM_PORT,
                    reason: format!("stream error: {e}"),
                })?;
                if event.data == "[DONE]" {
                    break;
                }
                let chunk: CompletionChunk =
                    serde_json::from_str(&event.data).map_err(|e| PortError::Unavailable {
                        port: LLM_PORT,
                        reason: format!("malformed stream chunk: {e}"),
                    })?;
                if let Some(api_usage) = chunk.usage {
                    usage.prompt_tokens = api_usage.prompt_tokens;
                    usage.completion_tokens = api_usage.completion_tokens;
                }
                for choice in chunk.choices {
                    if !choice.text.is_empty() {
                        counted_tokens += 1;
                        yield TokenEvent::Token(choice.text);
                    }
                }
            }
            if usage.completion_tokens == 0 {
                // Servers that omit usage still get a best-effort count.
                usage.completion_tokens = counted_tokens;
            }
            yield TokenEvent::Done(usage);
        };
        Ok(Box::pin(stream))
    }

    async fn health(&self) -> Result<(), PortError> {
        let resp = self
            .authorize(self.client.get(api_url(&self.base_url, "models")))
            .send()
            .await
            .map_err(|e| PortError::Unavailable {
                port: LLM_PORT,
                reason: e.to_string(),
            })?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(status_error(LLM_PORT, resp.status(), None))
        }
    }
}

impl std::fmt::Debug for OpenAiCompatLlm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatLlm")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("has_api_key", &self.api_key.is_some())
            .finish()
    }
}

// ── Embeddings ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct EmbeddingBody<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

/// Embeddings client for an OpenAI-compatible server.
pub struct OpenAiCompatEmbedder {
    client: Client,
    base_url: String,
    model: String,
    dimension: usize,
    api_key: Option<String>,
}

impl OpenAiCompatEmbedder {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        dimension: usize,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, PortError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PortError::Unavailable {
                port: EMBEDDER_PORT,
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
            dimension,
            api_key,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("Authorization", format!("Bearer {key}")),
            None => request,
        }
    }

    async fn request_embeddings(&self, input: &[String]) -> Result<Vec<Vec<f32>>, PortError> {
        let body = EmbeddingBody {
            model: &self.model,
            input,
        };
        let resp = self
            .authorize(self.client.post(api_url(&self.base_url, "embeddings")))
            .json(&body)
            .send()
            .await
            .map_err(|e| PortError::Unavailable {
                port: EMBEDDER_PORT,
                reason: e.to_string(),
            })?;
        if !resp.status().is_success() {
            let retry_after = retry_after_header(&resp);
            return Err(status_error(EMBEDDER_PORT, resp.status(), retry_after));
        }
        let parsed: EmbeddingResponse =
            resp.json().await.map_err(|e| PortError::Unavailable {
                port: EMBEDDER_PORT,
                reason: format!("malformed embedding response: {e}"),
            })?;
        if parsed.data.len() != input.len() {
            return Err(PortError::Unavailable {
                port: EMBEDDER_PORT,
                reason: format!(
                    "expected {} embeddings, got {}",
                    input.len(),
                    parsed.data.len()
                ),
            });
        }
        let vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|d| d.embedding).collect();
        for v in &vectors {
            if v.len() != self.dimension {
                return Err(PortError::Unavailable {
                    port: EMBEDDER_PORT,
                    reason: format!(
                        "server returned dimension {}, configured {}",
                        v.len(),
                        self.dimension
                    ),
                });
            }
        }
        Ok(vectors)
    }
}

#[async_trait]
impl EmbedderPort for OpenAiCompatEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, PortError> {
        let input = [text.to_string()];
        let mut vectors = self.request_embeddings(&input).await?;
        Ok(vectors.remove(0))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PortError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request_embeddings(texts).await
    }

    async fn health(&self) -> Result<(), PortError> {
        let resp = self
            .authorize(self.client.get(api_url(&self.base_url, "models")))
            .send()
            .await
            .map_err(|e| PortError::Unavailable {
                port: EMBEDDER_PORT,
                reason: e.to_string(),
            })?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(status_error(EMBEDDER_PORT, resp.status(), None))
        }
    }
}

impl std::fmt::Debug for OpenAiCompatEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatEmbedder")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("dimension", &self.dimension)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_url_tolerates_v1_suffix() {
        assert_eq!(
            api_url("http://localhost:8080", "completions"),
            "http://localhost:8080/v1/completions"
        );
        assert_eq!(
            api_url("http://localhost:8080/v1/", "models"),
            "http://localhost:8080/v1/models"
        );
    }

    #[test]
    fn status_mapping() {
        let overloaded = status_error(LLM_PORT, reqwest::StatusCode::TOO_MANY_REQUESTS, None);
        assert!(overloaded.is_transient());
        let bad = status_error(LLM_PORT, reqwest::StatusCode::BAD_REQUEST, None);
        assert!(matches!(bad, PortError::MalformedInput { .. }));
        let gone = status_error(LLM_PORT, reqwest::StatusCode::NOT_FOUND, None);
        assert!(matches!(gone, PortError::Unavailable { .. }));
    }
}

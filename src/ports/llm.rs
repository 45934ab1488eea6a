//! LLM port: prompt in, token stream out.
//!
//! The inference engine is a black box behind this trait. The contract
//! that matters to the pipeline: tokens arrive in generation order, the
//! stream ends with a `Done` carrying usage, and cancellation takes
//! effect at the next token boundary.

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::error::PortError;

/// A single generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Hard ceiling on generated tokens.
    pub max_tokens: u32,
    /// Sequences that terminate generation early.
    pub stop: Vec<String>,
    pub temperature: f32,
}

/// Token accounting reported at end of stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// One element of a generation stream.
#[derive(Debug, Clone)]
pub enum TokenEvent {
    /// A piece of generated text, in generation order.
    Token(String),
    /// Terminal event: generation finished normally.
    Done(TokenUsage),
}

/// Stream of token events; errors terminate the stream.
pub type TokenStream = BoxStream<'static, Result<TokenEvent, PortError>>;

/// Streaming text generation.
#[async_trait]
pub trait LlmPort: Send + Sync {
    /// Model identifier for logs and telemetry.
    fn model_name(&self) -> &str;

    /// Start a generation and return its token stream.
    ///
    /// `cancel` must be honored within a bounded grace window: once the
    /// token fires, the stream yields no further `Token` events after
    /// the next boundary. Failure modes map to [`PortError`]:
    /// `Overloaded` is retryable, anything else is fatal for the
    /// request.
    async fn stream(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<TokenStream, PortError>;

    async fn health(&self) -> Result<(), PortError>;
}

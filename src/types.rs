//! Core request/answer types shared across the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueryError;

/// A student question admitted into the node.
#[derive(Debug, Clone)]
pub struct Query {
    pub query_id: Uuid,
    pub user_id: String,
    pub subject_id: String,
    pub question: String,
    pub submitted_at: DateTime<Utc>,
    /// Absolute deadline; exceeded in queue or mid-stream means Timeout.
    pub deadline: Option<DateTime<Utc>>,
}

/// Provenance of one retrieved chunk that informed an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub chunk_id: String,
    pub document: String,
    pub similarity: f32,
}

/// A completed answer. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    /// Confidence in [0, 1], derived from retrieval similarity.
    pub confidence: f32,
    pub sources: Vec<SourceRef>,
    pub token_count: u32,
    pub latency_ms: u64,
}

/// Pipeline result for one processed query.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub answer: Answer,
    pub cache_hit: bool,
}

/// Trailing record delivered after the last token.
#[derive(Debug, Clone, Serialize)]
pub struct QueryReport {
    pub query_id: Uuid,
    pub answer: Answer,
    pub cache_hit: bool,
    pub latency_ms: u64,
    /// 0 = dispatched immediately; otherwise 1-indexed queue position.
    pub queue_position_on_admit: usize,
}

/// One element of the client-visible response stream.
///
/// Tokens arrive in generation order; the stream always terminates with
/// exactly one `End`. An `End` carrying an error after tokens were
/// delivered marks the response as incomplete.
#[derive(Debug)]
pub enum StreamEvent {
    Token(String),
    End(Box<Result<QueryReport, QueryError>>),
}

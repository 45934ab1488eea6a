//! Prompt assembly for the tutoring pipeline.
//!
//! The template is deterministic: fixed system directives, retrieved
//! chunks concatenated in retrieval order behind a fixed delimiter, then
//! the question. When the context does not fit the model window the
//! lowest-similarity chunks are dropped first; a chunk is never split.

use crate::ports::ScoredChunk;

/// System directives prepended to every generation.
pub const SYSTEM_DIRECTIVES: &str = "\
You are a patient tutor helping a school student. Answer using only the \
provided curriculum context. Explain step by step in simple language. If \
the context does not cover the question, say so instead of guessing.";

/// Delimiter between concatenated chunks.
pub const CHUNK_DELIMITER: &str = "\n---\n";

/// Rough token estimate: ~4 characters per token for running text.
const CHARS_PER_TOKEN: usize = 4;

/// Fixed parts of the template besides directives, context, and question.
const TEMPLATE_OVERHEAD_TOKENS: u32 = 16;

pub fn estimate_tokens(text: &str) -> u32 {
    (text.len() / CHARS_PER_TOKEN) as u32 + 1
}

/// An assembled prompt and the chunks that survived truncation.
#[derive(Debug)]
pub struct PromptPlan {
    pub prompt: String,
    /// Kept chunks, still in retrieval order.
    pub kept: Vec<ScoredChunk>,
}

/// Build the prompt, truncating to fit the model window.
///
/// `context_window` is the model's total window; the budget for chunk
/// text is what remains after the directives, the question, the
/// response reservation (`max_tokens`), and template overhead.
pub fn assemble(
    question: &str,
    retrieved: Vec<ScoredChunk>,
    context_window: u32,
    max_tokens: u32,
) -> PromptPlan {
    let overhead = estimate_tokens(SYSTEM_DIRECTIVES)
        + estimate_tokens(question)
        + max_tokens
        + TEMPLATE_OVERHEAD_TOKENS;
    let budget = context_window.saturating_sub(overhead);

    let mut kept = retrieved;
    let cost = |chunks: &[ScoredChunk]| -> u32 {
        chunks
            .iter()
            .map(|c| estimate_tokens(&c.text) + estimate_tokens(CHUNK_DELIMITER))
            .sum()
    };
    while !kept.is_empty() && cost(&kept) > budget {
        let weakest = kept
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.similarity
                    .partial_cmp(&b.similarity)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| i)
            .expect("non-empty");
        kept.remove(weakest);
    }

    let context: Vec<&str> = kept.iter().map(|c| c.text.as_str()).collect();
    let prompt = format!(
        "{SYSTEM_DIRECTIVES}\n\nContext:\n{}\n\nQuestion: {}\nAnswer:",
        context.join(CHUNK_DELIMITER),
        question.trim(),
    );
    PromptPlan { prompt, kept }
}

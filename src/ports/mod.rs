//! Abstract interfaces to everything outside the core.
//!
//! The pipeline, scheduler, and background jobs depend only on these
//! contracts; adapters live alongside them and are swapped at bootstrap.

pub mod blob;
pub mod clock;
pub mod embedder;
pub mod llm;
pub mod openai_like;
pub mod relational;
pub mod sled_store;
pub mod vector;

pub use blob::{BlobStorePort, LocalDirBlobStore, MemoryBlobStore};
pub use clock::{ClockPort, ManualClock, RandomPort, SeededRandom, SystemClock};
pub use embedder::{EmbedderPort, FailoverEmbedder, HashEmbedder};
pub use llm::{GenerationRequest, LlmPort, TokenEvent, TokenStream, TokenUsage};
pub use openai_like::{OpenAiCompatEmbedder, OpenAiCompatLlm};
pub use relational::{
    ChatRecord, Difficulty, MasteryRecord, PracticeQuestion, RelationalStorePort, RelationalTx,
    SubjectRecord, UserRecord, WeakArea,
};
pub use sled_store::SledStore;
pub use vector::{
    cosine_similarity, ChunkMetadata, MemoryVectorStore, ScoredChunk, StoredChunk, VectorStorePort,
};

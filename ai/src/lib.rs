//! Model clients for the Corpora core.
//!
//! Four clients behind narrow traits (embedding, reranking, chat LLM with
//! complete + token streaming, vision) sharing one limits contract:
//! bounded concurrency, a bounded in-flight queue with backpressure,
//! per-request timeouts and exponential-backoff retry on transient errors.
//! Every call pushes a usage record through a non-blocking hook.

pub mod embedding;
pub mod limits;
pub mod llm;
pub mod rerank;
pub mod sparse;
pub mod usage;
pub mod vision;

pub use embedding::{Embedder, HttpEmbedder, LocalEmbedder};
pub use limits::ClientLimits;
pub use llm::{
    complete_with_fallback, ChatMessage, ChatModel, CompletionOptions, CompletionResult,
    HttpChatModel, TokenChunk,
};
pub use rerank::{HttpReranker, Reranker, ScoredIndex};
pub use usage::{ChannelUsageSink, NoopUsageSink, UsageRecord, UsageSink};
pub use vision::{HttpVisionModel, VisionModel};

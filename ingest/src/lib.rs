//! Document ingestion pipeline for the Corpora core.
//!
//! A staged pipeline with durable state transitions on the document row:
//! validate -> parse -> chunk -> embed -> index -> finalize. Idempotent on
//! content hash, transactional on re-ingest, backpressured against slow
//! embedding and indexing, with per-stage progress visible to observers.

pub mod chunker;
pub mod extract;
pub mod parser;
pub mod pipeline;
pub mod progress;
pub mod validate;

pub use chunker::{chunk_text, ChunkSpan, ChunkerSettings};
pub use parser::{DocumentParser, HttpParserClient, ParsedDocument, PlainTextParser};
pub use pipeline::{DocumentUpload, IngestPipeline};
pub use progress::ProgressRegistry;

//! Shared domain and wire types for the Corpora RAG core.
//!
//! Everything that crosses a crate boundary lives here: the data model
//! (knowledge bases, documents, chunks, graph entities, conversations),
//! search request/response shapes, workflow execution state, the tagged
//! stream-event records, and the closed error kind set.

pub mod chunk;
pub mod conversation;
pub mod document;
pub mod error;
pub mod events;
pub mod graph;
pub mod knowledge;
pub mod search;
pub mod workflow;

pub use error::{CoreError, CoreResult};

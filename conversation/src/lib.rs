//! Conversation and streaming layer for the Corpora core.
//!
//! Long-lived sessions with a bounded model-context ring, the send-message
//! protocol (persist, contextualize, orchestrate, stream, finalize), typed
//! stream events with strict per-message ordering, and idle-session GC.

pub mod service;
pub mod session;
pub mod stream;

pub use service::{BlobFetcher, ChatService, SendOutcome};
pub use session::SessionManager;
pub use stream::{event_stream, EventEmitter};

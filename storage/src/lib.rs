//! Storage façades for the Corpora core.
//!
//! Three independent stores behind narrow traits: the dense-vector store
//! (Qdrant over REST), the knowledge graph store (Neo4j over Bolt), and the
//! relational metadata store (Postgres via sqlx). Each façade classifies
//! driver failures into the core's transient / permanent / conflict kinds.
//!
//! The `memory` module provides in-process implementations of all three
//! traits, used by tests and hermetic deployments.

pub mod error;
pub mod graph;
pub mod memory;
pub mod metadata;
pub mod vector;

pub use graph::{GraphStore, Neo4jGraphStore};
pub use metadata::{MetadataStore, PgMetadataStore};
pub use vector::{HybridWeights, QdrantVectorStore, VectorHit, VectorStore};

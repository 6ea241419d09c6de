//! Environment-driven configuration for the Corpora core.
//!
//! Every knob has a default matching the documented configuration surface, so
//! an empty environment yields a working config. Values are read once at
//! process start; components receive the sections they need by reference.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f32(key: &str, default: f32) -> f32 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Worker-pool and parallelism limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Documents processed concurrently by the ingest pipeline.
    pub max_ingest_workers: usize,
    /// Agent steps running concurrently inside one workflow.
    pub max_parallel_agents: usize,
    /// High-water mark for the embed/index admission queues.
    pub ingest_queue_high_water: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_ingest_workers: num_cpus::get(),
            max_parallel_agents: 4,
            ingest_queue_high_water: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub max_chunk_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
            max_chunk_size: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub default_top_k: usize,
    pub rerank_top_k: usize,
    pub rrf_k: usize,
    /// RRF weights per mode.
    pub semantic_weight: f32,
    pub sparse_weight: f32,
    pub graph_weight: f32,
    /// Generate LLM paraphrases for recall-oriented modes.
    pub expansion_enabled: bool,
    pub max_expansions: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_k: 10,
            rerank_top_k: 20,
            rrf_k: 60,
            semantic_weight: 0.6,
            sparse_weight: 0.3,
            graph_weight: 0.1,
            expansion_enabled: false,
            max_expansions: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub per_search_ms: u64,
    pub per_workflow_ms: u64,
    pub per_stream_idle_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            per_search_ms: 5_000,
            per_workflow_ms: 60_000,
            per_stream_idle_ms: 30_000,
        }
    }
}

impl TimeoutConfig {
    pub fn per_search(&self) -> Duration {
        Duration::from_millis(self.per_search_ms)
    }

    pub fn per_workflow(&self) -> Duration {
        Duration::from_millis(self.per_workflow_ms)
    }

    pub fn per_stream_idle(&self) -> Duration {
        Duration::from_millis(self.per_stream_idle_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub idle_ttl_s: u64,
    pub workflow_cache_ttl_s: u64,
    /// Messages kept in the model-context ring.
    pub context_window: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_ttl_s: 1_800,
            workflow_cache_ttl_s: 3_600,
            context_window: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub embedding_dim: usize,
    pub embedding_batch: usize,
    pub embedding_max_chars: usize,
    /// "remote" (HTTP service) or "local" (deterministic in-process model).
    pub embedding_backend: String,
    pub embedding_model: String,
    pub llm_model: String,
    pub vision_model: String,
    /// Shared client limits.
    pub client_concurrency: usize,
    pub client_queue_depth: usize,
    pub client_timeout_ms: u64,
    pub client_retries: u32,
    pub vision_max_image_bytes: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 1024,
            embedding_batch: 32,
            embedding_max_chars: 8_192,
            embedding_backend: "remote".into(),
            embedding_model: "qwen3-embedding".into(),
            llm_model: "deepseek-chat".into(),
            vision_model: "qwen-vl".into(),
            client_concurrency: 8,
            client_queue_depth: 32,
            client_timeout_ms: 30_000,
            client_retries: 3,
            vision_max_image_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Endpoints for external stores and services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub database_url: String,
    pub qdrant_url: String,
    pub qdrant_api_key: String,
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub redis_url: Option<String>,
    pub embedding_url: String,
    pub rerank_url: String,
    pub llm_url: String,
    pub vision_url: String,
    pub parser_url: String,
    /// Let the vector backend fuse dense+sparse server-side when supported.
    pub server_side_fusion: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/corpora".into(),
            qdrant_url: "http://localhost:6333".into(),
            qdrant_api_key: String::new(),
            neo4j_uri: "bolt://localhost:7687".into(),
            neo4j_user: "neo4j".into(),
            neo4j_password: "password".into(),
            redis_url: None,
            embedding_url: "http://localhost:8082".into(),
            rerank_url: "http://localhost:8082".into(),
            llm_url: "http://localhost:8083".into(),
            vision_url: "http://localhost:8084".into(),
            parser_url: "http://localhost:8085".into(),
            server_side_fusion: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Extract entities/relations into the graph store during indexing.
    pub graph_enabled: bool,
    /// Retry attempts per stage before a transient error becomes permanent.
    pub stage_retries: u32,
    /// Caption images returned by the parser via the vision client.
    pub caption_images: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            graph_enabled: true,
            stage_retries: 3,
            caption_images: true,
        }
    }
}

/// Root configuration, assembled once at process start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    pub concurrency: ConcurrencyConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub timeouts: TimeoutConfig,
    pub session: SessionConfig,
    pub model: ModelConfig,
    pub stores: StoreConfig,
    pub ingest: IngestConfig,
}

impl CoreConfig {
    /// Load from the environment, honoring a `.env` file if present.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            concurrency: ConcurrencyConfig {
                max_ingest_workers: env_usize("CORPORA_MAX_INGEST_WORKERS", num_cpus::get()),
                max_parallel_agents: env_usize("CORPORA_MAX_PARALLEL_AGENTS", 4),
                ingest_queue_high_water: env_usize("CORPORA_INGEST_QUEUE_HIGH_WATER", 64),
            },
            chunking: ChunkingConfig {
                chunk_size: env_usize("CORPORA_CHUNK_SIZE", 1000),
                chunk_overlap: env_usize("CORPORA_CHUNK_OVERLAP", 200),
                max_chunk_size: env_usize("CORPORA_MAX_CHUNK_SIZE", 2000),
            },
            retrieval: RetrievalConfig {
                default_top_k: env_usize("CORPORA_DEFAULT_TOP_K", 10),
                rerank_top_k: env_usize("CORPORA_RERANK_TOP_K", 20),
                rrf_k: env_usize("CORPORA_RRF_K", 60),
                semantic_weight: env_f32("CORPORA_SEMANTIC_WEIGHT", 0.6),
                sparse_weight: env_f32("CORPORA_SPARSE_WEIGHT", 0.3),
                graph_weight: env_f32("CORPORA_GRAPH_WEIGHT", 0.1),
                expansion_enabled: env_bool("CORPORA_QUERY_EXPANSION", false),
                max_expansions: env_usize("CORPORA_MAX_EXPANSIONS", 3),
            },
            timeouts: TimeoutConfig {
                per_search_ms: env_u64("CORPORA_PER_SEARCH_MS", 5_000),
                per_workflow_ms: env_u64("CORPORA_PER_WORKFLOW_MS", 60_000),
                per_stream_idle_ms: env_u64("CORPORA_PER_STREAM_IDLE_MS", 30_000),
            },
            session: SessionConfig {
                idle_ttl_s: env_u64("CORPORA_SESSION_IDLE_TTL_S", 1_800),
                workflow_cache_ttl_s: env_u64("CORPORA_WORKFLOW_CACHE_TTL_S", 3_600),
                context_window: env_usize("CORPORA_CONTEXT_WINDOW", 10),
            },
            model: ModelConfig {
                embedding_dim: env_usize("CORPORA_EMBEDDING_DIM", 1024),
                embedding_batch: env_usize("CORPORA_EMBEDDING_BATCH", 32),
                embedding_max_chars: env_usize("CORPORA_EMBEDDING_MAX_CHARS", 8_192),
                embedding_backend: env_string("CORPORA_EMBEDDING_BACKEND", "remote"),
                embedding_model: env_string("CORPORA_EMBEDDING_MODEL", "qwen3-embedding"),
                llm_model: env_string("CORPORA_LLM_MODEL", "deepseek-chat"),
                vision_model: env_string("CORPORA_VISION_MODEL", "qwen-vl"),
                client_concurrency: env_usize("CORPORA_CLIENT_CONCURRENCY", 8),
                client_queue_depth: env_usize("CORPORA_CLIENT_QUEUE_DEPTH", 32),
                client_timeout_ms: env_u64("CORPORA_CLIENT_TIMEOUT_MS", 30_000),
                client_retries: env_u64("CORPORA_CLIENT_RETRIES", 3) as u32,
                vision_max_image_bytes: env_usize("CORPORA_VISION_MAX_IMAGE_BYTES", 10 * 1024 * 1024),
            },
            stores: StoreConfig {
                database_url: env_string("DATABASE_URL", "postgres://localhost/corpora"),
                qdrant_url: env_string("QDRANT_URL", "http://localhost:6333"),
                qdrant_api_key: env_string("QDRANT_API_KEY", ""),
                neo4j_uri: env_string("NEO4J_URI", "bolt://localhost:7687"),
                neo4j_user: env_string("NEO4J_USER", "neo4j"),
                neo4j_password: env_string("NEO4J_PASSWORD", "password"),
                redis_url: env::var("REDIS_URL").ok(),
                embedding_url: env_string("CORPORA_EMBEDDING_URL", "http://localhost:8082"),
                rerank_url: env_string("CORPORA_RERANK_URL", "http://localhost:8082"),
                llm_url: env_string("CORPORA_LLM_URL", "http://localhost:8083"),
                vision_url: env_string("CORPORA_VISION_URL", "http://localhost:8084"),
                parser_url: env_string("CORPORA_PARSER_URL", "http://localhost:8085"),
                server_side_fusion: env_bool("CORPORA_SERVER_SIDE_FUSION", false),
            },
            ingest: IngestConfig {
                graph_enabled: env_bool("CORPORA_GRAPH_ENABLED", true),
                stage_retries: env_u64("CORPORA_STAGE_RETRIES", 3) as u32,
                caption_images: env_bool("CORPORA_CAPTION_IMAGES", true),
            },
        }
    }
}

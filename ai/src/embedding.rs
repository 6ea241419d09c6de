//! Embedding clients: remote HTTP service and a deterministic local model.

use std::time::Instant;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use corpora_config::ModelConfig;
use corpora_models::{CoreError, CoreResult};

use crate::limits::{with_retries, ClientLimits};
use crate::usage::{UsageRecord, UsageSink};

/// Batch embedding contract: order preserved, vectors L2-normalized, the
/// whole batch retried on failure (no partial results).
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>>;

    fn dimension(&self) -> usize;

    async fn embed_one(&self, text: &str) -> CoreResult<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| CoreError::dependency("embedding", "empty response"))
    }
}

/// In-place L2 normalization; zero vectors are left untouched.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Truncate on a char boundary so multi-byte input never splits mid-glyph.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}

// ============================================================================
// Remote HTTP backend
// ============================================================================

#[derive(Debug, Serialize)]
struct EmbedRequestBody<'a> {
    texts: Vec<&'a str>,
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponseBody {
    embeddings: Vec<Vec<f32>>,
}

pub struct HttpEmbedder {
    client: Client,
    url: String,
    model: String,
    dimension: usize,
    max_batch: usize,
    max_chars: usize,
    limits: ClientLimits,
    usage: Arc<dyn UsageSink>,
}

impl HttpEmbedder {
    pub fn new(
        url: impl Into<String>,
        config: &ModelConfig,
        limits: ClientLimits,
        usage: Arc<dyn UsageSink>,
    ) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            model: config.embedding_model.clone(),
            dimension: config.embedding_dim,
            max_batch: config.embedding_batch,
            max_chars: config.embedding_max_chars,
            limits,
            usage,
        }
    }

    async fn request(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
        let truncated: Vec<&str> = texts
            .iter()
            .map(|t| truncate_chars(t, self.max_chars))
            .collect();
        let body = EmbedRequestBody {
            texts: truncated,
            model: &self.model,
        };

        let response = self
            .client
            .post(format!("{}/embed", self.url))
            .timeout(self.limits.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    CoreError::transient(format!("embedding service unreachable: {}", e))
                } else {
                    CoreError::dependency("embedding", e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(CoreError::transient(format!(
                "embedding service status {}",
                status
            )));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CoreError::dependency(
                "embedding",
                format!("status {}: {}", status, text),
            ));
        }

        let parsed: EmbedResponseBody = response
            .json()
            .await
            .map_err(|e| CoreError::dependency("embedding", e.to_string()))?;

        if parsed.embeddings.len() != texts.len() {
            return Err(CoreError::dependency(
                "embedding",
                format!(
                    "expected {} vectors, got {}",
                    texts.len(),
                    parsed.embeddings.len()
                ),
            ));
        }
        for vector in &parsed.embeddings {
            if vector.len() != self.dimension {
                return Err(CoreError::dependency(
                    "embedding",
                    format!("expected dimension {}, got {}", self.dimension, vector.len()),
                ));
            }
        }

        let mut embeddings = parsed.embeddings;
        for vector in &mut embeddings {
            l2_normalize(vector);
        }
        Ok(embeddings)
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if texts.len() > self.max_batch {
            return Err(CoreError::InvalidInput(format!(
                "batch of {} exceeds limit {}",
                texts.len(),
                self.max_batch
            )));
        }

        let _permit = self.limits.acquire().await?;
        let start = Instant::now();
        let result = with_retries(self.limits.retries, "embed_batch", || self.request(texts)).await;

        if result.is_ok() {
            // Rough char-based accounting; the remote service does not
            // report token counts on this endpoint.
            let chars: usize = texts.iter().map(|t| t.len()).sum();
            self.usage.record(UsageRecord {
                model: self.model.clone(),
                prompt_tokens: (chars / 4) as u32,
                completion_tokens: 0,
                latency_ms: start.elapsed().as_millis() as u64,
            });
        }
        debug!(batch = texts.len(), ok = result.is_ok(), "embed batch finished");
        result
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

// ============================================================================
// Local deterministic backend
// ============================================================================

/// Deterministic feature-hash embedder.
///
/// Each token maps to a stable pseudo-random direction; a text embeds as the
/// normalized sum of its token directions. Identical text always produces an
/// identical vector, and lexical overlap yields high cosine similarity, which
/// is what tests and air-gapped deployments need from this backend.
pub struct LocalEmbedder {
    dimension: usize,
    max_chars: usize,
}

impl LocalEmbedder {
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            dimension: config.embedding_dim,
            max_chars: config.embedding_max_chars,
        }
    }

    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension,
            max_chars: 8_192,
        }
    }

    fn token_hash(token: &str) -> usize {
        token
            .chars()
            .fold(0usize, |acc, c| acc.wrapping_mul(31).wrapping_add(c as usize))
    }

    fn token_direction(&self, token: &str) -> Vec<f32> {
        let hash = Self::token_hash(token) % 100_000;
        let mut vector: Vec<f32> = (0..self.dimension)
            .map(|i| {
                let base = ((hash.wrapping_add(i * 3)) as f32 * 0.07).sin();
                let wobble = ((hash.wrapping_mul(17).wrapping_add(i * 5)) as f32 * 0.013).cos();
                base + 0.3 * wobble
            })
            .collect();
        l2_normalize(&mut vector);
        vector
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let text = truncate_chars(text, self.max_chars);
        let mut accumulator = vec![0.0f32; self.dimension];
        let mut token_count = 0usize;

        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let direction = self.token_direction(token);
            for (slot, value) in accumulator.iter_mut().zip(direction) {
                *slot += value;
            }
            token_count += 1;
        }

        if token_count == 0 {
            // Stable non-zero vector for empty input.
            accumulator = self.token_direction("");
        }
        l2_normalize(&mut accumulator);
        accumulator
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::NoopUsageSink;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    fn test_limits() -> ClientLimits {
        ClientLimits::new(2, 4, Duration::from_secs(2), 0)
    }

    fn test_config(dim: usize) -> ModelConfig {
        ModelConfig {
            embedding_dim: dim,
            ..ModelConfig::default()
        }
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 100), "short");
        assert_eq!(truncate_chars("中文句子", 2), "中文");
    }

    #[test]
    fn local_embedder_is_deterministic_and_normalized() {
        let embedder = LocalEmbedder::with_dimension(256);
        let a = embedder.embed_text("The capital of France is Paris.");
        let b = embedder.embed_text("The capital of France is Paris.");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn local_embedder_reflects_lexical_overlap() {
        let embedder = LocalEmbedder::with_dimension(512);
        let doc = embedder.embed_text("The capital of France is Paris.");
        let near = embedder.embed_text("What is the capital of France?");
        let far = embedder.embed_text("quantum chromodynamics lattice simulations");
        assert!(cosine(&doc, &near) > cosine(&doc, &far));
        assert!(cosine(&doc, &near) > 0.6);
    }

    #[tokio::test]
    async fn http_embedder_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embeddings": [[3.0, 4.0], [0.0, 2.0]]
            })))
            .mount(&server)
            .await;

        let embedder = HttpEmbedder::new(
            server.uri(),
            &test_config(2),
            test_limits(),
            Arc::new(NoopUsageSink),
        );
        let vectors = embedder
            .embed_batch(&["first".to_string(), "second".to_string()])
            .await
            .unwrap();

        assert_eq!(vectors.len(), 2);
        // L2-normalized server output.
        assert!((vectors[0][0] - 0.6).abs() < 1e-6);
        assert!((vectors[0][1] - 0.8).abs() < 1e-6);
        assert!((vectors[1][1] - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn http_embedder_rejects_oversized_batch() {
        let config = ModelConfig {
            embedding_batch: 2,
            ..test_config(2)
        };
        let embedder = HttpEmbedder::new(
            "http://localhost:1",
            &config,
            test_limits(),
            Arc::new(NoopUsageSink),
        );
        let batch: Vec<String> = (0..3).map(|i| format!("text {}", i)).collect();
        let err = embedder.embed_batch(&batch).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[tokio::test]
    async fn http_embedder_flags_count_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embeddings": [[1.0, 0.0]]
            })))
            .mount(&server)
            .await;

        let embedder = HttpEmbedder::new(
            server.uri(),
            &test_config(2),
            test_limits(),
            Arc::new(NoopUsageSink),
        );
        let err = embedder
            .embed_batch(&["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "dependency_failure");
    }

    #[tokio::test]
    async fn http_embedder_retries_5xx_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embed"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embeddings": [[1.0, 0.0]]
            })))
            .mount(&server)
            .await;

        let limits = ClientLimits::new(2, 4, Duration::from_secs(2), 2);
        let embedder = HttpEmbedder::new(
            server.uri(),
            &test_config(2),
            limits,
            Arc::new(NoopUsageSink),
        );
        let vectors = embedder.embed_batch(&["retry me".to_string()]).await.unwrap();
        assert_eq!(vectors.len(), 1);
    }
}

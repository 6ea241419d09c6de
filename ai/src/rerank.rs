//! Cross-encoder reranker client.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use corpora_config::ModelConfig;
use corpora_models::{CoreError, CoreResult};

use crate::limits::{with_retries, ClientLimits};
use crate::usage::{UsageRecord, UsageSink};

/// Index into the caller's passage slice plus a relevance score in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoredIndex {
    pub index: usize,
    pub score: f32,
}

/// Rerank contract: at most `top_k` results, indices into the input slice,
/// scores in [0, 1], ties keep the original passage order. Callers fall back
/// to their own ordering when this client fails.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        passages: &[String],
        top_k: usize,
    ) -> CoreResult<Vec<ScoredIndex>>;
}

#[derive(Debug, Serialize)]
struct RerankRequestBody<'a> {
    query: &'a str,
    passages: &'a [String],
    top_k: usize,
}

#[derive(Debug, Deserialize)]
struct RerankResponseBody {
    scored_indices: Vec<ScoredIndexBody>,
}

#[derive(Debug, Deserialize)]
struct ScoredIndexBody {
    index: usize,
    score: f32,
}

pub struct HttpReranker {
    client: Client,
    url: String,
    model: String,
    limits: ClientLimits,
    usage: Arc<dyn UsageSink>,
}

impl HttpReranker {
    pub fn new(
        url: impl Into<String>,
        config: &ModelConfig,
        limits: ClientLimits,
        usage: Arc<dyn UsageSink>,
    ) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            model: format!("{}-reranker", config.embedding_model),
            limits,
            usage,
        }
    }

    async fn request(
        &self,
        query: &str,
        passages: &[String],
        top_k: usize,
    ) -> CoreResult<Vec<ScoredIndex>> {
        let body = RerankRequestBody {
            query,
            passages,
            top_k,
        };
        let response = self
            .client
            .post(format!("{}/rerank", self.url))
            .timeout(self.limits.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    CoreError::transient(format!("reranker unreachable: {}", e))
                } else {
                    CoreError::dependency("reranker", e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(CoreError::transient(format!("reranker status {}", status)));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CoreError::dependency(
                "reranker",
                format!("status {}: {}", status, text),
            ));
        }

        let parsed: RerankResponseBody = response
            .json()
            .await
            .map_err(|e| CoreError::dependency("reranker", e.to_string()))?;

        let mut scored: Vec<ScoredIndex> = parsed
            .scored_indices
            .into_iter()
            .filter(|s| s.index < passages.len())
            .map(|s| ScoredIndex {
                index: s.index,
                score: s.score.clamp(0.0, 1.0),
            })
            .collect();

        // Stable ordering: score descending, original order on ties.
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.index.cmp(&b.index))
        });
        scored.truncate(top_k);
        Ok(scored)
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn rerank(
        &self,
        query: &str,
        passages: &[String],
        top_k: usize,
    ) -> CoreResult<Vec<ScoredIndex>> {
        if passages.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let _permit = self.limits.acquire().await?;
        let start = Instant::now();
        let result = with_retries(self.limits.retries, "rerank", || {
            self.request(query, passages, top_k)
        })
        .await;

        if result.is_ok() {
            self.usage.record(UsageRecord {
                model: self.model.clone(),
                prompt_tokens: ((query.len() + passages.iter().map(|p| p.len()).sum::<usize>()) / 4)
                    as u32,
                completion_tokens: 0,
                latency_ms: start.elapsed().as_millis() as u64,
            });
        }
        debug!(passages = passages.len(), top_k, ok = result.is_ok(), "rerank finished");
        result
    }
}

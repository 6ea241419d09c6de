//! Dense-vector store façade backed by Qdrant's REST API.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use corpora_config::StoreConfig;
use corpora_models::chunk::VectorRecord;
use corpora_models::search::{FilterExpr, FilterOp};
use corpora_models::{CoreError, CoreResult};

use crate::error::{classify_http, classify_status};

/// A scored hit from the vector store, carrying enough payload to build a
/// retrieval result without a metadata-store join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorHit {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub chunk_index: i32,
    /// Normalized to [0, 1].
    pub score: f32,
    pub content: String,
    pub chunk_type: String,
    pub metadata: Value,
}

/// Relative weights for client-side dense/sparse fusion.
#[derive(Debug, Clone, Copy)]
pub struct HybridWeights {
    pub dense: f32,
    pub sparse: f32,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            dense: 0.6,
            sparse: 0.3,
        }
    }
}

/// Narrow interface over the dense-vector store.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn create_collection(&self, kb_id: Uuid, dimension: usize) -> CoreResult<()>;

    async fn drop_collection(&self, kb_id: Uuid) -> CoreResult<()>;

    /// Upsert with atomic-per-record semantics; idempotent by chunk id.
    async fn upsert_batch(&self, kb_id: Uuid, records: &[VectorRecord]) -> CoreResult<()>;

    async fn search_dense(
        &self,
        kb_id: Uuid,
        query: &[f32],
        top_k: usize,
        filter: Option<&FilterExpr>,
    ) -> CoreResult<Vec<VectorHit>>;

    async fn search_sparse(
        &self,
        kb_id: Uuid,
        sparse: &BTreeMap<u32, f32>,
        top_k: usize,
        filter: Option<&FilterExpr>,
    ) -> CoreResult<Vec<VectorHit>>;

    /// Dense + sparse fusion; server-side when the backend supports it,
    /// weighted reciprocal-rank fusion client-side otherwise.
    async fn search_hybrid(
        &self,
        kb_id: Uuid,
        query: &[f32],
        sparse: &BTreeMap<u32, f32>,
        top_k: usize,
        weights: HybridWeights,
        filter: Option<&FilterExpr>,
    ) -> CoreResult<Vec<VectorHit>>;

    async fn delete_by_filter(&self, kb_id: Uuid, filter: &FilterExpr) -> CoreResult<()>;
}

/// Normalize a cosine similarity (-1..=1) into [0, 1].
pub fn normalize_cosine(score: f32) -> f32 {
    ((1.0 + score) / 2.0).clamp(0.0, 1.0)
}

/// BM25-style saturation for unbounded sparse scores.
pub fn normalize_sparse(score: f32) -> f32 {
    if score <= 0.0 {
        0.0
    } else {
        score / (score + 1.0)
    }
}

/// Weighted reciprocal-rank fusion over ranked hit lists.
///
/// A hit at rank `r` in a list with weight `w` contributes `w / (k + r + 1)`;
/// hits absent from a list contribute nothing. Order of the input lists does
/// not affect the result.
pub fn rrf_fuse(lists: Vec<(Vec<VectorHit>, f32)>, k: usize, top_k: usize) -> Vec<VectorHit> {
    let mut fused: HashMap<Uuid, (f32, VectorHit)> = HashMap::new();

    for (hits, weight) in lists {
        for (rank, hit) in hits.into_iter().enumerate() {
            let contribution = weight / (k + rank + 1) as f32;
            fused
                .entry(hit.chunk_id)
                .and_modify(|(score, _)| *score += contribution)
                .or_insert((contribution, hit));
        }
    }

    let mut results: Vec<VectorHit> = fused
        .into_values()
        .map(|(score, mut hit)| {
            hit.score = score;
            hit
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    results.truncate(top_k);
    results
}

/// Convert the filter AST into a Qdrant filter object for server-side
/// evaluation. All operators in the AST are expressible, so pushdown is
/// total.
pub fn to_qdrant_filter(expr: &FilterExpr) -> Value {
    match expr {
        FilterExpr::And(children) => json!({
            "must": children.iter().map(to_qdrant_filter).collect::<Vec<_>>()
        }),
        FilterExpr::Or(children) => json!({
            "should": children.iter().map(to_qdrant_filter).collect::<Vec<_>>()
        }),
        FilterExpr::Not(inner) => json!({
            "must_not": [to_qdrant_filter(inner)]
        }),
        FilterExpr::Atom(atom) => match atom.op {
            FilterOp::Eq => json!({ "key": atom.field, "match": { "value": atom.value } }),
            FilterOp::Ne => json!({
                "must_not": [{ "key": atom.field, "match": { "value": atom.value } }]
            }),
            FilterOp::In => json!({ "key": atom.field, "match": { "any": atom.value } }),
            FilterOp::Gt => json!({ "key": atom.field, "range": { "gt": atom.value } }),
            FilterOp::Lt => json!({ "key": atom.field, "range": { "lt": atom.value } }),
        },
    }
}

// ============================================================================
// Qdrant REST implementation
// ============================================================================

#[derive(Debug, Deserialize)]
struct SearchResponseBody {
    result: Vec<ScoredPoint>,
}

#[derive(Debug, Deserialize)]
struct QueryResponseBody {
    result: QueryResultPoints,
}

#[derive(Debug, Deserialize)]
struct QueryResultPoints {
    points: Vec<ScoredPoint>,
}

#[derive(Debug, Deserialize)]
struct ScoredPoint {
    id: String,
    score: f32,
    payload: Option<HashMap<String, Value>>,
}

#[derive(Debug, Clone)]
pub struct QdrantVectorStore {
    client: Client,
    base_url: String,
    api_key: String,
    server_side_fusion: bool,
}

impl QdrantVectorStore {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.qdrant_url.trim_end_matches('/').to_string(),
            api_key: config.qdrant_api_key.clone(),
            server_side_fusion: config.server_side_fusion,
        }
    }

    /// One collection per knowledge base.
    pub fn collection_name(kb_id: Uuid) -> String {
        format!("kb_{}", kb_id.simple())
    }

    fn url(&self, collection: &str, path: &str) -> String {
        format!("{}/collections/{}{}", self.base_url, collection, path)
    }

    async fn post_json(&self, url: &str, body: &Value) -> CoreResult<Value> {
        self.send_json(self.client.post(url), body).await
    }

    async fn put_json(&self, url: &str, body: &Value) -> CoreResult<Value> {
        self.send_json(self.client.put(url), body).await
    }

    async fn send_json(&self, request: reqwest::RequestBuilder, body: &Value) -> CoreResult<Value> {
        let response = request
            .header("api-key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(classify_http)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), text));
        }
        response
            .json()
            .await
            .map_err(|e| CoreError::dependency("vector_store", e.to_string()))
    }

    fn hit_from_point(point: ScoredPoint, normalize: fn(f32) -> f32) -> Option<VectorHit> {
        let payload = point.payload.unwrap_or_default();
        let get_str = |key: &str| payload.get(key).and_then(|v| v.as_str()).map(String::from);

        Some(VectorHit {
            chunk_id: point.id.parse().ok()?,
            document_id: get_str("document_id")?.parse().ok()?,
            chunk_index: payload
                .get("chunk_index")
                .and_then(|v| v.as_i64())
                .unwrap_or(0) as i32,
            score: normalize(point.score),
            content: get_str("content").unwrap_or_default(),
            chunk_type: get_str("chunk_type").unwrap_or_else(|| "text".to_string()),
            metadata: Value::Object(payload.into_iter().collect()),
        })
    }

    fn record_point(record: &VectorRecord) -> Value {
        let mut vector = json!({ "dense": record.dense });
        if let Some(sparse) = &record.sparse {
            let (indices, values): (Vec<u32>, Vec<f32>) =
                sparse.iter().map(|(i, v)| (*i, *v)).unzip();
            vector["sparse"] = json!({ "indices": indices, "values": values });
        }
        json!({
            "id": record.chunk_id.to_string(),
            "vector": vector,
            "payload": {
                "document_id": record.document_id.to_string(),
                "knowledge_base_id": record.knowledge_base_id.to_string(),
                "chunk_index": record.chunk_index,
                "chunk_type": record.chunk_type.as_str(),
                "content": record.content,
                "keywords": record.keywords,
            }
        })
    }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn create_collection(&self, kb_id: Uuid, dimension: usize) -> CoreResult<()> {
        let collection = Self::collection_name(kb_id);
        let url = self.url(&collection, "");

        // Idempotent: treat "already exists" as success.
        let existing = self
            .client
            .get(&url)
            .header("api-key", &self.api_key)
            .send()
            .await
            .map_err(classify_http)?;
        if existing.status().is_success() {
            debug!(collection = %collection, "collection already exists");
            return Ok(());
        }

        let body = json!({
            "vectors": { "dense": { "size": dimension, "distance": "Cosine" } },
            "sparse_vectors": { "sparse": {} }
        });
        let response = self
            .client
            .put(&url)
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_http)?;

        let status = response.status();
        if status.is_success() {
            info!(collection = %collection, dimension, "created vector collection");
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(classify_status(status.as_u16(), text))
        }
    }

    async fn drop_collection(&self, kb_id: Uuid) -> CoreResult<()> {
        let collection = Self::collection_name(kb_id);
        let response = self
            .client
            .delete(self.url(&collection, ""))
            .header("api-key", &self.api_key)
            .send()
            .await
            .map_err(classify_http)?;

        let status = response.status();
        // Dropping a missing collection is a no-op.
        if status.is_success() || status.as_u16() == 404 {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(classify_status(status.as_u16(), text))
        }
    }

    async fn upsert_batch(&self, kb_id: Uuid, records: &[VectorRecord]) -> CoreResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let collection = Self::collection_name(kb_id);
        let points: Vec<Value> = records.iter().map(Self::record_point).collect();
        let body = json!({ "points": points });

        self.put_json(&format!("{}?wait=true", self.url(&collection, "/points")), &body)
            .await?;
        debug!(collection = %collection, count = records.len(), "upserted vector batch");
        Ok(())
    }

    async fn search_dense(
        &self,
        kb_id: Uuid,
        query: &[f32],
        top_k: usize,
        filter: Option<&FilterExpr>,
    ) -> CoreResult<Vec<VectorHit>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let collection = Self::collection_name(kb_id);
        let mut body = json!({
            "vector": { "name": "dense", "vector": query },
            "limit": top_k,
            "with_payload": true,
        });
        if let Some(expr) = filter {
            body["filter"] = to_qdrant_filter(expr);
        }

        let raw = self
            .post_json(&self.url(&collection, "/points/search"), &body)
            .await?;
        let parsed: SearchResponseBody = serde_json::from_value(raw)
            .map_err(|e| CoreError::dependency("vector_store", e.to_string()))?;
        Ok(parsed
            .result
            .into_iter()
            .filter_map(|p| Self::hit_from_point(p, normalize_cosine))
            .collect())
    }

    async fn search_sparse(
        &self,
        kb_id: Uuid,
        sparse: &BTreeMap<u32, f32>,
        top_k: usize,
        filter: Option<&FilterExpr>,
    ) -> CoreResult<Vec<VectorHit>> {
        if top_k == 0 || sparse.is_empty() {
            return Ok(Vec::new());
        }
        let collection = Self::collection_name(kb_id);
        let (indices, values): (Vec<u32>, Vec<f32>) = sparse.iter().map(|(i, v)| (*i, *v)).unzip();
        let mut body = json!({
            "vector": { "name": "sparse", "vector": { "indices": indices, "values": values } },
            "limit": top_k,
            "with_payload": true,
        });
        if let Some(expr) = filter {
            body["filter"] = to_qdrant_filter(expr);
        }

        let raw = self
            .post_json(&self.url(&collection, "/points/search"), &body)
            .await?;
        let parsed: SearchResponseBody = serde_json::from_value(raw)
            .map_err(|e| CoreError::dependency("vector_store", e.to_string()))?;
        Ok(parsed
            .result
            .into_iter()
            .filter_map(|p| Self::hit_from_point(p, normalize_sparse))
            .collect())
    }

    async fn search_hybrid(
        &self,
        kb_id: Uuid,
        query: &[f32],
        sparse: &BTreeMap<u32, f32>,
        top_k: usize,
        weights: HybridWeights,
        filter: Option<&FilterExpr>,
    ) -> CoreResult<Vec<VectorHit>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        if self.server_side_fusion {
            let collection = Self::collection_name(kb_id);
            let (indices, values): (Vec<u32>, Vec<f32>) =
                sparse.iter().map(|(i, v)| (*i, *v)).unzip();
            let mut body = json!({
                "prefetch": [
                    { "query": query, "using": "dense", "limit": top_k * 2 },
                    {
                        "query": { "indices": indices, "values": values },
                        "using": "sparse",
                        "limit": top_k * 2
                    }
                ],
                "query": { "fusion": "rrf" },
                "limit": top_k,
                "with_payload": true,
            });
            if let Some(expr) = filter {
                body["filter"] = to_qdrant_filter(expr);
            }

            let raw = self
                .post_json(&self.url(&collection, "/points/query"), &body)
                .await?;
            let parsed: QueryResponseBody = serde_json::from_value(raw)
                .map_err(|e| CoreError::dependency("vector_store", e.to_string()))?;
            return Ok(parsed
                .result
                .points
                .into_iter()
                .filter_map(|p| Self::hit_from_point(p, |s| s.clamp(0.0, 1.0)))
                .collect());
        }

        // Client-side fusion: both searches, then weighted RRF.
        let fetch = top_k * 2;
        let (dense, sparse_hits) = tokio::join!(
            self.search_dense(kb_id, query, fetch, filter),
            self.search_sparse(kb_id, sparse, fetch, filter)
        );
        let dense = dense?;
        let sparse_hits = match sparse_hits {
            Ok(hits) => hits,
            Err(e) if e.is_transient() => {
                warn!("sparse leg failed, degrading to dense-only: {}", e);
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        Ok(rrf_fuse(
            vec![(dense, weights.dense), (sparse_hits, weights.sparse)],
            60,
            top_k,
        ))
    }

    async fn delete_by_filter(&self, kb_id: Uuid, filter: &FilterExpr) -> CoreResult<()> {
        let collection = Self::collection_name(kb_id);
        let body = json!({ "filter": to_qdrant_filter(filter) });
        self.post_json(
            &format!("{}?wait=true", self.url(&collection, "/points/delete")),
            &body,
        )
        .await?;
        Ok(())
    }
}

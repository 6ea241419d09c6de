//! The retrieval engine: mode dispatch, fan-out, fusion, rerank.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use corpora_ai::{sparse, ChatMessage, ChatModel, CompletionOptions, Embedder, Reranker};
use corpora_config::{RetrievalConfig, TimeoutConfig};
use corpora_models::search::{
    RetrievedChunk, SearchMetadata, SearchMode, SearchRequest, SearchResponse,
};
use corpora_models::{CoreError, CoreResult};
use corpora_storage::{GraphStore, HybridWeights, MetadataStore, VectorHit, VectorStore};

use crate::cache::SearchCache;
use crate::fusion::{dedupe_max_score, sort_stable};
use crate::graph_search;

pub struct RetrievalEngine {
    vectors: Arc<dyn VectorStore>,
    graph: Arc<dyn GraphStore>,
    metadata: Arc<dyn MetadataStore>,
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<dyn Reranker>>,
    llm: Option<Arc<dyn ChatModel>>,
    config: RetrievalConfig,
    per_search: Duration,
    cache: Option<Arc<SearchCache>>,
}

impl RetrievalEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RetrievalConfig,
        timeouts: &TimeoutConfig,
        vectors: Arc<dyn VectorStore>,
        graph: Arc<dyn GraphStore>,
        metadata: Arc<dyn MetadataStore>,
        embedder: Arc<dyn Embedder>,
        reranker: Option<Arc<dyn Reranker>>,
        llm: Option<Arc<dyn ChatModel>>,
        cache: Option<Arc<SearchCache>>,
    ) -> Self {
        Self {
            vectors,
            graph,
            metadata,
            embedder,
            reranker,
            llm,
            config,
            per_search: timeouts.per_search(),
            cache,
        }
    }

    /// Execute one search request end to end.
    pub async fn search(&self, request: &SearchRequest) -> CoreResult<SearchResponse> {
        if request.query.trim().is_empty() {
            return Err(CoreError::InvalidInput("query is empty".into()));
        }
        if request.top_k == 0 {
            return Ok(SearchResponse {
                results: Vec::new(),
                metadata: SearchMetadata::default(),
            });
        }

        let started = Instant::now();
        let cache_key = self.cache.as_ref().map(|_| SearchCache::key(request));
        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Some(mut cached) = cache.get(key).await {
                cached.metadata.cache_hit = true;
                return Ok(cached);
            }
        }

        let queries = self.expand_queries(request).await;
        let mut metadata = SearchMetadata::default();

        let mut results = match request.mode {
            SearchMode::All => self.search_all(request, &queries, &mut metadata).await?,
            mode => {
                let hits = timeout(
                    self.per_search,
                    self.run_mode(mode, request, &queries),
                )
                .await
                .map_err(|_| CoreError::Cancelled(format!("{} search timed out", mode.as_str())))??;
                metadata.modes_completed.push(mode);
                hits
            }
        };

        // Rerank the fused head, degrade to the fused order on failure.
        if request.enable_rerank {
            match self.rerank(&request.query, &mut results, request.top_k).await {
                Ok(()) => {}
                Err(e) => {
                    warn!("rerank failed, keeping fused order: {}", e);
                    metadata.rerank_failed = true;
                }
            }
        }
        results.truncate(request.top_k);

        metadata.elapsed_ms = started.elapsed().as_millis() as u64;
        let response = SearchResponse { results, metadata };

        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if !response.metadata.partial {
                cache.put(key, &response).await;
            }
        }
        Ok(response)
    }

    /// Paraphrase expansion for recall-oriented modes; failures degrade to
    /// the raw query.
    async fn expand_queries(&self, request: &SearchRequest) -> Vec<String> {
        let mut queries = vec![request.query.clone()];
        if !self.config.expansion_enabled || matches!(request.mode, SearchMode::Sparse) {
            return queries;
        }
        let Some(llm) = &self.llm else {
            return queries;
        };

        let prompt = format!(
            "Rewrite the following search query as up to {} alternative phrasings \
             that preserve its meaning. Return one phrasing per line with no numbering.\n\
             Query: {}",
            self.config.max_expansions, request.query
        );
        let completion = llm
            .complete(
                &[ChatMessage::user(prompt)],
                &CompletionOptions {
                    temperature: 0.7,
                    max_tokens: 256,
                    tools: None,
                },
            )
            .await;

        match completion {
            Ok(result) => {
                for line in result
                    .content
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .take(self.config.max_expansions)
                {
                    if !queries.iter().any(|q| q.eq_ignore_ascii_case(line)) {
                        queries.push(line.to_string());
                    }
                }
                debug!(variants = queries.len(), "query expansion produced variants");
            }
            Err(e) => warn!("query expansion failed, using raw query: {}", e),
        }
        queries
    }

    /// How many candidates to pull per sub-search: the rerank head when
    /// reranking, otherwise the requested page.
    fn fetch_size(&self, request: &SearchRequest) -> usize {
        if request.enable_rerank {
            request.top_k.max(self.config.rerank_top_k)
        } else {
            request.top_k
        }
    }

    async fn run_mode(
        &self,
        mode: SearchMode,
        request: &SearchRequest,
        queries: &[String],
    ) -> CoreResult<Vec<RetrievedChunk>> {
        match mode {
            SearchMode::Semantic => self.semantic_search(request, queries).await,
            SearchMode::Sparse => self.sparse_search(request).await,
            SearchMode::Hybrid => self.hybrid_search(request, queries).await,
            SearchMode::Graph => {
                graph_search::graph_search(
                    &self.graph,
                    &self.metadata,
                    request.knowledge_base_id,
                    &request.query,
                    self.fetch_size(request),
                )
                .await
            }
            SearchMode::All => unreachable!("all-mode handled by search_all"),
        }
    }

    async fn semantic_search(
        &self,
        request: &SearchRequest,
        queries: &[String],
    ) -> CoreResult<Vec<RetrievedChunk>> {
        let fetch = self.fetch_size(request);
        let mut variant_lists = Vec::new();
        for query in queries {
            let vector = self.embedder.embed_one(query).await?;
            let hits = self
                .vectors
                .search_dense(
                    request.knowledge_base_id,
                    &vector,
                    fetch,
                    request.filter.as_ref(),
                )
                .await?;
            variant_lists.push((
                SearchMode::Semantic,
                to_chunks(hits, request.knowledge_base_id, SearchMode::Semantic),
            ));
        }
        let mut merged = dedupe_max_score(variant_lists);
        merged.truncate(fetch);
        Ok(merged)
    }

    async fn sparse_search(&self, request: &SearchRequest) -> CoreResult<Vec<RetrievedChunk>> {
        let encoded = sparse::encode(&request.query);
        let hits = self
            .vectors
            .search_sparse(
                request.knowledge_base_id,
                &encoded,
                self.fetch_size(request),
                request.filter.as_ref(),
            )
            .await?;
        Ok(to_chunks(hits, request.knowledge_base_id, SearchMode::Sparse))
    }

    async fn hybrid_search(
        &self,
        request: &SearchRequest,
        queries: &[String],
    ) -> CoreResult<Vec<RetrievedChunk>> {
        let fetch = self.fetch_size(request);
        let weights = HybridWeights {
            dense: self.config.semantic_weight,
            sparse: self.config.sparse_weight,
        };
        let mut variant_lists = Vec::new();
        for query in queries {
            let vector = self.embedder.embed_one(query).await?;
            let encoded = sparse::encode(query);
            let hits = self
                .vectors
                .search_hybrid(
                    request.knowledge_base_id,
                    &vector,
                    &encoded,
                    fetch,
                    weights,
                    request.filter.as_ref(),
                )
                .await?;
            variant_lists.push((
                SearchMode::Hybrid,
                to_chunks(hits, request.knowledge_base_id, SearchMode::Hybrid),
            ));
        }
        let mut merged = dedupe_max_score(variant_lists);
        merged.truncate(fetch);
        Ok(merged)
    }

    /// Fan out semantic, hybrid and graph; an expired or failed leg is
    /// dropped and recorded, never propagated.
    async fn search_all(
        &self,
        request: &SearchRequest,
        queries: &[String],
        metadata: &mut SearchMetadata,
    ) -> CoreResult<Vec<RetrievedChunk>> {
        let (semantic, hybrid, graph) = tokio::join!(
            timeout(self.per_search, self.run_mode(SearchMode::Semantic, request, queries)),
            timeout(self.per_search, self.run_mode(SearchMode::Hybrid, request, queries)),
            timeout(self.per_search, self.run_mode(SearchMode::Graph, request, queries)),
        );

        let mut lists = Vec::new();
        for (mode, outcome) in [
            (SearchMode::Semantic, semantic),
            (SearchMode::Hybrid, hybrid),
            (SearchMode::Graph, graph),
        ] {
            match outcome {
                Ok(Ok(hits)) => {
                    metadata.modes_completed.push(mode);
                    lists.push((mode, hits));
                }
                Ok(Err(e)) => {
                    warn!(mode = mode.as_str(), "mode failed in fan-out: {}", e);
                    metadata.modes_failed.push(mode);
                }
                Err(_) => {
                    warn!(mode = mode.as_str(), "mode missed its deadline");
                    metadata.modes_failed.push(mode);
                }
            }
        }
        metadata.partial = !metadata.modes_failed.is_empty();

        let mut merged = dedupe_max_score(lists);
        merged.truncate(self.fetch_size(request).max(request.top_k * 2));
        Ok(merged)
    }

    /// Rerank the head of the fused list in place.
    async fn rerank(
        &self,
        query: &str,
        results: &mut Vec<RetrievedChunk>,
        top_k: usize,
    ) -> CoreResult<()> {
        let Some(reranker) = &self.reranker else {
            return Ok(());
        };
        if results.is_empty() {
            return Ok(());
        }

        let head = self.config.rerank_top_k.max(top_k).min(results.len());
        let passages: Vec<String> = results[..head].iter().map(|r| r.content.clone()).collect();
        let scored = reranker.rerank(query, &passages, head).await?;

        let mut reranked: Vec<RetrievedChunk> = scored
            .into_iter()
            .filter_map(|s| {
                results.get(s.index).map(|r| {
                    let mut chunk = r.clone();
                    chunk.score = s.score;
                    chunk
                })
            })
            .collect();
        sort_stable(&mut reranked);

        // Anything past the reranked head keeps its fused order behind it.
        let tail: Vec<RetrievedChunk> = results.drain(..).skip(head).collect();
        reranked.extend(tail);
        *results = reranked;
        Ok(())
    }
}

fn to_chunks(hits: Vec<VectorHit>, kb_id: Uuid, mode: SearchMode) -> Vec<RetrievedChunk> {
    hits.into_iter()
        .map(|hit| RetrievedChunk {
            chunk_id: hit.chunk_id,
            document_id: hit.document_id,
            knowledge_base_id: kb_id,
            chunk_index: hit.chunk_index,
            content: hit.content,
            score: hit.score,
            chunk_type: corpora_models::chunk::ChunkType::parse(&hit.chunk_type)
                .unwrap_or(corpora_models::chunk::ChunkType::Text),
            matched_modes: vec![mode],
            metadata: hit.metadata,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use corpora_ai::{LocalEmbedder, ScoredIndex};
    use corpora_models::chunk::{Chunk, ChunkType, VectorRecord};
    use corpora_storage::memory::{MemoryGraphStore, MemoryMetadataStore, MemoryVectorStore};

    struct FailingReranker;

    #[async_trait]
    impl Reranker for FailingReranker {
        async fn rerank(
            &self,
            _query: &str,
            _passages: &[String],
            _top_k: usize,
        ) -> CoreResult<Vec<ScoredIndex>> {
            Err(CoreError::dependency("reranker", "model offline"))
        }
    }

    struct Fixture {
        engine: RetrievalEngine,
        kb_id: Uuid,
    }

    async fn fixture_with(
        reranker: Option<Arc<dyn Reranker>>,
        documents: &[(&str, &str)],
    ) -> Fixture {
        let kb_id = Uuid::new_v4();
        let vectors: Arc<dyn VectorStore> = Arc::new(MemoryVectorStore::new());
        let graph: Arc<dyn GraphStore> = Arc::new(MemoryGraphStore::new());
        let metadata: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::new());
        let embedder = Arc::new(LocalEmbedder::with_dimension(128));

        vectors.create_collection(kb_id, 128).await.unwrap();
        for (_, text) in documents {
            let doc_id = Uuid::new_v4();
            let dense = embedder.embed_one(text).await.unwrap();
            vectors
                .upsert_batch(
                    kb_id,
                    &[VectorRecord {
                        chunk_id: Chunk::derive_id(&doc_id, 0),
                        document_id: doc_id,
                        knowledge_base_id: kb_id,
                        dense,
                        sparse: Some(sparse::encode(text)),
                        keywords: sparse::keywords(text, 8),
                        content: text.to_string(),
                        chunk_type: ChunkType::Text,
                        chunk_index: 0,
                    }],
                )
                .await
                .unwrap();
        }

        let engine = RetrievalEngine::new(
            RetrievalConfig::default(),
            &TimeoutConfig::default(),
            vectors,
            graph,
            metadata,
            embedder,
            reranker,
            None,
            None,
        );
        Fixture { engine, kb_id }
    }

    fn request(kb_id: Uuid, query: &str, mode: SearchMode, top_k: usize) -> SearchRequest {
        SearchRequest {
            knowledge_base_id: kb_id,
            query: query.into(),
            mode,
            top_k,
            filter: None,
            enable_rerank: false,
        }
    }

    #[tokio::test]
    async fn empty_query_is_invalid_input() {
        let f = fixture_with(None, &[]).await;
        let err = f
            .engine
            .search(&request(f.kb_id, "   ", SearchMode::Semantic, 5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[tokio::test]
    async fn top_k_zero_returns_empty_not_error() {
        let f = fixture_with(None, &[("d", "some content here")]).await;
        let response = f
            .engine
            .search(&request(f.kb_id, "content", SearchMode::Semantic, 0))
            .await
            .unwrap();
        assert!(response.results.is_empty());
    }

    #[tokio::test]
    async fn semantic_search_finds_the_relevant_chunk() {
        let f = fixture_with(
            None,
            &[
                ("d1", "The capital of France is Paris."),
                ("d2", "Rust ownership prevents data races at compile time."),
            ],
        )
        .await;
        let response = f
            .engine
            .search(&request(
                f.kb_id,
                "What is the capital of France?",
                SearchMode::Semantic,
                1,
            ))
            .await
            .unwrap();
        assert_eq!(response.results.len(), 1);
        assert!(response.results[0].content.contains("Paris"));
        assert!(response.results[0].score > 0.8);
        assert_eq!(response.metadata.modes_completed, vec![SearchMode::Semantic]);
    }

    #[tokio::test]
    async fn hybrid_fuses_both_documents() {
        let f = fixture_with(
            None,
            &[
                ("d1", "Paris is a city"),
                ("d2", "The capital of France"),
            ],
        )
        .await;
        let response = f
            .engine
            .search(&request(
                f.kb_id,
                "capital of France Paris",
                SearchMode::Hybrid,
                2,
            ))
            .await
            .unwrap();
        assert_eq!(response.results.len(), 2);
        let contents: Vec<&str> = response.results.iter().map(|r| r.content.as_str()).collect();
        assert!(contents.iter().any(|c| c.contains("Paris is a city")));
        assert!(contents.iter().any(|c| c.contains("capital of France")));
    }

    #[tokio::test]
    async fn rerank_failure_is_graceful() {
        let f = fixture_with(
            Some(Arc::new(FailingReranker)),
            &[
                ("d1", "The capital of France is Paris."),
                ("d2", "Berlin is the capital of Germany."),
            ],
        )
        .await;
        let mut req = request(f.kb_id, "capital of France", SearchMode::Hybrid, 2);
        req.enable_rerank = true;
        let response = f.engine.search(&req).await.unwrap();
        assert!(response.metadata.rerank_failed);
        assert!(!response.results.is_empty());
    }

    #[tokio::test]
    async fn all_mode_merges_and_tags_sources() {
        let f = fixture_with(None, &[("d1", "The capital of France is Paris.")]).await;
        let response = f
            .engine
            .search(&request(f.kb_id, "capital of France", SearchMode::All, 5))
            .await
            .unwrap();
        assert!(!response.results.is_empty());
        assert!(response
            .metadata
            .modes_completed
            .contains(&SearchMode::Semantic));
        assert!(response
            .metadata
            .modes_completed
            .contains(&SearchMode::Hybrid));
        // The same chunk surfaced through more than one mode.
        assert!(response.results[0].matched_modes.len() >= 2);
        assert!(!response.metadata.partial);
    }

    struct BrokenGraph;

    #[async_trait]
    impl GraphStore for BrokenGraph {
        async fn upsert_entity(
            &self,
            _entity: &corpora_models::graph::Entity,
        ) -> CoreResult<Uuid> {
            Err(CoreError::transient("graph down"))
        }
        async fn upsert_relation(
            &self,
            _kb_id: Uuid,
            _relation: &corpora_models::graph::Relation,
        ) -> CoreResult<()> {
            Err(CoreError::transient("graph down"))
        }
        async fn find_entities(
            &self,
            _kb_id: Uuid,
            _pattern: &str,
            _types: &[corpora_models::graph::EntityType],
            _limit: usize,
        ) -> CoreResult<Vec<corpora_models::graph::Entity>> {
            Err(CoreError::transient("graph down"))
        }
        async fn traverse(
            &self,
            _kb_id: Uuid,
            _start: &str,
            _hops: usize,
            _filter: &[corpora_models::graph::RelationType],
            _limit: usize,
        ) -> CoreResult<Vec<corpora_models::graph::GraphPath>> {
            Err(CoreError::transient("graph down"))
        }
        async fn context_chunk_ids(
            &self,
            _kb_id: Uuid,
            _entity: &str,
            _limit: usize,
        ) -> CoreResult<Vec<Uuid>> {
            Err(CoreError::transient("graph down"))
        }
        async fn remove_chunk_refs(&self, _kb_id: Uuid, _chunks: &[Uuid]) -> CoreResult<()> {
            Err(CoreError::transient("graph down"))
        }
        async fn delete_knowledge_base(&self, _kb_id: Uuid) -> CoreResult<()> {
            Err(CoreError::transient("graph down"))
        }
        async fn entity_count(&self, _kb_id: Uuid) -> CoreResult<u64> {
            Err(CoreError::transient("graph down"))
        }
    }

    #[tokio::test]
    async fn all_mode_reports_failed_legs_as_partial() {
        let kb_id = Uuid::new_v4();
        let vectors: Arc<dyn VectorStore> = Arc::new(MemoryVectorStore::new());
        let metadata: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::new());
        let embedder = Arc::new(LocalEmbedder::with_dimension(64));
        vectors.create_collection(kb_id, 64).await.unwrap();
        let text = "The capital of France is Paris.";
        let doc_id = Uuid::new_v4();
        vectors
            .upsert_batch(
                kb_id,
                &[VectorRecord {
                    chunk_id: Chunk::derive_id(&doc_id, 0),
                    document_id: doc_id,
                    knowledge_base_id: kb_id,
                    dense: embedder.embed_one(text).await.unwrap(),
                    sparse: Some(sparse::encode(text)),
                    keywords: vec![],
                    content: text.into(),
                    chunk_type: ChunkType::Text,
                    chunk_index: 0,
                }],
            )
            .await
            .unwrap();

        let engine = RetrievalEngine::new(
            RetrievalConfig::default(),
            &TimeoutConfig::default(),
            vectors,
            Arc::new(BrokenGraph),
            metadata,
            embedder,
            None,
            None,
            None,
        );
        let response = engine
            .search(&request(kb_id, "capital of France", SearchMode::All, 5))
            .await
            .unwrap();
        assert!(response.metadata.partial);
        assert!(response.metadata.modes_failed.contains(&SearchMode::Graph));
        assert!(!response.results.is_empty());
    }
}

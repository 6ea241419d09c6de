//! Corpora: the enterprise RAG core.
//!
//! `Services` is the composition root: every store, model client and engine
//! is constructed once at process start and injected explicitly. The public
//! methods on `Services` are the inbound operation surface; an external
//! transport layer (HTTP, gRPC) is expected to wrap them one-to-one.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;
use validator::Validate;

use corpora_agents::{ExecutionRegistry, WorkflowEngine, WorkflowKind};
use corpora_ai::{
    ChannelUsageSink, ChatModel, Embedder, HttpChatModel, HttpEmbedder, HttpReranker,
    HttpVisionModel, ClientLimits, LocalEmbedder, Reranker, UsageSink, VisionModel,
};
use corpora_config::CoreConfig;
use corpora_conversation::{BlobFetcher, ChatService, SendOutcome, SessionManager};
use corpora_ingest::{
    DocumentParser, DocumentUpload, HttpParserClient, IngestPipeline, ProgressRegistry,
};
use corpora_models::conversation::{Conversation, MessageContent, MessagePage};
use corpora_models::document::{
    DocumentStatusResponse, IngestOptions, IngestReceipt,
};
use corpora_models::events::StreamEvent;
use corpora_models::knowledge::{CreateKnowledgeBaseRequest, KnowledgeBase, KnowledgeBaseStats};
use corpora_models::search::{FilterExpr, SearchRequest, SearchResponse};
use corpora_models::workflow::WorkflowExecution;
use corpora_models::{CoreError, CoreResult};
use corpora_retrieval::{RetrievalEngine, SearchCache};
use corpora_storage::{
    GraphStore, MetadataStore, Neo4jGraphStore, PgMetadataStore, QdrantVectorStore, VectorStore,
};

/// The root of the system: holds every shared handle and owns the root
/// cancellation token that all background work descends from.
pub struct Services {
    config: CoreConfig,
    metadata: Arc<dyn MetadataStore>,
    vectors: Arc<dyn VectorStore>,
    graph: Arc<dyn GraphStore>,
    retrieval: Arc<RetrievalEngine>,
    pipeline: Arc<IngestPipeline>,
    progress: Arc<ProgressRegistry>,
    chat: Arc<ChatService>,
    registry: Arc<ExecutionRegistry>,
    root: CancellationToken,
}

impl Services {
    /// Production wiring: connect every external store and service from the
    /// configuration.
    pub async fn connect(config: CoreConfig) -> CoreResult<Self> {
        corpora_observability::init_tracing(&corpora_observability::TracingConfig::for_service(
            "corpora-core",
        ));
        info!("connecting core services");
        let metadata: Arc<dyn MetadataStore> =
            Arc::new(PgMetadataStore::connect(&config.stores.database_url).await?);
        let vectors: Arc<dyn VectorStore> = Arc::new(QdrantVectorStore::new(&config.stores));
        let graph: Arc<dyn GraphStore> = Arc::new(Neo4jGraphStore::connect(&config.stores).await?);

        let limits = ClientLimits::from_config(&config.model);
        let (usage_sink, mut usage_rx) = ChannelUsageSink::new();
        let usage: Arc<dyn UsageSink> = Arc::new(usage_sink);
        tokio::spawn(async move {
            while let Some(record) = usage_rx.recv().await {
                debug!(
                    model = %record.model,
                    prompt_tokens = record.prompt_tokens,
                    completion_tokens = record.completion_tokens,
                    latency_ms = record.latency_ms,
                    "model usage"
                );
            }
        });

        let embedder: Arc<dyn Embedder> = if config.model.embedding_backend == "local" {
            Arc::new(LocalEmbedder::new(&config.model))
        } else {
            Arc::new(HttpEmbedder::new(
                config.stores.embedding_url.clone(),
                &config.model,
                limits.clone(),
                Arc::clone(&usage),
            ))
        };
        let reranker: Arc<dyn Reranker> = Arc::new(HttpReranker::new(
            config.stores.rerank_url.clone(),
            &config.model,
            limits.clone(),
            Arc::clone(&usage),
        ));
        let llm: Arc<dyn ChatModel> = Arc::new(HttpChatModel::new(
            config.stores.llm_url.clone(),
            &config.model,
            limits.clone(),
            Arc::clone(&usage),
        ));
        let vision: Arc<dyn VisionModel> = Arc::new(HttpVisionModel::new(
            config.stores.vision_url.clone(),
            &config.model,
            limits,
            usage,
        ));
        let parser: Arc<dyn DocumentParser> = Arc::new(HttpParserClient::new(
            config.stores.parser_url.clone(),
            config.concurrency.max_ingest_workers,
        ));

        let cache = Arc::new(
            SearchCache::new(
                config.stores.redis_url.as_deref(),
                config.session.workflow_cache_ttl_s,
            )
            .await,
        );

        Self::assemble(
            config,
            metadata,
            vectors,
            graph,
            embedder,
            Some(reranker),
            llm,
            Some(vision),
            None,
            parser,
            Some(cache),
        )
    }

    /// Explicit wiring for tests and embedded deployments.
    #[allow(clippy::too_many_arguments)]
    pub fn with_stores(
        config: CoreConfig,
        metadata: Arc<dyn MetadataStore>,
        vectors: Arc<dyn VectorStore>,
        graph: Arc<dyn GraphStore>,
        embedder: Arc<dyn Embedder>,
        reranker: Option<Arc<dyn Reranker>>,
        llm: Arc<dyn ChatModel>,
        vision: Option<Arc<dyn VisionModel>>,
        blobs: Option<Arc<dyn BlobFetcher>>,
        parser: Arc<dyn DocumentParser>,
    ) -> CoreResult<Self> {
        Self::assemble(
            config, metadata, vectors, graph, embedder, reranker, llm, vision, blobs, parser, None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        config: CoreConfig,
        metadata: Arc<dyn MetadataStore>,
        vectors: Arc<dyn VectorStore>,
        graph: Arc<dyn GraphStore>,
        embedder: Arc<dyn Embedder>,
        reranker: Option<Arc<dyn Reranker>>,
        llm: Arc<dyn ChatModel>,
        vision: Option<Arc<dyn VisionModel>>,
        blobs: Option<Arc<dyn BlobFetcher>>,
        parser: Arc<dyn DocumentParser>,
        cache: Option<Arc<SearchCache>>,
    ) -> CoreResult<Self> {
        let root = CancellationToken::new();

        let retrieval = Arc::new(RetrievalEngine::new(
            config.retrieval.clone(),
            &config.timeouts,
            Arc::clone(&vectors),
            Arc::clone(&graph),
            Arc::clone(&metadata),
            Arc::clone(&embedder),
            reranker,
            Some(Arc::clone(&llm)),
            cache,
        ));

        let pipeline = Arc::new(IngestPipeline::new(
            &config,
            Arc::clone(&metadata),
            Arc::clone(&vectors),
            Arc::clone(&graph),
            embedder,
            vision.clone(),
            parser,
            root.child_token(),
        ));
        let progress = pipeline.progress();

        let registry = Arc::new(ExecutionRegistry::new(std::time::Duration::from_secs(
            config.session.workflow_cache_ttl_s,
        )));
        registry.spawn_purger(root.child_token());

        let workflows = Arc::new(WorkflowEngine::new(
            &config,
            Arc::clone(&retrieval),
            llm,
            Arc::clone(&registry),
        ));

        let sessions = Arc::new(SessionManager::new(
            std::time::Duration::from_secs(config.session.idle_ttl_s),
            config.session.context_window,
        ));
        sessions.spawn_gc(root.child_token());

        let chat = Arc::new(ChatService::new(
            Arc::clone(&metadata),
            workflows,
            vision,
            blobs,
            sessions,
            config.retrieval.default_top_k,
            root.child_token(),
        ));

        Ok(Self {
            config,
            metadata,
            vectors,
            graph,
            retrieval,
            pipeline,
            progress,
            chat,
            registry,
            root,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Direct façade access for administrative tooling and tests.
    pub fn graph(&self) -> &Arc<dyn GraphStore> {
        &self.graph
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    /// Cancel every background task and in-flight operation.
    pub fn shutdown(&self) {
        info!("core services shutting down");
        self.root.cancel();
    }

    // ------------------------------------------------------------------
    // Knowledge bases
    // ------------------------------------------------------------------

    pub async fn create_knowledge_base(
        &self,
        request: CreateKnowledgeBaseRequest,
    ) -> CoreResult<KnowledgeBase> {
        request
            .validate()
            .map_err(|e| CoreError::InvalidInput(e.to_string()))?;

        let now = Utc::now();
        let kb = KnowledgeBase {
            id: Uuid::new_v4(),
            name: request.name,
            owner: request.owner,
            visibility: request.visibility,
            allowed_file_types: request.allowed_file_types,
            size_limit_bytes: request
                .size_limit_bytes
                .unwrap_or(KnowledgeBase::DEFAULT_SIZE_LIMIT),
            config: request.config.unwrap_or_else(|| serde_json::json!({})),
            is_deleted: false,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        self.metadata.create_knowledge_base(&kb).await?;
        self.vectors
            .create_collection(kb.id, self.config.model.embedding_dim)
            .await?;
        info!(kb_id = %kb.id, name = %kb.name, "knowledge base created");
        Ok(kb)
    }

    /// Soft-delete the knowledge base and cascade to its indexes.
    pub async fn delete_knowledge_base(&self, kb_id: Uuid) -> CoreResult<()> {
        self.metadata.soft_delete_knowledge_base(kb_id).await?;
        self.vectors.drop_collection(kb_id).await?;
        self.graph.delete_knowledge_base(kb_id).await?;
        info!(kb_id = %kb_id, "knowledge base deleted");
        Ok(())
    }

    pub async fn knowledge_base_stats(&self, kb_id: Uuid) -> CoreResult<KnowledgeBaseStats> {
        let mut stats = self.metadata.knowledge_base_stats(kb_id).await?;
        stats.entity_count = self.graph.entity_count(kb_id).await.unwrap_or(0);
        Ok(stats)
    }

    // ------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------

    /// Register an upload; processing continues asynchronously. Saturation
    /// surfaces as a transient error with a retry hint.
    pub async fn ingest_document(
        &self,
        kb_id: Uuid,
        upload: DocumentUpload,
        options: IngestOptions,
    ) -> CoreResult<IngestReceipt> {
        let kb = self.metadata.get_knowledge_base(kb_id).await?;
        self.pipeline.submit(&kb, upload, options).await
    }

    pub async fn get_document_status(&self, document_id: Uuid) -> CoreResult<DocumentStatusResponse> {
        let document = self.metadata.get_document(document_id).await?;
        let stage = self.progress.get(document_id);
        let progress_percent = if document.status.is_terminal() {
            100
        } else {
            self.progress.overall_percent(document_id)
        };
        Ok(DocumentStatusResponse {
            document_id,
            status: document.status,
            progress_percent,
            stage,
            chunk_count: document.chunk_count,
            error_message: document.error_message,
        })
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    pub async fn search(&self, request: SearchRequest) -> CoreResult<SearchResponse> {
        // The kb must exist and be visible before any index is touched.
        self.metadata
            .get_knowledge_base(request.knowledge_base_id)
            .await?;
        self.retrieval.search(&request).await
    }

    /// Convenience form matching the external interface.
    pub async fn search_simple(
        &self,
        kb_id: Uuid,
        query: &str,
        mode: corpora_models::search::SearchMode,
        top_k: usize,
        filter: Option<FilterExpr>,
    ) -> CoreResult<SearchResponse> {
        self.search(SearchRequest {
            knowledge_base_id: kb_id,
            query: query.to_string(),
            mode,
            top_k,
            filter,
            enable_rerank: false,
        })
        .await
    }

    // ------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------

    pub async fn start_conversation(
        &self,
        owner: &str,
        knowledge_base_id: Option<Uuid>,
    ) -> CoreResult<Conversation> {
        if let Some(kb_id) = knowledge_base_id {
            self.metadata.get_knowledge_base(kb_id).await?;
        }
        self.chat.start_conversation(owner, knowledge_base_id).await
    }

    pub async fn send_message(
        &self,
        conversation_id: Uuid,
        content: MessageContent,
        workflow: Option<WorkflowKind>,
    ) -> CoreResult<SendOutcome> {
        self.chat.send_message(conversation_id, content, workflow).await
    }

    pub async fn send_message_streaming(
        &self,
        conversation_id: Uuid,
        content: MessageContent,
        workflow: Option<WorkflowKind>,
    ) -> CoreResult<(Uuid, mpsc::Receiver<StreamEvent>)> {
        self.chat
            .send_message_streaming(conversation_id, content, workflow)
            .await
    }

    pub async fn list_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
        cursor: Option<Uuid>,
    ) -> CoreResult<MessagePage> {
        self.chat.list_messages(conversation_id, limit, cursor).await
    }

    // ------------------------------------------------------------------
    // Workflow observability
    // ------------------------------------------------------------------

    pub fn workflow_execution(&self, execution_id: Uuid) -> Option<WorkflowExecution> {
        self.registry.get(execution_id)
    }

    pub fn workflow_executions(&self) -> Vec<WorkflowExecution> {
        self.registry.list()
    }
}

impl Drop for Services {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

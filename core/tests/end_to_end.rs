//! End-to-end scenarios against hermetic in-memory stores.
//!
//! The full service graph is wired through `Services::with_stores`: memory
//! implementations of the three stores, the deterministic local embedder,
//! the passthrough text parser and a scripted chat model.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use corpora_agents::WorkflowKind;
use corpora_ai::{
    ChatMessage, ChatModel, CompletionOptions, CompletionResult, Embedder, LocalEmbedder,
    Reranker, ScoredIndex, TokenChunk,
};
use corpora_config::CoreConfig;
use corpora_core::Services;
use corpora_ingest::{DocumentUpload, PlainTextParser};
use corpora_models::conversation::{MessageContent, MessageRole, TokenUsage};
use corpora_models::document::{IngestOptions, ProcessingStatus};
use corpora_models::events::StreamEvent;
use corpora_models::graph::EntityType;
use corpora_models::knowledge::{CreateKnowledgeBaseRequest, Visibility};
use corpora_models::search::SearchMode;
use corpora_models::workflow::ExecutionStatus;
use corpora_models::{CoreError, CoreResult};
use corpora_storage::memory::{MemoryGraphStore, MemoryMetadataStore, MemoryVectorStore};
use corpora_storage::{GraphStore, MetadataStore, VectorStore};

/// Streams a canned answer word by word and records whether the upstream
/// request observed a cancellation.
struct ScriptedChat {
    answer: String,
    observed_cancel: Arc<AtomicBool>,
}

impl ScriptedChat {
    fn new(answer: &str) -> Self {
        Self {
            answer: answer.into(),
            observed_cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl ChatModel for ScriptedChat {
    async fn complete(
        &self,
        _messages: &[ChatMessage],
        _options: &CompletionOptions,
    ) -> CoreResult<CompletionResult> {
        Ok(CompletionResult {
            content: self.answer.clone(),
            tool_calls: None,
            usage: Some(TokenUsage {
                prompt_tokens: 64,
                completion_tokens: 16,
            }),
            finish_reason: Some("stop".into()),
        })
    }

    async fn complete_stream(
        &self,
        _messages: &[ChatMessage],
        _options: &CompletionOptions,
        cancel: CancellationToken,
    ) -> CoreResult<mpsc::Receiver<CoreResult<TokenChunk>>> {
        let (tx, rx) = mpsc::channel(8);
        let words: Vec<String> = self.answer.split_whitespace().map(|w| format!("{} ", w)).collect();
        let observed = Arc::clone(&self.observed_cancel);
        tokio::spawn(async move {
            for word in words {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        observed.store(true, Ordering::SeqCst);
                        return;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(25)) => {}
                }
                if tx
                    .send(Ok(TokenChunk {
                        delta: word,
                        ..TokenChunk::default()
                    }))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            let _ = tx
                .send(Ok(TokenChunk {
                    finish_reason: Some("stop".into()),
                    ..TokenChunk::default()
                }))
                .await;
        });
        Ok(rx)
    }
}

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

struct Harness {
    services: Services,
    vectors: Arc<MemoryVectorStore>,
    observed_cancel: Arc<AtomicBool>,
}

fn harness_with(reranker: Option<Arc<dyn Reranker>>) -> Harness {
    let mut config = CoreConfig::default();
    config.model.embedding_dim = 128;
    config.ingest.caption_images = false;

    let metadata = Arc::new(MemoryMetadataStore::new());
    let vectors = Arc::new(MemoryVectorStore::new());
    let graph = Arc::new(MemoryGraphStore::new());
    let embedder: Arc<dyn Embedder> = Arc::new(LocalEmbedder::with_dimension(128));
    let chat = Arc::new(ScriptedChat::new(
        "The capital of France is Paris [source 1].",
    ));
    let observed_cancel = Arc::clone(&chat.observed_cancel);

    let vector_store: Arc<dyn VectorStore> = vectors.clone() as Arc<dyn VectorStore>;
    let services = Services::with_stores(
        config,
        metadata,
        vector_store,
        graph,
        embedder,
        reranker,
        chat,
        None,
        None,
        Arc::new(PlainTextParser),
    )
    .expect("service wiring");

    Harness {
        services,
        vectors,
        observed_cancel,
    }
}

fn harness() -> Harness {
    harness_with(None)
}

async fn create_kb(services: &Services, name: &str) -> Uuid {
    services
        .create_knowledge_base(CreateKnowledgeBaseRequest {
            name: name.into(),
            owner: "tester".into(),
            visibility: Visibility::Private,
            allowed_file_types: vec![],
            size_limit_bytes: None,
            config: None,
        })
        .await
        .expect("kb created")
        .id
}

async fn ingest_and_wait(services: &Services, kb_id: Uuid, filename: &str, text: &str) -> Uuid {
    let receipt = services
        .ingest_document(
            kb_id,
            DocumentUpload {
                filename: filename.into(),
                content_type: "text/plain".into(),
                bytes: text.as_bytes().to_vec(),
            },
            IngestOptions::default(),
        )
        .await
        .expect("ingest accepted");

    for _ in 0..200 {
        let status = services
            .get_document_status(receipt.document_id)
            .await
            .expect("status readable");
        if status.status.is_terminal() {
            assert_eq!(status.status, ProcessingStatus::Completed, "{:?}", status);
            return receipt.document_id;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("document never completed");
}

// Scenario 1: ingest then search.
#[tokio::test]
async fn ingest_then_search_returns_the_answer_chunk() {
    let h = harness();
    let kb_id = create_kb(&h.services, "demo").await;
    ingest_and_wait(
        &h.services,
        kb_id,
        "capitals.txt",
        "The capital of France is Paris. The capital of Germany is Berlin.",
    )
    .await;

    let response = h
        .services
        .search_simple(
            kb_id,
            "What is the capital of France?",
            SearchMode::Semantic,
            1,
            None,
        )
        .await
        .unwrap();

    assert_eq!(response.results.len(), 1);
    assert!(response.results[0].content.contains("Paris"));
    assert!(response.results[0].score > 0.8, "score {}", response.results[0].score);
}

// Round-trip law: embedding a stored chunk and searching for its exact text
// returns it with a near-perfect score.
#[tokio::test]
async fn exact_text_search_scores_near_one() {
    let h = harness();
    let kb_id = create_kb(&h.services, "demo").await;
    let text = "Reciprocal rank fusion sums inverse ranks across lists.";
    ingest_and_wait(&h.services, kb_id, "rrf.txt", text).await;

    let response = h
        .services
        .search_simple(kb_id, text, SearchMode::Semantic, 1, None)
        .await
        .unwrap();
    assert!(response.results[0].score >= 0.99);
}

// Scenario 2: dedup on re-ingest.
#[tokio::test]
async fn reingesting_identical_bytes_changes_nothing() {
    let h = harness();
    let kb_id = create_kb(&h.services, "demo").await;
    let text = "Some stable document content for the dedup check.";
    let first_doc = ingest_and_wait(&h.services, kb_id, "stable.txt", text).await;
    let chunk_count = h
        .services
        .get_document_status(first_doc)
        .await
        .unwrap()
        .chunk_count;
    let vectors_before = h.vectors.vector_count(kb_id);

    let second = h
        .services
        .ingest_document(
            kb_id,
            DocumentUpload {
                filename: "stable.txt".into(),
                content_type: "text/plain".into(),
                bytes: text.as_bytes().to_vec(),
            },
            IngestOptions::default(),
        )
        .await
        .unwrap();

    assert!(second.deduplicated);
    assert_eq!(second.document_id, first_doc);
    let status = h.services.get_document_status(first_doc).await.unwrap();
    assert_eq!(status.chunk_count, chunk_count);
    assert_eq!(h.vectors.vector_count(kb_id), vectors_before);
}

// Scenario 3: hybrid retrieval fuses lexical and semantic evidence.
#[tokio::test]
async fn hybrid_search_finds_both_documents() {
    let h = harness();
    let kb_id = create_kb(&h.services, "demo").await;
    ingest_and_wait(&h.services, kb_id, "d1.txt", "Paris is a city").await;
    ingest_and_wait(&h.services, kb_id, "d2.txt", "The capital of France").await;

    let response = h
        .services
        .search_simple(kb_id, "capital of France Paris", SearchMode::Hybrid, 2, None)
        .await
        .unwrap();

    assert_eq!(response.results.len(), 2);
    let contents: Vec<&str> = response.results.iter().map(|r| r.content.as_str()).collect();
    assert!(contents.iter().any(|c| c.contains("Paris is a city")));
    assert!(contents.iter().any(|c| c.contains("capital of France")));
}

// Scenario 4: disconnect mid-stream cancels the workflow and aborts the LLM.
#[tokio::test]
async fn disconnect_cancels_workflow_within_deadline() {
    let h = harness();
    let kb_id = create_kb(&h.services, "demo").await;
    ingest_and_wait(
        &h.services,
        kb_id,
        "capitals.txt",
        "The capital of France is Paris.",
    )
    .await;

    let conversation = h
        .services
        .start_conversation("tester", Some(kb_id))
        .await
        .unwrap();
    let (_message_id, mut rx) = h
        .services
        .send_message_streaming(
            conversation.id,
            MessageContent::text("Tell me about the capital of France"),
            Some(WorkflowKind::ComplexResearch),
        )
        .await
        .unwrap();

    // First token out, then the client disconnects.
    loop {
        match rx.recv().await {
            Some(StreamEvent::Text { .. }) => break,
            Some(_) => continue,
            None => panic!("stream ended before any text"),
        }
    }
    drop(rx);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        h.observed_cancel.load(Ordering::SeqCst),
        "the upstream LLM request was not aborted"
    );
    let cancelled = h
        .services
        .workflow_executions()
        .into_iter()
        .any(|e| e.status == ExecutionStatus::Cancelled);
    assert!(cancelled, "no execution transitioned to cancelled");

    // The partial assistant message carries the cancelled marker.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let page = h
        .services
        .list_messages(conversation.id, 10, None)
        .await
        .unwrap();
    let assistant = page
        .messages
        .iter()
        .find(|m| m.role == MessageRole::Assistant)
        .expect("partial assistant message persisted");
    assert!(assistant.cancelled);
}

// Scenario 5: entity extraction and one-hop traversal.
#[tokio::test]
async fn graph_links_organization_to_founder() {
    let h = harness();
    let kb_id = create_kb(&h.services, "demo").await;
    ingest_and_wait(
        &h.services,
        kb_id,
        "apple.txt",
        "Apple Inc. was founded by Steve Jobs.",
    )
    .await;

    let entities = h
        .services
        .graph()
        .find_entities(kb_id, "Apple", &[], 10)
        .await
        .unwrap();
    assert!(entities
        .iter()
        .any(|e| e.entity_type == EntityType::Organization));

    let paths = h
        .services
        .graph()
        .traverse(kb_id, "Apple Inc.", 1, &[], 10)
        .await
        .unwrap();
    assert!(
        paths.iter().any(|p| p.terminal().name == "Steve Jobs"),
        "no path from Apple Inc. to Steve Jobs"
    );
}

// Scenario 6: rerank failure degrades gracefully.
#[tokio::test]
async fn rerank_failure_keeps_fused_results() {
    let h = harness_with(Some(Arc::new(FailingReranker)));
    let kb_id = create_kb(&h.services, "demo").await;
    ingest_and_wait(&h.services, kb_id, "d1.txt", "Paris is a city").await;
    ingest_and_wait(&h.services, kb_id, "d2.txt", "The capital of France").await;

    let response = h
        .services
        .search(corpora_models::search::SearchRequest {
            knowledge_base_id: kb_id,
            query: "capital of France".into(),
            mode: SearchMode::Hybrid,
            top_k: 2,
            filter: None,
            enable_rerank: true,
        })
        .await
        .unwrap();

    assert!(response.metadata.rerank_failed);
    assert!(!response.results.is_empty());
}

// Invariants: no orphan vectors, dense ordinals, queryable only when completed.
#[tokio::test]
async fn indexes_stay_consistent_after_ingest() {
    let h = harness();
    let kb_id = create_kb(&h.services, "demo").await;
    let doc_id = ingest_and_wait(
        &h.services,
        kb_id,
        "long.txt",
        &(0..80)
            .map(|i| format!("Sentence number {} talks about retrieval quality. ", i))
            .collect::<String>(),
    )
    .await;

    let chunks = h.services.metadata().chunks_by_document(doc_id).await.unwrap();
    assert!(!chunks.is_empty());
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.chunk_index, i as i32, "ordinals must be dense from 0");
    }
    // One vector per chunk, none orphaned.
    assert_eq!(h.vectors.vector_count(kb_id), chunks.len());

    let status = h.services.get_document_status(doc_id).await.unwrap();
    assert_eq!(status.chunk_count as usize, chunks.len());
}

// Deleting a knowledge base cascades to all indexes.
#[tokio::test]
async fn knowledge_base_delete_cascades() {
    let h = harness();
    let kb_id = create_kb(&h.services, "demo").await;
    ingest_and_wait(
        &h.services,
        kb_id,
        "apple.txt",
        "Apple Inc. was founded by Steve Jobs.",
    )
    .await;
    assert!(h.vectors.vector_count(kb_id) > 0);

    h.services.delete_knowledge_base(kb_id).await.unwrap();
    assert_eq!(h.vectors.vector_count(kb_id), 0);
    assert_eq!(h.services.graph().entity_count(kb_id).await.unwrap(), 0);
    let err = h
        .services
        .search_simple(kb_id, "anything", SearchMode::Semantic, 5, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

// Full conversational round trip with streaming and statistics.
#[tokio::test]
async fn conversation_round_trip_with_stats() {
    let h = harness();
    let kb_id = create_kb(&h.services, "demo").await;
    ingest_and_wait(
        &h.services,
        kb_id,
        "capitals.txt",
        "The capital of France is Paris.",
    )
    .await;

    let conversation = h
        .services
        .start_conversation("tester", Some(kb_id))
        .await
        .unwrap();
    let (_id, mut rx) = h
        .services
        .send_message_streaming(
            conversation.id,
            MessageContent::text("What is the capital of France?"),
            Some(WorkflowKind::SimpleQa),
        )
        .await
        .unwrap();

    let mut text = String::new();
    while let Some(event) = rx.recv().await {
        let terminal = event.is_terminal();
        if let StreamEvent::Text { delta, .. } = &event {
            text.push_str(delta);
        }
        if terminal {
            break;
        }
    }
    assert!(text.contains("Paris"));

    let stats = h.services.knowledge_base_stats(kb_id).await.unwrap();
    assert_eq!(stats.document_count, 1);
    assert_eq!(stats.completed_documents, 1);
    assert!(stats.chunk_count > 0);
    assert!(stats.entity_count > 0);
}

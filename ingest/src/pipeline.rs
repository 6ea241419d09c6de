//! The staged ingestion pipeline.
//!
//! validate -> parse -> chunk -> embed -> index -> finalize, with durable
//! status transitions on the document row. Stage ordering inside one
//! document is strict; documents run concurrently up to the worker limit.
//! Transient stage failures retry with backoff and collapse to permanent
//! after the retry budget; the document then lands in `failed` with the
//! error recorded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use corpora_ai::{sparse, Embedder, VisionModel};
use corpora_config::CoreConfig;
use corpora_models::chunk::{Chunk, ChunkMetadata, ChunkType, VectorRecord};
use corpora_models::document::{
    Document, IngestOptions, IngestReceipt, IngestStage, ProcessingStatus,
};
use corpora_models::knowledge::KnowledgeBase;
use corpora_models::search::FilterExpr;
use corpora_models::{CoreError, CoreResult};
use corpora_storage::{GraphStore, MetadataStore, VectorStore};

use crate::chunker::{chunk_text, ChunkSpan, ChunkerSettings};
use crate::extract::extract_from_chunk;
use crate::parser::{DocumentParser, ParsedDocument, PlainTextParser};
use crate::progress::ProgressRegistry;
use crate::validate::{content_hash, validate_upload};

pub struct DocumentUpload {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

pub struct IngestPipeline {
    metadata: Arc<dyn MetadataStore>,
    vectors: Arc<dyn VectorStore>,
    graph: Arc<dyn GraphStore>,
    embedder: Arc<dyn Embedder>,
    vision: Option<Arc<dyn VisionModel>>,
    parser: Arc<dyn DocumentParser>,
    chunking: ChunkerSettings,
    graph_enabled: bool,
    caption_images: bool,
    stage_retries: u32,
    embedding_batch: usize,
    embedding_dim: usize,
    progress: Arc<ProgressRegistry>,
    document_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    workers: Arc<Semaphore>,
    active_jobs: Arc<AtomicUsize>,
    queue_high_water: usize,
    root_token: CancellationToken,
}

impl IngestPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &CoreConfig,
        metadata: Arc<dyn MetadataStore>,
        vectors: Arc<dyn VectorStore>,
        graph: Arc<dyn GraphStore>,
        embedder: Arc<dyn Embedder>,
        vision: Option<Arc<dyn VisionModel>>,
        parser: Arc<dyn DocumentParser>,
        root_token: CancellationToken,
    ) -> Self {
        Self {
            metadata,
            vectors,
            graph,
            embedder,
            vision,
            parser,
            chunking: ChunkerSettings::from(&config.chunking),
            graph_enabled: config.ingest.graph_enabled,
            caption_images: config.ingest.caption_images,
            stage_retries: config.ingest.stage_retries,
            embedding_batch: config.model.embedding_batch,
            embedding_dim: config.model.embedding_dim,
            progress: Arc::new(ProgressRegistry::new()),
            document_locks: DashMap::new(),
            workers: Arc::new(Semaphore::new(config.concurrency.max_ingest_workers.max(1))),
            active_jobs: Arc::new(AtomicUsize::new(0)),
            queue_high_water: config.concurrency.ingest_queue_high_water,
            root_token,
        }
    }

    pub fn progress(&self) -> Arc<ProgressRegistry> {
        Arc::clone(&self.progress)
    }

    fn document_lock(&self, document_id: Uuid) -> Arc<Mutex<()>> {
        self.document_locks
            .entry(document_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Admit, deduplicate and register an upload; processing continues on a
    /// background task owned by the pipeline's root token.
    pub async fn submit(
        self: &Arc<Self>,
        kb: &KnowledgeBase,
        upload: DocumentUpload,
        options: IngestOptions,
    ) -> CoreResult<IngestReceipt> {
        // Admission control: reject rather than queue unboundedly.
        if self.active_jobs.load(Ordering::SeqCst) >= self.queue_high_water {
            return Err(CoreError::transient_after(
                "ingest queues saturated",
                Duration::from_secs(1),
            ));
        }

        validate_upload(kb, &upload.filename, &upload.content_type, &upload.bytes)?;
        let hash = content_hash(&upload.bytes);

        // Identical bytes: no-op before the parser ever runs.
        if let Some(existing) = self.metadata.find_document_by_hash(kb.id, &hash).await? {
            info!(document_id = %existing.id, "re-ingest of identical content, skipping");
            return Ok(IngestReceipt {
                document_id: existing.id,
                task_id: Uuid::new_v4(),
                deduplicated: true,
            });
        }

        // Same filename, different content: the document keeps its identity
        // and its chunks are replaced wholesale.
        let now = Utc::now();
        let (document, replace) = match self
            .metadata
            .find_document_by_filename(kb.id, &upload.filename)
            .await?
        {
            Some(old) => {
                self.metadata
                    .reset_document(old.id, &upload.content_type, upload.bytes.len() as i64, &hash)
                    .await?;
                info!(document_id = %old.id, "re-ingesting changed content in place");
                let document = Document {
                    id: old.id,
                    knowledge_base_id: kb.id,
                    filename: upload.filename.clone(),
                    content_type: upload.content_type.clone(),
                    byte_length: upload.bytes.len() as i64,
                    content_hash: hash,
                    status: ProcessingStatus::Pending,
                    error_message: None,
                    chunk_count: old.chunk_count,
                    is_deleted: false,
                    deleted_at: None,
                    created_at: old.created_at,
                    updated_at: now,
                };
                (document, true)
            }
            None => {
                let document = Document {
                    id: Uuid::new_v4(),
                    knowledge_base_id: kb.id,
                    filename: upload.filename.clone(),
                    content_type: upload.content_type.clone(),
                    byte_length: upload.bytes.len() as i64,
                    content_hash: hash,
                    status: ProcessingStatus::Pending,
                    error_message: None,
                    chunk_count: 0,
                    is_deleted: false,
                    deleted_at: None,
                    created_at: now,
                    updated_at: now,
                };
                self.metadata.insert_document(&document).await?;
                (document, false)
            }
        };
        self.vectors
            .create_collection(kb.id, self.embedding_dim)
            .await?;

        let task_id = Uuid::new_v4();
        let pipeline = Arc::clone(self);
        let cancel = self.root_token.child_token();
        self.active_jobs.fetch_add(1, Ordering::SeqCst);
        let document_id = document.id;
        let skip_graph = options.skip_graph;
        let chunking = self.chunking_for(&options);

        tokio::spawn(async move {
            let result = pipeline
                .process(document, upload.bytes, chunking, skip_graph, replace, cancel)
                .await;
            pipeline.active_jobs.fetch_sub(1, Ordering::SeqCst);
            if let Err(e) = result {
                error!(document_id = %document_id, "ingest failed: {}", e);
            }
        });

        Ok(IngestReceipt {
            document_id,
            task_id,
            deduplicated: false,
        })
    }

    fn chunking_for(&self, options: &IngestOptions) -> ChunkerSettings {
        let mut settings = self.chunking;
        if let Some(size) = options.chunk_size {
            settings.chunk_size = size;
        }
        if let Some(overlap) = options.chunk_overlap {
            settings.chunk_overlap = overlap;
        }
        settings
    }

    /// Retry a stage on transient errors, then collapse to permanent.
    async fn run_stage<T, F, Fut>(&self, stage: IngestStage, operation: F) -> CoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = CoreResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.stage_retries => {
                    let delay = Duration::from_millis(200 * (1 << attempt.min(5)));
                    warn!(stage = stage.as_str(), attempt, "stage retry: {}", err);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) if err.is_transient() => return Err(err.into_permanent()),
                Err(err) => return Err(err),
            }
        }
    }

    async fn process(
        self: &Arc<Self>,
        document: Document,
        bytes: Vec<u8>,
        chunking: ChunkerSettings,
        skip_graph: bool,
        replace: bool,
        cancel: CancellationToken,
    ) -> CoreResult<()> {
        let document_id = document.id;
        let lock = self.document_lock(document_id);
        let _guard = lock.lock().await;

        let _worker = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CoreError::Cancelled("pipeline shut down".into()))?;

        let outcome = self
            .run_stages(&document, bytes, chunking, skip_graph, replace, &cancel)
            .await;

        match &outcome {
            Ok(chunk_count) => {
                self.metadata
                    .update_document_status(
                        document_id,
                        ProcessingStatus::Completed,
                        None,
                        Some(*chunk_count as i32),
                    )
                    .await?;
                info!(document_id = %document_id, chunks = chunk_count, "document ingested");
            }
            Err(err) => {
                let status = ProcessingStatus::Failed;
                self.metadata
                    .update_document_status(document_id, status, Some(&err.to_string()), None)
                    .await?;
            }
        }
        self.progress.clear(document_id);
        self.document_locks.remove(&document_id);
        outcome.map(|_| ())
    }

    async fn run_stages(
        self: &Arc<Self>,
        document: &Document,
        bytes: Vec<u8>,
        chunking: ChunkerSettings,
        skip_graph: bool,
        replace: bool,
        cancel: &CancellationToken,
    ) -> CoreResult<usize> {
        let document_id = document.id;
        let kb_id = document.knowledge_base_id;

        self.metadata
            .update_document_status(document_id, ProcessingStatus::Processing, None, None)
            .await?;
        self.progress.update(document_id, IngestStage::Validate, 100);

        // Parse. Long-running for large PDFs; cancellable between stages.
        self.progress.update(document_id, IngestStage::Parse, 0);
        let content_type = document.content_type.clone();
        let parsed: ParsedDocument = self
            .run_stage(IngestStage::Parse, || {
                let bytes = &bytes;
                let content_type = content_type.clone();
                async move {
                    if cancel.is_cancelled() {
                        return Err(CoreError::Cancelled("ingest cancelled".into()));
                    }
                    if PlainTextParser::handles(&content_type) {
                        PlainTextParser.parse(bytes, &content_type).await
                    } else {
                        self.parser.parse(bytes, &content_type).await
                    }
                }
            })
            .await?;
        self.progress.update(document_id, IngestStage::Parse, 100);

        // Chunk on the blocking pool; splitting is CPU-bound.
        self.progress.update(document_id, IngestStage::Chunk, 0);
        let markdown = parsed.markdown.clone();
        let spans = tokio::task::spawn_blocking(move || chunk_text(&markdown, &chunking))
            .await
            .map_err(|e| CoreError::dependency("runtime", e.to_string()))?;
        if spans.is_empty() {
            return Err(CoreError::Permanent("document produced no content".into()));
        }

        let mut chunks = self.build_chunks(document, &spans);
        self.append_image_captions(document, &parsed, &mut chunks, cancel)
            .await;
        self.progress.update(document_id, IngestStage::Chunk, 100);

        // Embed in batches; order ties vectors to chunks.
        self.progress.update(document_id, IngestStage::Embed, 0);
        let mut dense_vectors: Vec<Vec<f32>> = Vec::with_capacity(chunks.len());
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let total_batches = texts.len().div_ceil(self.embedding_batch);
        for (batch_index, batch) in texts.chunks(self.embedding_batch).enumerate() {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled("ingest cancelled".into()));
            }
            let vectors = self
                .run_stage(IngestStage::Embed, || self.embedder.embed_batch(batch))
                .await?;
            dense_vectors.extend(vectors);
            let percent = ((batch_index + 1) * 100 / total_batches.max(1)) as u8;
            self.progress.update(document_id, IngestStage::Embed, percent);
        }

        // Index: metadata first so no vector ever lacks a parent chunk. A
        // re-ingest swaps the document's chunks transactionally and cascades
        // the removed ids to the vector and graph indexes before the fresh
        // rows land there.
        self.progress.update(document_id, IngestStage::Index, 0);
        if replace {
            let removed = self
                .run_stage(IngestStage::Index, || {
                    self.metadata.replace_chunks(document_id, &chunks)
                })
                .await?;
            self.run_stage(IngestStage::Index, || async {
                if !removed.is_empty() {
                    self.graph.remove_chunk_refs(kb_id, &removed).await?;
                }
                self.vectors
                    .delete_by_filter(
                        kb_id,
                        &FilterExpr::eq(
                            "document_id",
                            serde_json::json!(document_id.to_string()),
                        ),
                    )
                    .await
            })
            .await?;
        } else {
            self.run_stage(IngestStage::Index, || self.metadata.insert_chunks(&chunks))
                .await?;
        }

        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(dense_vectors.iter())
            .map(|(chunk, dense)| VectorRecord {
                chunk_id: chunk.id,
                document_id: chunk.document_id,
                knowledge_base_id: chunk.knowledge_base_id,
                dense: dense.clone(),
                sparse: Some(sparse::encode(&chunk.content)),
                keywords: sparse::keywords(&chunk.content, 16),
                content: chunk.content.clone(),
                chunk_type: chunk.chunk_type,
                chunk_index: chunk.chunk_index,
            })
            .collect();
        self.run_stage(IngestStage::Index, || {
            self.vectors.upsert_batch(kb_id, &records)
        })
        .await?;
        self.progress.update(document_id, IngestStage::Index, 60);

        if self.graph_enabled && !skip_graph {
            self.index_graph(kb_id, &chunks).await;
        }
        self.progress.update(document_id, IngestStage::Index, 100);

        self.progress.update(document_id, IngestStage::Finalize, 100);
        Ok(chunks.len())
    }

    fn build_chunks(&self, document: &Document, spans: &[ChunkSpan]) -> Vec<Chunk> {
        spans
            .iter()
            .enumerate()
            .map(|(index, span)| {
                let index = index as i32;
                Chunk {
                    id: Chunk::derive_id(&document.id, index),
                    document_id: document.id,
                    knowledge_base_id: document.knowledge_base_id,
                    chunk_index: index,
                    start_offset: span.start as u32,
                    end_offset: span.end as u32,
                    content: span.content.clone(),
                    content_hash: content_hash(span.content.as_bytes()),
                    chunk_type: span.chunk_type,
                    metadata: ChunkMetadata::default(),
                }
            })
            .collect()
    }

    /// Caption extracted images through the vision client and append them as
    /// image-caption chunks. Caption failures degrade to skipping the image.
    async fn append_image_captions(
        &self,
        document: &Document,
        parsed: &ParsedDocument,
        chunks: &mut Vec<Chunk>,
        cancel: &CancellationToken,
    ) {
        let Some(vision) = (self.caption_images).then_some(self.vision.as_ref()).flatten() else {
            return;
        };
        for image in &parsed.images {
            if cancel.is_cancelled() {
                return;
            }
            match vision
                .describe_image(&image.bytes, "Describe this image concisely for retrieval.")
                .await
            {
                Ok(caption) if !caption.trim().is_empty() => {
                    let index = chunks.len() as i32;
                    let content = caption.trim().to_string();
                    chunks.push(Chunk {
                        id: Chunk::derive_id(&document.id, index),
                        document_id: document.id,
                        knowledge_base_id: document.knowledge_base_id,
                        chunk_index: index,
                        start_offset: 0,
                        end_offset: 0,
                        content_hash: content_hash(content.as_bytes()),
                        content,
                        chunk_type: ChunkType::ImageCaption,
                        metadata: ChunkMetadata {
                            section_path: Vec::new(),
                            page_number: image.page_number,
                            extra: serde_json::json!({ "image_index": image.index }),
                        },
                    });
                }
                Ok(_) => {}
                Err(e) => warn!(image = image.index, "image caption failed, skipping: {}", e),
            }
        }
    }

    /// Entities before relations; a failed relation never fails the document.
    async fn index_graph(&self, kb_id: Uuid, chunks: &[Chunk]) {
        let mut entity_ids: HashMap<String, Uuid> = HashMap::new();

        for chunk in chunks {
            let extraction = extract_from_chunk(chunk);

            for entity in &extraction.entities {
                match self.graph.upsert_entity(entity).await {
                    Ok(canonical) => {
                        entity_ids.insert(entity.name.to_lowercase(), canonical);
                    }
                    Err(e) => warn!(entity = %entity.name, "entity upsert failed: {}", e),
                }
            }

            for relation in &extraction.relations {
                let (Some(&source), Some(&target)) = (
                    entity_ids.get(&relation.source_name.to_lowercase()),
                    entity_ids.get(&relation.target_name.to_lowercase()),
                ) else {
                    continue;
                };
                let result = self
                    .graph
                    .upsert_relation(
                        kb_id,
                        &corpora_models::graph::Relation {
                            source,
                            target,
                            relation_type: relation.relation_type,
                            confidence: relation.confidence,
                            source_chunk_id: relation.source_chunk_id,
                        },
                    )
                    .await;
                if let Err(e) = result {
                    warn!("relation upsert failed: {}", e);
                }
            }
        }
    }

    /// Queue depths for admission observers.
    pub fn active_jobs(&self) -> usize {
        self.active_jobs.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corpora_ai::LocalEmbedder;
    use corpora_config::CoreConfig;
    use corpora_models::knowledge::Visibility;
    use corpora_storage::memory::{MemoryGraphStore, MemoryMetadataStore, MemoryVectorStore};

    fn test_kb() -> KnowledgeBase {
        KnowledgeBase {
            id: Uuid::new_v4(),
            name: "demo".into(),
            owner: "tester".into(),
            visibility: Visibility::Private,
            allowed_file_types: vec![],
            size_limit_bytes: KnowledgeBase::DEFAULT_SIZE_LIMIT,
            config: serde_json::json!({}),
            is_deleted: false,
            deleted_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    struct Fixture {
        pipeline: Arc<IngestPipeline>,
        metadata: Arc<MemoryMetadataStore>,
        vectors: Arc<MemoryVectorStore>,
        graph: Arc<MemoryGraphStore>,
    }

    fn fixture() -> Fixture {
        let mut config = CoreConfig::default();
        config.model.embedding_dim = 64;
        config.ingest.caption_images = false;
        let metadata = Arc::new(MemoryMetadataStore::new());
        let vectors = Arc::new(MemoryVectorStore::new());
        let graph = Arc::new(MemoryGraphStore::new());
        let pipeline = Arc::new(IngestPipeline::new(
            &config,
            metadata.clone(),
            vectors.clone(),
            graph.clone(),
            Arc::new(LocalEmbedder::with_dimension(64)),
            None,
            Arc::new(PlainTextParser),
            CancellationToken::new(),
        ));
        Fixture {
            pipeline,
            metadata,
            vectors,
            graph,
        }
    }

    async fn wait_for_terminal(metadata: &MemoryMetadataStore, document_id: Uuid) -> Document {
        for _ in 0..100 {
            let doc = metadata.get_document(document_id).await.unwrap();
            if doc.status.is_terminal() {
                return doc;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("document never reached a terminal status");
    }

    fn upload(filename: &str, text: &str) -> DocumentUpload {
        DocumentUpload {
            filename: filename.into(),
            content_type: "text/plain".into(),
            bytes: text.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn ingest_completes_and_indexes() {
        let f = fixture();
        let kb = test_kb();
        f.metadata.create_knowledge_base(&kb).await.unwrap();

        let receipt = f
            .pipeline
            .submit(
                &kb,
                upload(
                    "capitals.txt",
                    "The capital of France is Paris. The capital of Germany is Berlin.",
                ),
                IngestOptions::default(),
            )
            .await
            .unwrap();
        assert!(!receipt.deduplicated);

        let doc = wait_for_terminal(&f.metadata, receipt.document_id).await;
        assert_eq!(doc.status, ProcessingStatus::Completed);
        assert!(doc.chunk_count > 0);

        // Chunks have dense ordinals from 0 and vectors exist for each.
        let chunks = f.metadata.chunks_by_document(doc.id).await.unwrap();
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i as i32);
        }
        assert_eq!(f.vectors.vector_count(kb.id), chunks.len());

        // Graph extraction found the locations.
        assert!(f.graph.entity_count(kb.id).await.unwrap() > 0);
    }

    #[tokio::test]
    async fn identical_reingest_is_a_noop() {
        let f = fixture();
        let kb = test_kb();
        f.metadata.create_knowledge_base(&kb).await.unwrap();
        let text = "Stable content that never changes.";

        let first = f
            .pipeline
            .submit(&kb, upload("stable.txt", text), IngestOptions::default())
            .await
            .unwrap();
        let doc = wait_for_terminal(&f.metadata, first.document_id).await;
        let vectors_before = f.vectors.vector_count(kb.id);

        let second = f
            .pipeline
            .submit(&kb, upload("stable.txt", text), IngestOptions::default())
            .await
            .unwrap();
        assert!(second.deduplicated);
        assert_eq!(second.document_id, first.document_id);

        let after = f.metadata.get_document(first.document_id).await.unwrap();
        assert_eq!(after.chunk_count, doc.chunk_count);
        assert_eq!(f.vectors.vector_count(kb.id), vectors_before);
    }

    #[tokio::test]
    async fn changed_content_replaces_chunks_in_place() {
        let f = fixture();
        let kb = test_kb();
        f.metadata.create_knowledge_base(&kb).await.unwrap();

        let first = f
            .pipeline
            .submit(&kb, upload("doc.txt", "Original body."), IngestOptions::default())
            .await
            .unwrap();
        let original = wait_for_terminal(&f.metadata, first.document_id).await;

        let second = f
            .pipeline
            .submit(&kb, upload("doc.txt", "Replacement body."), IngestOptions::default())
            .await
            .unwrap();
        // Same filename keeps the same document identity.
        assert_eq!(second.document_id, first.document_id);
        assert!(!second.deduplicated);
        let replaced = wait_for_terminal(&f.metadata, second.document_id).await;
        assert_eq!(replaced.status, ProcessingStatus::Completed);
        assert_ne!(replaced.content_hash, original.content_hash);
        assert_eq!(replaced.created_at, original.created_at);

        // Only the replacement's chunks and vectors remain.
        let chunks = f.metadata.chunks_by_document(first.document_id).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].content.contains("Replacement"));
        assert_eq!(f.vectors.vector_count(kb.id), chunks.len());
    }

    #[tokio::test]
    async fn invalid_content_type_rejects_upfront() {
        let f = fixture();
        let mut kb = test_kb();
        kb.allowed_file_types = vec!["text/plain".into()];
        f.metadata.create_knowledge_base(&kb).await.unwrap();

        let err = f
            .pipeline
            .submit(
                &kb,
                DocumentUpload {
                    filename: "payload.bin".into(),
                    content_type: "application/octet-stream".into(),
                    bytes: vec![0u8; 16],
                },
                IngestOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "permanent");
    }

    #[tokio::test]
    async fn binary_garbage_in_text_fails_the_document() {
        let f = fixture();
        let kb = test_kb();
        f.metadata.create_knowledge_base(&kb).await.unwrap();

        let receipt = f
            .pipeline
            .submit(
                &kb,
                DocumentUpload {
                    filename: "broken.txt".into(),
                    content_type: "text/plain".into(),
                    bytes: vec![0xFF, 0xFE, 0x00, 0x01],
                },
                IngestOptions::default(),
            )
            .await
            .unwrap();

        let doc = wait_for_terminal(&f.metadata, receipt.document_id).await;
        assert_eq!(doc.status, ProcessingStatus::Failed);
        assert!(doc.error_message.is_some());
    }
}

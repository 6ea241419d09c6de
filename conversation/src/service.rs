//! The send-message protocol: persist, contextualize, orchestrate, stream,
//! finalize.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use corpora_agents::{recommend_workflow, WorkflowEngine, WorkflowInput, WorkflowKind};
use corpora_ai::{ChatMessage, VisionModel};
use corpora_models::conversation::{
    Conversation, ImageRef, Message, MessageContent, MessagePage, MessageRole, TokenUsage,
};
use corpora_models::events::StreamEvent;
use corpora_models::search::RetrievedChunk;
use corpora_models::{CoreError, CoreResult};
use corpora_storage::MetadataStore;

use crate::session::SessionManager;
use crate::stream::EventEmitter;

const TITLE_MAX_CHARS: usize = 64;

/// Resolves externally stored attachments to bytes for captioning.
#[async_trait]
pub trait BlobFetcher: Send + Sync {
    async fn fetch(&self, image: &ImageRef) -> CoreResult<Vec<u8>>;
}

/// Result of a non-streaming send.
#[derive(Debug)]
pub struct SendOutcome {
    pub message: Message,
    pub sources: Vec<RetrievedChunk>,
    pub confidence: f32,
    pub workflow: WorkflowKind,
    pub degraded: bool,
}

pub struct ChatService {
    metadata: Arc<dyn MetadataStore>,
    engine: Arc<WorkflowEngine>,
    vision: Option<Arc<dyn VisionModel>>,
    blobs: Option<Arc<dyn BlobFetcher>>,
    sessions: Arc<SessionManager>,
    default_top_k: usize,
    root_token: CancellationToken,
}

impl ChatService {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        engine: Arc<WorkflowEngine>,
        vision: Option<Arc<dyn VisionModel>>,
        blobs: Option<Arc<dyn BlobFetcher>>,
        sessions: Arc<SessionManager>,
        default_top_k: usize,
        root_token: CancellationToken,
    ) -> Self {
        Self {
            metadata,
            engine,
            vision,
            blobs,
            sessions,
            default_top_k,
            root_token,
        }
    }

    pub async fn start_conversation(
        &self,
        owner: &str,
        knowledge_base_id: Option<Uuid>,
    ) -> CoreResult<Conversation> {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            owner: owner.to_string(),
            knowledge_base_id,
            title: None,
            created_at: now,
            last_activity_at: now,
        };
        self.metadata.create_conversation(&conversation).await?;
        info!(conversation_id = %conversation.id, "conversation started");
        Ok(conversation)
    }

    pub async fn list_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
        cursor: Option<Uuid>,
    ) -> CoreResult<MessagePage> {
        self.metadata
            .list_messages(conversation_id, limit, cursor)
            .await
    }

    /// Persist the user turn, pick the workflow, assemble prompt context.
    async fn prepare(
        &self,
        conversation_id: Uuid,
        content: MessageContent,
        workflow: Option<WorkflowKind>,
    ) -> CoreResult<(Conversation, Message, Vec<ChatMessage>, WorkflowKind)> {
        if content.text.trim().is_empty() && content.images.is_empty() {
            return Err(CoreError::InvalidInput("message is empty".into()));
        }
        let conversation = self.metadata.get_conversation(conversation_id).await?;

        let user_message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            role: MessageRole::User,
            content,
            parent_message_id: None,
            usage: None,
            cancelled: false,
            created_at: Utc::now(),
        };
        self.metadata.insert_message(&user_message).await?;

        // First user turn names the conversation.
        let title: String = user_message.content.text.chars().take(TITLE_MAX_CHARS).collect();
        self.metadata
            .touch_conversation(conversation_id, (!title.is_empty()).then_some(title.as_str()))
            .await?;

        let session = self.sessions.session(
            conversation_id,
            &conversation.owner,
            conversation.knowledge_base_id,
        );
        if session.lock().await.context().next().is_none() {
            let history = self
                .metadata
                .recent_messages(conversation_id, self.sessions_window())
                .await?;
            self.sessions.seed(&session, history).await;
        } else {
            self.sessions.remember(&session, user_message.clone()).await;
        }

        let history = {
            let guard = session.lock().await;
            let mut prompt_history = Vec::new();
            for message in guard.context() {
                // The in-flight user turn goes into the prompt as the query,
                // not as history.
                if message.id == user_message.id {
                    continue;
                }
                prompt_history.push(self.to_chat_message(message).await);
            }
            prompt_history
        };

        let kind = workflow.unwrap_or_else(|| recommend_workflow(&user_message.content.text));
        Ok((conversation, user_message, history, kind))
    }

    fn sessions_window(&self) -> usize {
        self.sessions.context_window()
    }

    /// Render one persisted message for the prompt, captioning attachments
    /// when the vision path is configured.
    async fn to_chat_message(&self, message: &Message) -> ChatMessage {
        let mut text = message.content.text.clone();
        if !message.content.images.is_empty() {
            if let (Some(vision), Some(blobs)) = (&self.vision, &self.blobs) {
                for image in &message.content.images {
                    match blobs.fetch(image).await {
                        Ok(bytes) => match vision
                            .describe_image(&bytes, "Describe this image for conversation context.")
                            .await
                        {
                            Ok(caption) => {
                                text.push_str(&format!("\n[image: {}]", caption.trim()))
                            }
                            Err(e) => warn!(image = %image.id, "caption failed: {}", e),
                        },
                        Err(e) => warn!(image = %image.id, "attachment fetch failed: {}", e),
                    }
                }
            } else {
                for image in &message.content.images {
                    text.push_str(&format!("\n[attached image: {}]", image.id));
                }
            }
        }
        ChatMessage {
            role: message.role.as_str().to_string(),
            content: text,
        }
    }

    /// Non-streaming send: the full answer comes back at once.
    pub async fn send_message(
        &self,
        conversation_id: Uuid,
        content: MessageContent,
        workflow: Option<WorkflowKind>,
    ) -> CoreResult<SendOutcome> {
        let (conversation, user_message, history, kind) =
            self.prepare(conversation_id, content, workflow).await?;

        let cancel = self.root_token.child_token();
        let outcome = self
            .engine
            .execute(
                kind,
                WorkflowInput {
                    query: user_message.content.text.clone(),
                    knowledge_base_id: conversation.knowledge_base_id,
                    top_k: self.default_top_k,
                    messages: history,
                },
                None,
                cancel,
            )
            .await?;

        let assistant = self
            .persist_assistant(
                conversation_id,
                Uuid::new_v4(),
                user_message.id,
                outcome.answer.clone(),
                Some(outcome.usage),
                false,
            )
            .await?;
        let session = self.sessions.session(
            conversation_id,
            &conversation.owner,
            conversation.knowledge_base_id,
        );
        self.sessions.remember(&session, assistant.clone()).await;

        Ok(SendOutcome {
            message: assistant,
            sources: outcome.sources,
            confidence: outcome.confidence,
            workflow: kind,
            degraded: outcome.degraded,
        })
    }

    /// Streaming send. Returns the assistant message id and the event
    /// receiver; dropping the receiver cancels the underlying workflow.
    pub async fn send_message_streaming(
        &self,
        conversation_id: Uuid,
        content: MessageContent,
        workflow: Option<WorkflowKind>,
    ) -> CoreResult<(Uuid, mpsc::Receiver<StreamEvent>)> {
        let (conversation, user_message, history, kind) =
            self.prepare(conversation_id, content, workflow).await?;

        let message_id = Uuid::new_v4();
        let (events_tx, events_rx) = mpsc::channel(256);
        let cancel = self.root_token.child_token();
        let finished = CancellationToken::new();

        // Disconnect watchdog: a dropped receiver cancels the workflow
        // immediately rather than at the next token. The watchdog itself
        // must not outlive the stream, or its sender clone would hold the
        // channel open forever.
        {
            let watchdog_tx = events_tx.clone();
            let cancel = cancel.clone();
            let finished = finished.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = watchdog_tx.closed() => cancel.cancel(),
                    _ = finished.cancelled() => {}
                }
            });
        }

        let engine = Arc::clone(&self.engine);
        let metadata = Arc::clone(&self.metadata);
        let sessions = Arc::clone(&self.sessions);
        let session = self.sessions.session(
            conversation_id,
            &conversation.owner,
            conversation.knowledge_base_id,
        );
        let top_k = self.default_top_k;
        let kb_id = conversation.knowledge_base_id;
        let query = user_message.content.text.clone();
        let parent_id = user_message.id;

        tokio::spawn(async move {
            let _finished_guard = finished.drop_guard();
            let emitter = EventEmitter::new(events_tx, message_id);
            let (delta_tx, mut delta_rx) = mpsc::channel::<String>(64);

            // Forward synthesizer deltas as text events, accumulating the
            // partial answer for persistence.
            let forward = {
                let cancel = cancel.clone();
                let events = emitter.message_id();
                let mut forward_emitter = emitter;
                tokio::spawn(async move {
                    let mut accumulated = String::new();
                    while let Some(delta) = delta_rx.recv().await {
                        accumulated.push_str(&delta);
                        if !forward_emitter.text(delta).await {
                            debug!(message_id = %events, "consumer gone mid-stream");
                            cancel.cancel();
                            break;
                        }
                    }
                    (accumulated, forward_emitter)
                })
            };

            let outcome = engine
                .execute(
                    kind,
                    WorkflowInput {
                        query,
                        knowledge_base_id: kb_id,
                        top_k,
                        messages: history,
                    },
                    Some(delta_tx),
                    cancel.clone(),
                )
                .await;

            let (partial, mut emitter) = match forward.await {
                Ok(result) => result,
                Err(e) => {
                    warn!("delta forwarder panicked: {}", e);
                    return;
                }
            };

            match outcome {
                Ok(outcome) => {
                    let sources = serde_json::to_value(&outcome.sources).unwrap_or_default();
                    emitter.knowledge(sources).await;

                    let persisted = persist_assistant_static(
                        &metadata,
                        conversation_id,
                        message_id,
                        parent_id,
                        outcome.answer.clone(),
                        Some(outcome.usage),
                        false,
                    )
                    .await;
                    match persisted {
                        Ok(message) => {
                            sessions.remember(&session, message).await;
                            emitter.done(Some(outcome.usage), false).await;
                        }
                        Err(e) => {
                            warn!("failed to persist assistant message: {}", e);
                            emitter
                                .error(e.kind(), "message could not be saved", true)
                                .await;
                        }
                    }
                }
                Err(e) if e.is_cancelled() => {
                    // Keep the tokens that made it out before the disconnect.
                    let _ = persist_assistant_static(
                        &metadata,
                        conversation_id,
                        message_id,
                        parent_id,
                        partial,
                        None,
                        true,
                    )
                    .await;
                    emitter.done(None, true).await;
                }
                Err(e) => {
                    warn!("workflow failed mid-stream: {}", e);
                    if !partial.is_empty() {
                        let _ = persist_assistant_static(
                            &metadata,
                            conversation_id,
                            message_id,
                            parent_id,
                            partial,
                            None,
                            true,
                        )
                        .await;
                    }
                    emitter.error(e.kind(), e.to_string(), true).await;
                }
            }
        });

        Ok((message_id, events_rx))
    }

    async fn persist_assistant(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        parent_id: Uuid,
        text: String,
        usage: Option<TokenUsage>,
        cancelled: bool,
    ) -> CoreResult<Message> {
        persist_assistant_static(
            &self.metadata,
            conversation_id,
            message_id,
            parent_id,
            text,
            usage,
            cancelled,
        )
        .await
    }
}

async fn persist_assistant_static(
    metadata: &Arc<dyn MetadataStore>,
    conversation_id: Uuid,
    message_id: Uuid,
    parent_id: Uuid,
    text: String,
    usage: Option<TokenUsage>,
    cancelled: bool,
) -> CoreResult<Message> {
    let message = Message {
        id: message_id,
        conversation_id,
        role: MessageRole::Assistant,
        content: MessageContent::text(text),
        parent_message_id: Some(parent_id),
        usage,
        cancelled,
        created_at: Utc::now(),
    };
    metadata.insert_message(&message).await?;
    metadata.touch_conversation(conversation_id, None).await?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use corpora_agents::ExecutionRegistry;
    use corpora_ai::{
        sparse, ChatModel, CompletionOptions, CompletionResult, Embedder, LocalEmbedder,
        TokenChunk,
    };
    use corpora_config::CoreConfig;
    use corpora_models::chunk::{Chunk, ChunkType, VectorRecord};
    use corpora_models::workflow::ExecutionStatus;
    use corpora_retrieval::RetrievalEngine;
    use corpora_storage::memory::{MemoryGraphStore, MemoryMetadataStore, MemoryVectorStore};
    use corpora_storage::VectorStore;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct SlowChat {
        observed_cancel: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ChatModel for SlowChat {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _options: &CompletionOptions,
        ) -> CoreResult<CompletionResult> {
            Ok(CompletionResult {
                content: "Paris is the capital of France [source 1].".into(),
                tool_calls: None,
                usage: Some(TokenUsage {
                    prompt_tokens: 40,
                    completion_tokens: 9,
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
            let observed = Arc::clone(&self.observed_cancel);
            tokio::spawn(async move {
                for word in ["Paris ", "is ", "the ", "capital ", "of ", "France. "] {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            observed.store(true, Ordering::SeqCst);
                            return;
                        }
                        _ = tokio::time::sleep(Duration::from_millis(30)) => {}
                    }
                    if tx
                        .send(Ok(TokenChunk {
                            delta: word.to_string(),
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
                        usage: Some(TokenUsage {
                            prompt_tokens: 40,
                            completion_tokens: 6,
                        }),
                        ..TokenChunk::default()
                    }))
                    .await;
            });
            Ok(rx)
        }
    }

    struct Fixture {
        service: ChatService,
        metadata: Arc<MemoryMetadataStore>,
        observed_cancel: Arc<AtomicBool>,
        registry: Arc<ExecutionRegistry>,
        kb_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let kb_id = Uuid::new_v4();
        let metadata = Arc::new(MemoryMetadataStore::new());
        let vectors: Arc<dyn VectorStore> = Arc::new(MemoryVectorStore::new());
        let graph = Arc::new(MemoryGraphStore::new());
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

        let metadata_store: Arc<dyn MetadataStore> = metadata.clone();
        let retrieval = Arc::new(RetrievalEngine::new(
            Default::default(),
            &Default::default(),
            vectors,
            graph,
            Arc::clone(&metadata_store),
            embedder,
            None,
            None,
            None,
        ));
        let observed_cancel = Arc::new(AtomicBool::new(false));
        let chat = Arc::new(SlowChat {
            observed_cancel: Arc::clone(&observed_cancel),
        });
        let registry = Arc::new(ExecutionRegistry::new(Duration::from_secs(3600)));
        let config = CoreConfig::default();
        let engine = Arc::new(WorkflowEngine::new(
            &config,
            retrieval,
            chat,
            Arc::clone(&registry),
        ));
        let sessions = Arc::new(SessionManager::new(Duration::from_secs(1800), 10));

        Fixture {
            service: ChatService::new(
                metadata_store,
                engine,
                None,
                None,
                sessions,
                5,
                CancellationToken::new(),
            ),
            metadata,
            observed_cancel,
            registry,
            kb_id,
        }
    }

    #[tokio::test]
    async fn non_streaming_send_persists_both_turns() {
        let f = fixture().await;
        let conversation = f
            .service
            .start_conversation("tester", Some(f.kb_id))
            .await
            .unwrap();

        let outcome = f
            .service
            .send_message(
                conversation.id,
                MessageContent::text("What is the capital of France?"),
                Some(WorkflowKind::SimpleQa),
            )
            .await
            .unwrap();

        assert!(outcome.message.content.text.contains("Paris"));
        assert!(!outcome.sources.is_empty());
        let page = f.service.list_messages(conversation.id, 10, None).await.unwrap();
        assert_eq!(page.messages.len(), 2);
        assert_eq!(page.messages[0].role, MessageRole::User);
        assert_eq!(page.messages[1].role, MessageRole::Assistant);
        assert_eq!(page.messages[1].parent_message_id, Some(page.messages[0].id));

        // The first turn titled the conversation.
        let refreshed = f.metadata.get_conversation(conversation.id).await.unwrap();
        assert_eq!(refreshed.title.as_deref(), Some("What is the capital of France?"));
    }

    #[tokio::test]
    async fn streaming_send_emits_ordered_events() {
        let f = fixture().await;
        let conversation = f
            .service
            .start_conversation("tester", Some(f.kb_id))
            .await
            .unwrap();

        let (message_id, mut rx) = f
            .service
            .send_message_streaming(
                conversation.id,
                MessageContent::text("capital of France?"),
                Some(WorkflowKind::SimpleQa),
            )
            .await
            .unwrap();

        let mut text = String::new();
        let mut saw_knowledge = false;
        let mut done = false;
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Text { message_id: id, delta } => {
                    assert_eq!(id, message_id);
                    assert!(!done && !saw_knowledge, "text after knowledge/done");
                    text.push_str(&delta);
                }
                StreamEvent::Knowledge { .. } => saw_knowledge = true,
                StreamEvent::Done { cancelled, .. } => {
                    assert!(!cancelled);
                    done = true;
                    break;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(done);
        assert!(saw_knowledge);
        assert!(text.contains("Paris"));

        // The full assistant message was persisted.
        let page = f.service.list_messages(conversation.id, 10, None).await.unwrap();
        assert_eq!(page.messages.len(), 2);
        assert!(!page.messages[1].cancelled);
    }

    #[tokio::test]
    async fn disconnect_cancels_workflow_and_persists_partial() {
        let f = fixture().await;
        let conversation = f
            .service
            .start_conversation("tester", Some(f.kb_id))
            .await
            .unwrap();

        let (_message_id, mut rx) = f
            .service
            .send_message_streaming(
                conversation.id,
                MessageContent::text("capital of France?"),
                Some(WorkflowKind::SimpleQa),
            )
            .await
            .unwrap();

        // Take the first token, then disconnect.
        let mut first_delta = None;
        while let Some(event) = rx.recv().await {
            if let StreamEvent::Text { delta, .. } = event {
                first_delta = Some(delta);
                break;
            }
        }
        assert!(first_delta.is_some());
        drop(rx);

        // The model must observe the cancellation promptly.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(
            f.observed_cancel.load(Ordering::SeqCst),
            "upstream LLM request was not aborted"
        );

        // Partial assistant message persisted with the cancelled marker.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let page = f.service.list_messages(conversation.id, 10, None).await.unwrap();
        let assistant = page
            .messages
            .iter()
            .find(|m| m.role == MessageRole::Assistant)
            .expect("assistant message persisted");
        assert!(assistant.cancelled);
        assert!(assistant.content.text.starts_with("Paris"));

        // And the execution record is cancelled.
        let executions = f.registry.list();
        assert!(executions
            .iter()
            .any(|e| e.status == ExecutionStatus::Cancelled));
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let f = fixture().await;
        let conversation = f.service.start_conversation("tester", None).await.unwrap();
        let err = f
            .service
            .send_message(conversation.id, MessageContent::text("   "), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }
}

//! Relational metadata store façade (Postgres via sqlx).
//!
//! Soft-delete semantics for documents and knowledge bases; a document's
//! chunks are written in a single transaction so ordinal contiguity is never
//! observable half-done.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use tracing::{debug, info};
use uuid::Uuid;

use corpora_models::chunk::{Chunk, ChunkMetadata, ChunkType};
use corpora_models::conversation::{
    Conversation, Message, MessageContent, MessagePage, MessageRole, TokenUsage,
};
use corpora_models::document::{Document, ProcessingStatus};
use corpora_models::knowledge::{KnowledgeBase, KnowledgeBaseStats, Visibility};
use corpora_models::{CoreError, CoreResult};

use crate::error::classify_sqlx;

/// Narrow interface over the relational metadata store.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    // Knowledge bases
    async fn create_knowledge_base(&self, kb: &KnowledgeBase) -> CoreResult<()>;
    async fn get_knowledge_base(&self, id: Uuid) -> CoreResult<KnowledgeBase>;
    async fn soft_delete_knowledge_base(&self, id: Uuid) -> CoreResult<()>;
    /// Admin op: remove the rows entirely (cascades to documents/chunks).
    async fn hard_delete_knowledge_base(&self, id: Uuid) -> CoreResult<()>;
    async fn knowledge_base_stats(&self, id: Uuid) -> CoreResult<KnowledgeBaseStats>;

    // Documents
    async fn insert_document(&self, doc: &Document) -> CoreResult<()>;
    async fn get_document(&self, id: Uuid) -> CoreResult<Document>;
    async fn find_document_by_hash(
        &self,
        kb_id: Uuid,
        content_hash: &str,
    ) -> CoreResult<Option<Document>>;
    async fn find_document_by_filename(
        &self,
        kb_id: Uuid,
        filename: &str,
    ) -> CoreResult<Option<Document>>;
    async fn update_document_status(
        &self,
        id: Uuid,
        status: ProcessingStatus,
        error_message: Option<&str>,
        chunk_count: Option<i32>,
    ) -> CoreResult<()>;
    /// Point an existing document row at new content and return it to
    /// `pending` (the re-ingest path: same document, replaced bytes).
    async fn reset_document(
        &self,
        id: Uuid,
        content_type: &str,
        byte_length: i64,
        content_hash: &str,
    ) -> CoreResult<()>;
    async fn soft_delete_document(&self, id: Uuid) -> CoreResult<()>;

    // Chunks
    /// Insert all chunks of one document in a single transaction.
    async fn insert_chunks(&self, chunks: &[Chunk]) -> CoreResult<()>;
    /// Transactionally swap a document's chunks; returns the removed ids so
    /// the caller can cascade vector/graph deletes.
    async fn replace_chunks(&self, document_id: Uuid, chunks: &[Chunk]) -> CoreResult<Vec<Uuid>>;
    async fn chunks_by_document(&self, document_id: Uuid) -> CoreResult<Vec<Chunk>>;
    async fn chunks_by_ids(&self, ids: &[Uuid]) -> CoreResult<Vec<Chunk>>;

    // Conversations & messages
    async fn create_conversation(&self, conversation: &Conversation) -> CoreResult<()>;
    async fn get_conversation(&self, id: Uuid) -> CoreResult<Conversation>;
    async fn touch_conversation(&self, id: Uuid, title: Option<&str>) -> CoreResult<()>;
    async fn insert_message(&self, message: &Message) -> CoreResult<()>;
    async fn list_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
        cursor: Option<Uuid>,
    ) -> CoreResult<MessagePage>;
    /// Most recent `limit` messages, oldest first, for prompt context.
    async fn recent_messages(&self, conversation_id: Uuid, limit: usize)
        -> CoreResult<Vec<Message>>;
}

// ============================================================================
// Row types
// ============================================================================

#[derive(Debug, FromRow)]
struct KnowledgeBaseRow {
    id: Uuid,
    name: String,
    owner: String,
    visibility: String,
    allowed_file_types: serde_json::Value,
    size_limit_bytes: i64,
    config: serde_json::Value,
    is_deleted: bool,
    deleted_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<KnowledgeBaseRow> for KnowledgeBase {
    type Error = CoreError;

    fn try_from(row: KnowledgeBaseRow) -> CoreResult<Self> {
        let visibility = match row.visibility.as_str() {
            "public" => Visibility::Public,
            _ => Visibility::Private,
        };
        let allowed_file_types = serde_json::from_value(row.allowed_file_types)
            .map_err(|e| CoreError::Permanent(format!("malformed allow-list: {}", e)))?;
        Ok(KnowledgeBase {
            id: row.id,
            name: row.name,
            owner: row.owner,
            visibility,
            allowed_file_types,
            size_limit_bytes: row.size_limit_bytes,
            config: row.config,
            is_deleted: row.is_deleted,
            deleted_at: row.deleted_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct DocumentRow {
    id: Uuid,
    knowledge_base_id: Uuid,
    filename: String,
    content_type: String,
    byte_length: i64,
    content_hash: String,
    status: String,
    error_message: Option<String>,
    chunk_count: i32,
    is_deleted: bool,
    deleted_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DocumentRow> for Document {
    type Error = CoreError;

    fn try_from(row: DocumentRow) -> CoreResult<Self> {
        let status = ProcessingStatus::parse(&row.status)
            .ok_or_else(|| CoreError::Permanent(format!("unknown status {}", row.status)))?;
        Ok(Document {
            id: row.id,
            knowledge_base_id: row.knowledge_base_id,
            filename: row.filename,
            content_type: row.content_type,
            byte_length: row.byte_length,
            content_hash: row.content_hash,
            status,
            error_message: row.error_message,
            chunk_count: row.chunk_count,
            is_deleted: row.is_deleted,
            deleted_at: row.deleted_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ChunkRow {
    id: Uuid,
    document_id: Uuid,
    knowledge_base_id: Uuid,
    chunk_index: i32,
    start_offset: i64,
    end_offset: i64,
    content: String,
    content_hash: String,
    chunk_type: String,
    metadata: serde_json::Value,
}

impl TryFrom<ChunkRow> for Chunk {
    type Error = CoreError;

    fn try_from(row: ChunkRow) -> CoreResult<Self> {
        let chunk_type = ChunkType::parse(&row.chunk_type)
            .ok_or_else(|| CoreError::Permanent(format!("unknown chunk type {}", row.chunk_type)))?;
        let metadata: ChunkMetadata = serde_json::from_value(row.metadata)
            .map_err(|e| CoreError::Permanent(format!("malformed chunk metadata: {}", e)))?;
        Ok(Chunk {
            id: row.id,
            document_id: row.document_id,
            knowledge_base_id: row.knowledge_base_id,
            chunk_index: row.chunk_index,
            start_offset: row.start_offset as u32,
            end_offset: row.end_offset as u32,
            content: row.content,
            content_hash: row.content_hash,
            chunk_type,
            metadata,
        })
    }
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: Uuid,
    owner: String,
    knowledge_base_id: Option<Uuid>,
    title: Option<String>,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        Conversation {
            id: row.id,
            owner: row.owner,
            knowledge_base_id: row.knowledge_base_id,
            title: row.title,
            created_at: row.created_at,
            last_activity_at: row.last_activity_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: Uuid,
    conversation_id: Uuid,
    role: String,
    content: serde_json::Value,
    parent_message_id: Option<Uuid>,
    usage: Option<serde_json::Value>,
    cancelled: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for Message {
    type Error = CoreError;

    fn try_from(row: MessageRow) -> CoreResult<Self> {
        let role = MessageRole::parse(&row.role)
            .ok_or_else(|| CoreError::Permanent(format!("unknown role {}", row.role)))?;
        let content: MessageContent = serde_json::from_value(row.content)
            .map_err(|e| CoreError::Permanent(format!("malformed message content: {}", e)))?;
        let usage: Option<TokenUsage> = match row.usage {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| CoreError::Permanent(format!("malformed usage: {}", e)))?,
            None => None,
        };
        Ok(Message {
            id: row.id,
            conversation_id: row.conversation_id,
            role,
            content,
            parent_message_id: row.parent_message_id,
            usage,
            cancelled: row.cancelled,
            created_at: row.created_at,
        })
    }
}

// ============================================================================
// Postgres implementation
// ============================================================================

#[derive(Clone)]
pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    pub async fn connect(database_url: &str) -> CoreResult<Self> {
        info!("connecting to metadata store");
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(classify_sqlx)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> CoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| CoreError::dependency("metadata_store", e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    async fn create_knowledge_base(&self, kb: &KnowledgeBase) -> CoreResult<()> {
        let visibility = match kb.visibility {
            Visibility::Public => "public",
            Visibility::Private => "private",
        };
        sqlx::query(
            "INSERT INTO knowledge_bases \
             (id, name, owner, visibility, allowed_file_types, size_limit_bytes, config, \
              is_deleted, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE, $8, $9)",
        )
        .bind(kb.id)
        .bind(&kb.name)
        .bind(&kb.owner)
        .bind(visibility)
        .bind(serde_json::json!(kb.allowed_file_types))
        .bind(kb.size_limit_bytes)
        .bind(&kb.config)
        .bind(kb.created_at)
        .bind(kb.updated_at)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx)?;
        Ok(())
    }

    async fn get_knowledge_base(&self, id: Uuid) -> CoreResult<KnowledgeBase> {
        let row: KnowledgeBaseRow =
            sqlx::query_as("SELECT * FROM knowledge_bases WHERE id = $1 AND NOT is_deleted")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(classify_sqlx)?
                .ok_or_else(|| CoreError::NotFound(format!("knowledge base {}", id)))?;
        row.try_into()
    }

    async fn soft_delete_knowledge_base(&self, id: Uuid) -> CoreResult<()> {
        let result = sqlx::query(
            "UPDATE knowledge_bases SET is_deleted = TRUE, deleted_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND NOT is_deleted",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("knowledge base {}", id)));
        }
        // Documents follow the parent's visibility.
        sqlx::query(
            "UPDATE documents SET is_deleted = TRUE, deleted_at = NOW(), updated_at = NOW() \
             WHERE knowledge_base_id = $1 AND NOT is_deleted",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx)?;
        Ok(())
    }

    async fn hard_delete_knowledge_base(&self, id: Uuid) -> CoreResult<()> {
        sqlx::query("DELETE FROM knowledge_bases WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx)?;
        Ok(())
    }

    async fn knowledge_base_stats(&self, id: Uuid) -> CoreResult<KnowledgeBaseStats> {
        #[derive(FromRow)]
        struct StatsRow {
            document_count: i64,
            completed_documents: i64,
            failed_documents: i64,
            total_bytes: Option<i64>,
            chunk_count: i64,
        }

        let row: StatsRow = sqlx::query_as(
            "SELECT \
               COUNT(d.id) AS document_count, \
               COUNT(d.id) FILTER (WHERE d.status = 'completed') AS completed_documents, \
               COUNT(d.id) FILTER (WHERE d.status = 'failed') AS failed_documents, \
               SUM(d.byte_length) AS total_bytes, \
               (SELECT COUNT(*) FROM chunks c WHERE c.knowledge_base_id = $1) AS chunk_count \
             FROM documents d \
             WHERE d.knowledge_base_id = $1 AND NOT d.is_deleted",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(classify_sqlx)?;

        Ok(KnowledgeBaseStats {
            document_count: row.document_count.max(0) as u64,
            completed_documents: row.completed_documents.max(0) as u64,
            failed_documents: row.failed_documents.max(0) as u64,
            chunk_count: row.chunk_count.max(0) as u64,
            total_bytes: row.total_bytes.unwrap_or(0).max(0) as u64,
            entity_count: 0, // filled in by the caller from the graph store
        })
    }

    async fn insert_document(&self, doc: &Document) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO documents \
             (id, knowledge_base_id, filename, content_type, byte_length, content_hash, \
              status, error_message, chunk_count, is_deleted, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, FALSE, $10, $11)",
        )
        .bind(doc.id)
        .bind(doc.knowledge_base_id)
        .bind(&doc.filename)
        .bind(&doc.content_type)
        .bind(doc.byte_length)
        .bind(&doc.content_hash)
        .bind(doc.status.as_str())
        .bind(&doc.error_message)
        .bind(doc.chunk_count)
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx)?;
        Ok(())
    }

    async fn get_document(&self, id: Uuid) -> CoreResult<Document> {
        let row: DocumentRow =
            sqlx::query_as("SELECT * FROM documents WHERE id = $1 AND NOT is_deleted")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(classify_sqlx)?
                .ok_or_else(|| CoreError::NotFound(format!("document {}", id)))?;
        row.try_into()
    }

    async fn find_document_by_hash(
        &self,
        kb_id: Uuid,
        content_hash: &str,
    ) -> CoreResult<Option<Document>> {
        let row: Option<DocumentRow> = sqlx::query_as(
            "SELECT * FROM documents \
             WHERE knowledge_base_id = $1 AND content_hash = $2 AND NOT is_deleted \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(kb_id)
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_sqlx)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn find_document_by_filename(
        &self,
        kb_id: Uuid,
        filename: &str,
    ) -> CoreResult<Option<Document>> {
        let row: Option<DocumentRow> = sqlx::query_as(
            "SELECT * FROM documents \
             WHERE knowledge_base_id = $1 AND filename = $2 AND NOT is_deleted \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(kb_id)
        .bind(filename)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_sqlx)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn update_document_status(
        &self,
        id: Uuid,
        status: ProcessingStatus,
        error_message: Option<&str>,
        chunk_count: Option<i32>,
    ) -> CoreResult<()> {
        let result = sqlx::query(
            "UPDATE documents SET status = $2, error_message = $3, \
             chunk_count = COALESCE($4, chunk_count), updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error_message)
        .bind(chunk_count)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("document {}", id)));
        }
        debug!(document_id = %id, status = status.as_str(), "document status updated");
        Ok(())
    }

    async fn reset_document(
        &self,
        id: Uuid,
        content_type: &str,
        byte_length: i64,
        content_hash: &str,
    ) -> CoreResult<()> {
        let result = sqlx::query(
            "UPDATE documents SET content_type = $2, byte_length = $3, content_hash = $4, \
             status = 'pending', error_message = NULL, updated_at = NOW() \
             WHERE id = $1 AND NOT is_deleted",
        )
        .bind(id)
        .bind(content_type)
        .bind(byte_length)
        .bind(content_hash)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("document {}", id)));
        }
        debug!(document_id = %id, "document reset for re-ingest");
        Ok(())
    }

    async fn soft_delete_document(&self, id: Uuid) -> CoreResult<()> {
        let result = sqlx::query(
            "UPDATE documents SET is_deleted = TRUE, deleted_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND NOT is_deleted",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("document {}", id)));
        }
        Ok(())
    }

    async fn insert_chunks(&self, chunks: &[Chunk]) -> CoreResult<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(classify_sqlx)?;
        for chunk in chunks {
            sqlx::query(
                "INSERT INTO chunks \
                 (id, document_id, knowledge_base_id, chunk_index, start_offset, end_offset, \
                  content, content_hash, chunk_type, metadata) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(chunk.id)
            .bind(chunk.document_id)
            .bind(chunk.knowledge_base_id)
            .bind(chunk.chunk_index)
            .bind(chunk.start_offset as i64)
            .bind(chunk.end_offset as i64)
            .bind(&chunk.content)
            .bind(&chunk.content_hash)
            .bind(chunk.chunk_type.as_str())
            .bind(serde_json::to_value(&chunk.metadata).unwrap_or_default())
            .execute(&mut *tx)
            .await
            .map_err(classify_sqlx)?;
        }
        tx.commit().await.map_err(classify_sqlx)?;
        Ok(())
    }

    async fn replace_chunks(&self, document_id: Uuid, chunks: &[Chunk]) -> CoreResult<Vec<Uuid>> {
        let mut tx = self.pool.begin().await.map_err(classify_sqlx)?;

        #[derive(FromRow)]
        struct IdRow {
            id: Uuid,
        }
        let removed: Vec<IdRow> = sqlx::query_as("SELECT id FROM chunks WHERE document_id = $1")
            .bind(document_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(classify_sqlx)?;

        sqlx::query("DELETE FROM chunks WHERE document_id = $1")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(classify_sqlx)?;

        for chunk in chunks {
            sqlx::query(
                "INSERT INTO chunks \
                 (id, document_id, knowledge_base_id, chunk_index, start_offset, end_offset, \
                  content, content_hash, chunk_type, metadata) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(chunk.id)
            .bind(chunk.document_id)
            .bind(chunk.knowledge_base_id)
            .bind(chunk.chunk_index)
            .bind(chunk.start_offset as i64)
            .bind(chunk.end_offset as i64)
            .bind(&chunk.content)
            .bind(&chunk.content_hash)
            .bind(chunk.chunk_type.as_str())
            .bind(serde_json::to_value(&chunk.metadata).unwrap_or_default())
            .execute(&mut *tx)
            .await
            .map_err(classify_sqlx)?;
        }

        sqlx::query("UPDATE documents SET chunk_count = $2, updated_at = NOW() WHERE id = $1")
            .bind(document_id)
            .bind(chunks.len() as i32)
            .execute(&mut *tx)
            .await
            .map_err(classify_sqlx)?;

        tx.commit().await.map_err(classify_sqlx)?;
        Ok(removed.into_iter().map(|r| r.id).collect())
    }

    async fn chunks_by_document(&self, document_id: Uuid) -> CoreResult<Vec<Chunk>> {
        let rows: Vec<ChunkRow> =
            sqlx::query_as("SELECT * FROM chunks WHERE document_id = $1 ORDER BY chunk_index")
                .bind(document_id)
                .fetch_all(&self.pool)
                .await
                .map_err(classify_sqlx)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn chunks_by_ids(&self, ids: &[Uuid]) -> CoreResult<Vec<Chunk>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<ChunkRow> = sqlx::query_as("SELECT * FROM chunks WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(classify_sqlx)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn create_conversation(&self, conversation: &Conversation) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO conversations (id, owner, knowledge_base_id, title, created_at, last_activity_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(conversation.id)
        .bind(&conversation.owner)
        .bind(conversation.knowledge_base_id)
        .bind(&conversation.title)
        .bind(conversation.created_at)
        .bind(conversation.last_activity_at)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx)?;
        Ok(())
    }

    async fn get_conversation(&self, id: Uuid) -> CoreResult<Conversation> {
        let row: ConversationRow = sqlx::query_as("SELECT * FROM conversations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify_sqlx)?
            .ok_or_else(|| CoreError::NotFound(format!("conversation {}", id)))?;
        Ok(row.into())
    }

    async fn touch_conversation(&self, id: Uuid, title: Option<&str>) -> CoreResult<()> {
        sqlx::query(
            "UPDATE conversations SET last_activity_at = NOW(), title = COALESCE(title, $2) \
             WHERE id = $1",
        )
        .bind(id)
        .bind(title)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx)?;
        Ok(())
    }

    async fn insert_message(&self, message: &Message) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO messages \
             (id, conversation_id, role, content, parent_message_id, usage, cancelled, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(message.id)
        .bind(message.conversation_id)
        .bind(message.role.as_str())
        .bind(serde_json::to_value(&message.content).unwrap_or_default())
        .bind(message.parent_message_id)
        .bind(
            message
                .usage
                .as_ref()
                .map(|u| serde_json::to_value(u).unwrap_or_default()),
        )
        .bind(message.cancelled)
        .bind(message.created_at)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx)?;
        Ok(())
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
        cursor: Option<Uuid>,
    ) -> CoreResult<MessagePage> {
        let rows: Vec<MessageRow> = match cursor {
            Some(cursor_id) => {
                sqlx::query_as(
                    "SELECT m.* FROM messages m, messages anchor \
                     WHERE anchor.id = $2 AND m.conversation_id = $1 \
                       AND (m.created_at, m.id) > (anchor.created_at, anchor.id) \
                     ORDER BY m.created_at, m.id LIMIT $3",
                )
                .bind(conversation_id)
                .bind(cursor_id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as(
                    "SELECT * FROM messages WHERE conversation_id = $1 \
                     ORDER BY created_at, id LIMIT $2",
                )
                .bind(conversation_id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(classify_sqlx)?;

        let messages: Vec<Message> = rows
            .into_iter()
            .map(TryInto::try_into)
            .collect::<CoreResult<_>>()?;
        let next_cursor = if messages.len() == limit {
            messages.last().map(|m| m.id)
        } else {
            None
        };
        Ok(MessagePage {
            messages,
            next_cursor,
        })
    }

    async fn recent_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
    ) -> CoreResult<Vec<Message>> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT * FROM messages WHERE conversation_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2",
        )
        .bind(conversation_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx)?;

        let mut messages: Vec<Message> = rows
            .into_iter()
            .map(TryInto::try_into)
            .collect::<CoreResult<_>>()?;
        messages.reverse();
        Ok(messages)
    }
}

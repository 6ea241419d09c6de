//! In-process implementations of the three storage façades.
//!
//! Used by tests and hermetic deployments. Semantics mirror the production
//! backends: cosine scoring with the same normalization, natural-key entity
//! merges, soft deletes, transactional chunk replacement.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use corpora_models::chunk::{Chunk, VectorRecord};
use corpora_models::conversation::{Conversation, Message, MessagePage};
use corpora_models::document::{Document, ProcessingStatus};
use corpora_models::graph::{Entity, EntityType, GraphPath, PathSegment, Relation, RelationType};
use corpora_models::knowledge::{KnowledgeBase, KnowledgeBaseStats};
use corpora_models::search::FilterExpr;
use corpora_models::{CoreError, CoreResult};

use crate::graph::GraphStore;
use crate::metadata::MetadataStore;
use crate::vector::{
    normalize_cosine, normalize_sparse, rrf_fuse, HybridWeights, VectorHit, VectorStore,
};

// ============================================================================
// Vector store
// ============================================================================

#[derive(Default)]
struct MemoryCollection {
    dimension: usize,
    records: HashMap<Uuid, VectorRecord>,
}

/// In-memory dense/sparse vector store with cosine scoring.
#[derive(Default)]
pub struct MemoryVectorStore {
    collections: DashMap<Uuid, MemoryCollection>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vector_count(&self, kb_id: Uuid) -> usize {
        self.collections
            .get(&kb_id)
            .map(|c| c.records.len())
            .unwrap_or(0)
    }

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() || a.is_empty() {
            return 0.0;
        }
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            0.0
        } else {
            dot / (norm_a * norm_b)
        }
    }

    fn record_field(record: &VectorRecord, field: &str) -> Option<Value> {
        match field {
            "document_id" => Some(json!(record.document_id.to_string())),
            "knowledge_base_id" => Some(json!(record.knowledge_base_id.to_string())),
            "chunk_type" => Some(json!(record.chunk_type.as_str())),
            "chunk_index" => Some(json!(record.chunk_index)),
            _ => None,
        }
    }

    fn passes(record: &VectorRecord, filter: Option<&FilterExpr>) -> bool {
        match filter {
            Some(expr) => expr.matches(&|field| Self::record_field(record, field)),
            None => true,
        }
    }

    fn hit(record: &VectorRecord, score: f32) -> VectorHit {
        VectorHit {
            chunk_id: record.chunk_id,
            document_id: record.document_id,
            chunk_index: record.chunk_index,
            score,
            content: record.content.clone(),
            chunk_type: record.chunk_type.as_str().to_string(),
            metadata: json!({
                "document_id": record.document_id.to_string(),
                "knowledge_base_id": record.knowledge_base_id.to_string(),
                "chunk_index": record.chunk_index,
                "chunk_type": record.chunk_type.as_str(),
            }),
        }
    }

    fn ranked(mut hits: Vec<VectorHit>, top_k: usize) -> Vec<VectorHit> {
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(top_k);
        hits
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn create_collection(&self, kb_id: Uuid, dimension: usize) -> CoreResult<()> {
        self.collections.entry(kb_id).or_insert_with(|| MemoryCollection {
            dimension,
            records: HashMap::new(),
        });
        Ok(())
    }

    async fn drop_collection(&self, kb_id: Uuid) -> CoreResult<()> {
        self.collections.remove(&kb_id);
        Ok(())
    }

    async fn upsert_batch(&self, kb_id: Uuid, records: &[VectorRecord]) -> CoreResult<()> {
        let mut collection = self
            .collections
            .get_mut(&kb_id)
            .ok_or_else(|| CoreError::NotFound(format!("collection for kb {}", kb_id)))?;
        for record in records {
            if collection.dimension != 0 && record.dense.len() != collection.dimension {
                return Err(CoreError::Permanent(format!(
                    "dimension mismatch: expected {}, got {}",
                    collection.dimension,
                    record.dense.len()
                )));
            }
            collection.records.insert(record.chunk_id, record.clone());
        }
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
        let collection = match self.collections.get(&kb_id) {
            Some(c) => c,
            None => return Ok(Vec::new()),
        };
        let hits = collection
            .records
            .values()
            .filter(|r| Self::passes(r, filter))
            .map(|r| Self::hit(r, normalize_cosine(Self::cosine(query, &r.dense))))
            .collect();
        Ok(Self::ranked(hits, top_k))
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
        let collection = match self.collections.get(&kb_id) {
            Some(c) => c,
            None => return Ok(Vec::new()),
        };
        let hits: Vec<VectorHit> = collection
            .records
            .values()
            .filter(|r| Self::passes(r, filter))
            .filter_map(|r| {
                let record_sparse = r.sparse.as_ref()?;
                let dot: f32 = sparse
                    .iter()
                    .filter_map(|(token, weight)| record_sparse.get(token).map(|w| w * weight))
                    .sum();
                if dot > 0.0 {
                    Some(Self::hit(r, normalize_sparse(dot)))
                } else {
                    None
                }
            })
            .collect();
        Ok(Self::ranked(hits, top_k))
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
        let fetch = top_k.saturating_mul(2).max(top_k);
        let dense = self.search_dense(kb_id, query, fetch, filter).await?;
        let sparse_hits = self.search_sparse(kb_id, sparse, fetch, filter).await?;
        Ok(rrf_fuse(
            vec![(dense, weights.dense), (sparse_hits, weights.sparse)],
            60,
            top_k,
        ))
    }

    async fn delete_by_filter(&self, kb_id: Uuid, filter: &FilterExpr) -> CoreResult<()> {
        if let Some(mut collection) = self.collections.get_mut(&kb_id) {
            collection
                .records
                .retain(|_, record| !Self::passes(record, Some(filter)));
        }
        Ok(())
    }
}

// ============================================================================
// Graph store
// ============================================================================

/// In-memory graph store with natural-key entity merges.
#[derive(Default)]
pub struct MemoryGraphStore {
    entities: DashMap<String, Entity>,
    relations: Mutex<Vec<(Uuid, Relation)>>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entity_by_id(&self, id: Uuid) -> Option<Entity> {
        self.entities
            .iter()
            .find(|e| e.value().id == id)
            .map(|e| e.value().clone())
    }

    fn entity_by_name(&self, kb_id: Uuid, name: &str) -> Option<Entity> {
        let name_lc = name.to_lowercase();
        self.entities
            .iter()
            .find(|e| {
                e.value().knowledge_base_id == kb_id && e.value().name.to_lowercase() == name_lc
            })
            .map(|e| e.value().clone())
    }

    /// Undirected neighborhood of one entity.
    fn neighbors_of(&self, kb_id: Uuid, entity_id: Uuid) -> Vec<(RelationType, f32, Entity)> {
        let relations = self.relations.lock();
        relations
            .iter()
            .filter(|(kb, _)| *kb == kb_id)
            .filter_map(|(_, rel)| {
                let other = if rel.source == entity_id {
                    rel.target
                } else if rel.target == entity_id {
                    rel.source
                } else {
                    return None;
                };
                self.entity_by_id(other)
                    .map(|entity| (rel.relation_type, rel.confidence, entity))
            })
            .collect()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn upsert_entity(&self, entity: &Entity) -> CoreResult<Uuid> {
        let key = entity.natural_key();
        let mut canonical_id = entity.id;
        self.entities
            .entry(key)
            .and_modify(|existing| {
                existing.confidence = existing.confidence.max(entity.confidence);
                for chunk_id in &entity.source_chunk_ids {
                    if !existing.source_chunk_ids.contains(chunk_id) {
                        existing.source_chunk_ids.push(*chunk_id);
                    }
                }
                canonical_id = existing.id;
            })
            .or_insert_with(|| entity.clone());
        Ok(canonical_id)
    }

    async fn upsert_relation(&self, kb_id: Uuid, relation: &Relation) -> CoreResult<()> {
        if self.entity_by_id(relation.source).is_none()
            || self.entity_by_id(relation.target).is_none()
        {
            return Err(CoreError::NotFound(format!(
                "relation endpoints missing: {} -> {}",
                relation.source, relation.target
            )));
        }
        let mut relations = self.relations.lock();
        // Merge: same endpoints + type updates in place.
        if let Some(existing) = relations.iter_mut().find(|(kb, r)| {
            *kb == kb_id
                && r.source == relation.source
                && r.target == relation.target
                && r.relation_type == relation.relation_type
        }) {
            existing.1.confidence = relation.confidence;
            existing.1.source_chunk_id = relation.source_chunk_id;
        } else {
            relations.push((kb_id, relation.clone()));
        }
        Ok(())
    }

    async fn find_entities(
        &self,
        kb_id: Uuid,
        name_or_pattern: &str,
        types: &[EntityType],
        limit: usize,
    ) -> CoreResult<Vec<Entity>> {
        let pattern_lc = name_or_pattern.to_lowercase();
        let mut matches: Vec<Entity> = self
            .entities
            .iter()
            .filter(|e| {
                let entity = e.value();
                entity.knowledge_base_id == kb_id
                    && entity.name.to_lowercase().contains(&pattern_lc)
                    && (types.is_empty() || types.contains(&entity.entity_type))
            })
            .map(|e| e.value().clone())
            .collect();
        matches.sort_by(|a, b| {
            let sim_a = strsim::jaro_winkler(&a.name.to_lowercase(), &pattern_lc);
            let sim_b = strsim::jaro_winkler(&b.name.to_lowercase(), &pattern_lc);
            sim_b.partial_cmp(&sim_a).unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(limit);
        Ok(matches)
    }

    async fn traverse(
        &self,
        kb_id: Uuid,
        start_entity: &str,
        max_hops: usize,
        relation_filter: &[RelationType],
        limit: usize,
    ) -> CoreResult<Vec<GraphPath>> {
        let start = self
            .entity_by_name(kb_id, start_entity)
            .ok_or_else(|| CoreError::NotFound(format!("entity '{}' not found", start_entity)))?;

        let mut paths = Vec::new();
        let mut frontier = vec![GraphPath {
            start: start.clone(),
            segments: Vec::new(),
        }];
        let mut visited = vec![start.id];

        while let Some(path) = frontier.pop() {
            if paths.len() >= limit {
                break;
            }
            if path.segments.len() >= max_hops {
                continue;
            }
            let tip_id = path.terminal().id;
            for (relation_type, confidence, neighbor) in self.neighbors_of(kb_id, tip_id) {
                if !relation_filter.is_empty() && !relation_filter.contains(&relation_type) {
                    continue;
                }
                if visited.contains(&neighbor.id) {
                    continue;
                }
                visited.push(neighbor.id);
                let mut extended = path.clone();
                extended.segments.push(PathSegment {
                    relation_type,
                    confidence,
                    entity: neighbor,
                });
                paths.push(extended.clone());
                frontier.push(extended);
            }
        }

        paths.truncate(limit);
        Ok(paths)
    }

    async fn context_chunk_ids(
        &self,
        kb_id: Uuid,
        entity_name: &str,
        limit: usize,
    ) -> CoreResult<Vec<Uuid>> {
        let entity = self
            .entity_by_name(kb_id, entity_name)
            .ok_or_else(|| CoreError::NotFound(format!("entity '{}' not found", entity_name)))?;
        Ok(entity.source_chunk_ids.into_iter().take(limit).collect())
    }

    async fn remove_chunk_refs(&self, kb_id: Uuid, chunk_ids: &[Uuid]) -> CoreResult<()> {
        let mut emptied = Vec::new();
        for mut entry in self.entities.iter_mut() {
            let entity = entry.value_mut();
            if entity.knowledge_base_id != kb_id {
                continue;
            }
            entity.source_chunk_ids.retain(|id| !chunk_ids.contains(id));
            if entity.source_chunk_ids.is_empty() {
                let id = entity.id;
                emptied.push((entry.key().clone(), id));
            }
        }
        for (key, id) in emptied {
            self.entities.remove(&key);
            self.relations
                .lock()
                .retain(|(kb, r)| !(*kb == kb_id && (r.source == id || r.target == id)));
        }
        Ok(())
    }

    async fn delete_knowledge_base(&self, kb_id: Uuid) -> CoreResult<()> {
        self.entities
            .retain(|_, entity| entity.knowledge_base_id != kb_id);
        self.relations.lock().retain(|(kb, _)| *kb != kb_id);
        Ok(())
    }

    async fn entity_count(&self, kb_id: Uuid) -> CoreResult<u64> {
        Ok(self
            .entities
            .iter()
            .filter(|e| e.value().knowledge_base_id == kb_id)
            .count() as u64)
    }
}

// ============================================================================
// Metadata store
// ============================================================================

/// In-memory metadata store with soft-delete semantics.
#[derive(Default)]
pub struct MemoryMetadataStore {
    knowledge_bases: DashMap<Uuid, KnowledgeBase>,
    documents: DashMap<Uuid, Document>,
    chunks: DashMap<Uuid, Chunk>,
    conversations: DashMap<Uuid, Conversation>,
    messages: Mutex<Vec<Message>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn create_knowledge_base(&self, kb: &KnowledgeBase) -> CoreResult<()> {
        if self.knowledge_bases.contains_key(&kb.id) {
            return Err(CoreError::Conflict(format!("knowledge base {}", kb.id)));
        }
        self.knowledge_bases.insert(kb.id, kb.clone());
        Ok(())
    }

    async fn get_knowledge_base(&self, id: Uuid) -> CoreResult<KnowledgeBase> {
        self.knowledge_bases
            .get(&id)
            .filter(|kb| !kb.is_deleted)
            .map(|kb| kb.clone())
            .ok_or_else(|| CoreError::NotFound(format!("knowledge base {}", id)))
    }

    async fn soft_delete_knowledge_base(&self, id: Uuid) -> CoreResult<()> {
        let mut kb = self
            .knowledge_bases
            .get_mut(&id)
            .filter(|kb| !kb.is_deleted)
            .ok_or_else(|| CoreError::NotFound(format!("knowledge base {}", id)))?;
        kb.is_deleted = true;
        kb.deleted_at = Some(Utc::now());
        drop(kb);
        for mut doc in self.documents.iter_mut() {
            if doc.knowledge_base_id == id && !doc.is_deleted {
                doc.is_deleted = true;
                doc.deleted_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn hard_delete_knowledge_base(&self, id: Uuid) -> CoreResult<()> {
        self.knowledge_bases.remove(&id);
        let doc_ids: Vec<Uuid> = self
            .documents
            .iter()
            .filter(|d| d.knowledge_base_id == id)
            .map(|d| d.id)
            .collect();
        for doc_id in doc_ids {
            self.documents.remove(&doc_id);
        }
        self.chunks.retain(|_, chunk| chunk.knowledge_base_id != id);
        Ok(())
    }

    async fn knowledge_base_stats(&self, id: Uuid) -> CoreResult<KnowledgeBaseStats> {
        let mut stats = KnowledgeBaseStats::default();
        for doc in self.documents.iter() {
            if doc.knowledge_base_id != id || doc.is_deleted {
                continue;
            }
            stats.document_count += 1;
            stats.total_bytes += doc.byte_length.max(0) as u64;
            match doc.status {
                ProcessingStatus::Completed => stats.completed_documents += 1,
                ProcessingStatus::Failed => stats.failed_documents += 1,
                _ => {}
            }
        }
        stats.chunk_count = self
            .chunks
            .iter()
            .filter(|c| c.knowledge_base_id == id)
            .count() as u64;
        Ok(stats)
    }

    async fn insert_document(&self, doc: &Document) -> CoreResult<()> {
        if self.documents.contains_key(&doc.id) {
            return Err(CoreError::Conflict(format!("document {}", doc.id)));
        }
        self.documents.insert(doc.id, doc.clone());
        Ok(())
    }

    async fn get_document(&self, id: Uuid) -> CoreResult<Document> {
        self.documents
            .get(&id)
            .filter(|d| !d.is_deleted)
            .map(|d| d.clone())
            .ok_or_else(|| CoreError::NotFound(format!("document {}", id)))
    }

    async fn find_document_by_hash(
        &self,
        kb_id: Uuid,
        content_hash: &str,
    ) -> CoreResult<Option<Document>> {
        Ok(self
            .documents
            .iter()
            .filter(|d| {
                d.knowledge_base_id == kb_id && d.content_hash == content_hash && !d.is_deleted
            })
            .max_by_key(|d| d.created_at)
            .map(|d| d.clone()))
    }

    async fn find_document_by_filename(
        &self,
        kb_id: Uuid,
        filename: &str,
    ) -> CoreResult<Option<Document>> {
        Ok(self
            .documents
            .iter()
            .filter(|d| d.knowledge_base_id == kb_id && d.filename == filename && !d.is_deleted)
            .max_by_key(|d| d.created_at)
            .map(|d| d.clone()))
    }

    async fn update_document_status(
        &self,
        id: Uuid,
        status: ProcessingStatus,
        error_message: Option<&str>,
        chunk_count: Option<i32>,
    ) -> CoreResult<()> {
        let mut doc = self
            .documents
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("document {}", id)))?;
        doc.status = status;
        doc.error_message = error_message.map(String::from);
        if let Some(count) = chunk_count {
            doc.chunk_count = count;
        }
        doc.updated_at = Utc::now();
        Ok(())
    }

    async fn reset_document(
        &self,
        id: Uuid,
        content_type: &str,
        byte_length: i64,
        content_hash: &str,
    ) -> CoreResult<()> {
        let mut doc = self
            .documents
            .get_mut(&id)
            .filter(|d| !d.is_deleted)
            .ok_or_else(|| CoreError::NotFound(format!("document {}", id)))?;
        doc.content_type = content_type.to_string();
        doc.byte_length = byte_length;
        doc.content_hash = content_hash.to_string();
        doc.status = ProcessingStatus::Pending;
        doc.error_message = None;
        doc.updated_at = Utc::now();
        Ok(())
    }

    async fn soft_delete_document(&self, id: Uuid) -> CoreResult<()> {
        let mut doc = self
            .documents
            .get_mut(&id)
            .filter(|d| !d.is_deleted)
            .ok_or_else(|| CoreError::NotFound(format!("document {}", id)))?;
        doc.is_deleted = true;
        doc.deleted_at = Some(Utc::now());
        Ok(())
    }

    async fn insert_chunks(&self, chunks: &[Chunk]) -> CoreResult<()> {
        // Uniqueness on (document_id, chunk_index), as the schema enforces.
        for chunk in chunks {
            let duplicate = self.chunks.iter().any(|existing| {
                existing.document_id == chunk.document_id
                    && existing.chunk_index == chunk.chunk_index
            });
            if duplicate {
                return Err(CoreError::Conflict(format!(
                    "chunk ordinal {} already present for document {}",
                    chunk.chunk_index, chunk.document_id
                )));
            }
        }
        for chunk in chunks {
            self.chunks.insert(chunk.id, chunk.clone());
        }
        Ok(())
    }

    async fn replace_chunks(&self, document_id: Uuid, chunks: &[Chunk]) -> CoreResult<Vec<Uuid>> {
        let removed: Vec<Uuid> = self
            .chunks
            .iter()
            .filter(|c| c.document_id == document_id)
            .map(|c| c.id)
            .collect();
        for id in &removed {
            self.chunks.remove(id);
        }
        for chunk in chunks {
            self.chunks.insert(chunk.id, chunk.clone());
        }
        if let Some(mut doc) = self.documents.get_mut(&document_id) {
            doc.chunk_count = chunks.len() as i32;
            doc.updated_at = Utc::now();
        }
        Ok(removed)
    }

    async fn chunks_by_document(&self, document_id: Uuid) -> CoreResult<Vec<Chunk>> {
        let mut chunks: Vec<Chunk> = self
            .chunks
            .iter()
            .filter(|c| c.document_id == document_id)
            .map(|c| c.clone())
            .collect();
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    async fn chunks_by_ids(&self, ids: &[Uuid]) -> CoreResult<Vec<Chunk>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.chunks.get(id).map(|c| c.clone()))
            .collect())
    }

    async fn create_conversation(&self, conversation: &Conversation) -> CoreResult<()> {
        self.conversations
            .insert(conversation.id, conversation.clone());
        Ok(())
    }

    async fn get_conversation(&self, id: Uuid) -> CoreResult<Conversation> {
        self.conversations
            .get(&id)
            .map(|c| c.clone())
            .ok_or_else(|| CoreError::NotFound(format!("conversation {}", id)))
    }

    async fn touch_conversation(&self, id: Uuid, title: Option<&str>) -> CoreResult<()> {
        let mut conversation = self
            .conversations
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("conversation {}", id)))?;
        conversation.last_activity_at = Utc::now();
        if let Some(title) = title {
            if conversation.title.is_none() {
                conversation.title = Some(title.to_string());
            }
        }
        Ok(())
    }

    async fn insert_message(&self, message: &Message) -> CoreResult<()> {
        self.messages.lock().push(message.clone());
        Ok(())
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
        cursor: Option<Uuid>,
    ) -> CoreResult<MessagePage> {
        let messages = self.messages.lock();
        let mut filtered: Vec<Message> = messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        filtered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let start = match cursor {
            Some(cursor_id) => filtered
                .iter()
                .position(|m| m.id == cursor_id)
                .map(|i| i + 1)
                .unwrap_or(0),
            None => 0,
        };
        let page: Vec<Message> = filtered.into_iter().skip(start).take(limit).collect();
        let next_cursor = if page.len() == limit {
            page.last().map(|m| m.id)
        } else {
            None
        };
        Ok(MessagePage {
            messages: page,
            next_cursor,
        })
    }

    async fn recent_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
    ) -> CoreResult<Vec<Message>> {
        let messages = self.messages.lock();
        let mut filtered: Vec<Message> = messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        filtered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let skip = filtered.len().saturating_sub(limit);
        Ok(filtered.into_iter().skip(skip).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corpora_models::chunk::{ChunkMetadata, ChunkType};

    fn record(kb: Uuid, doc: Uuid, index: i32, dense: Vec<f32>) -> VectorRecord {
        VectorRecord {
            chunk_id: Chunk::derive_id(&doc, index),
            document_id: doc,
            knowledge_base_id: kb,
            dense,
            sparse: None,
            keywords: vec![],
            content: format!("chunk {}", index),
            chunk_type: ChunkType::Text,
            chunk_index: index,
        }
    }

    #[tokio::test]
    async fn dense_search_ranks_by_cosine() {
        let store = MemoryVectorStore::new();
        let kb = Uuid::new_v4();
        let doc = Uuid::new_v4();
        store.create_collection(kb, 2).await.unwrap();
        store
            .upsert_batch(
                kb,
                &[
                    record(kb, doc, 0, vec![1.0, 0.0]),
                    record(kb, doc, 1, vec![0.0, 1.0]),
                ],
            )
            .await
            .unwrap();

        let hits = store
            .search_dense(kb, &[1.0, 0.0], 2, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_index, 0);
        assert!(hits[0].score > 0.99);
    }

    #[tokio::test]
    async fn upsert_is_idempotent_by_chunk_id() {
        let store = MemoryVectorStore::new();
        let kb = Uuid::new_v4();
        let doc = Uuid::new_v4();
        store.create_collection(kb, 2).await.unwrap();
        let rec = record(kb, doc, 0, vec![1.0, 0.0]);
        store.upsert_batch(kb, &[rec.clone()]).await.unwrap();
        store.upsert_batch(kb, &[rec]).await.unwrap();
        assert_eq!(store.vector_count(kb), 1);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_permanent() {
        let store = MemoryVectorStore::new();
        let kb = Uuid::new_v4();
        store.create_collection(kb, 4).await.unwrap();
        let err = store
            .upsert_batch(kb, &[record(kb, Uuid::new_v4(), 0, vec![1.0, 0.0])])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "permanent");
    }

    #[tokio::test]
    async fn delete_by_filter_cascades_document_vectors() {
        let store = MemoryVectorStore::new();
        let kb = Uuid::new_v4();
        let keep = Uuid::new_v4();
        let remove = Uuid::new_v4();
        store.create_collection(kb, 2).await.unwrap();
        store
            .upsert_batch(
                kb,
                &[
                    record(kb, keep, 0, vec![1.0, 0.0]),
                    record(kb, remove, 0, vec![0.0, 1.0]),
                ],
            )
            .await
            .unwrap();

        store
            .delete_by_filter(
                kb,
                &FilterExpr::eq("document_id", json!(remove.to_string())),
            )
            .await
            .unwrap();
        assert_eq!(store.vector_count(kb), 1);
    }

    #[tokio::test]
    async fn entity_merge_unions_sources_and_keeps_max_confidence() {
        let store = MemoryGraphStore::new();
        let kb = Uuid::new_v4();
        let chunk_a = Uuid::new_v4();
        let chunk_b = Uuid::new_v4();

        let first = Entity {
            id: Uuid::new_v4(),
            knowledge_base_id: kb,
            name: "Apple Inc.".into(),
            entity_type: EntityType::Organization,
            confidence: 0.7,
            source_chunk_ids: vec![chunk_a],
        };
        let second = Entity {
            id: Uuid::new_v4(),
            knowledge_base_id: kb,
            name: "apple inc.".into(),
            entity_type: EntityType::Organization,
            confidence: 0.9,
            source_chunk_ids: vec![chunk_b],
        };

        let id_first = store.upsert_entity(&first).await.unwrap();
        let id_second = store.upsert_entity(&second).await.unwrap();
        assert_eq!(id_first, id_second);
        assert_eq!(store.entity_count(kb).await.unwrap(), 1);

        let found = store
            .find_entities(kb, "Apple", &[], 10)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!((found[0].confidence - 0.9).abs() < 1e-6);
        assert_eq!(found[0].source_chunk_ids.len(), 2);
    }

    #[tokio::test]
    async fn relation_requires_existing_endpoints() {
        let store = MemoryGraphStore::new();
        let kb = Uuid::new_v4();
        let relation = Relation {
            source: Uuid::new_v4(),
            target: Uuid::new_v4(),
            relation_type: RelationType::Founded,
            confidence: 0.8,
            source_chunk_id: Uuid::new_v4(),
        };
        let err = store.upsert_relation(kb, &relation).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn traverse_one_hop_finds_neighbor() {
        let store = MemoryGraphStore::new();
        let kb = Uuid::new_v4();
        let chunk = Uuid::new_v4();

        let org = Entity {
            id: Uuid::new_v4(),
            knowledge_base_id: kb,
            name: "Apple Inc.".into(),
            entity_type: EntityType::Organization,
            confidence: 0.9,
            source_chunk_ids: vec![chunk],
        };
        let person = Entity {
            id: Uuid::new_v4(),
            knowledge_base_id: kb,
            name: "Steve Jobs".into(),
            entity_type: EntityType::Person,
            confidence: 0.9,
            source_chunk_ids: vec![chunk],
        };
        let org_id = store.upsert_entity(&org).await.unwrap();
        let person_id = store.upsert_entity(&person).await.unwrap();
        store
            .upsert_relation(
                kb,
                &Relation {
                    source: person_id,
                    target: org_id,
                    relation_type: RelationType::Founded,
                    confidence: 0.8,
                    source_chunk_id: chunk,
                },
            )
            .await
            .unwrap();

        let paths = store
            .traverse(kb, "Apple Inc.", 1, &[], 10)
            .await
            .unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].terminal().name, "Steve Jobs");
    }

    #[tokio::test]
    async fn duplicate_chunk_ordinal_conflicts() {
        let store = MemoryMetadataStore::new();
        let kb = Uuid::new_v4();
        let doc = Uuid::new_v4();
        let chunk = |index: i32| Chunk {
            id: Chunk::derive_id(&doc, index),
            document_id: doc,
            knowledge_base_id: kb,
            chunk_index: index,
            start_offset: 0,
            end_offset: 10,
            content: "text".into(),
            content_hash: "h".into(),
            chunk_type: ChunkType::Text,
            metadata: ChunkMetadata::default(),
        };
        store.insert_chunks(&[chunk(0)]).await.unwrap();
        let err = store.insert_chunks(&[chunk(0)]).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn replace_chunks_returns_removed_ids() {
        let store = MemoryMetadataStore::new();
        let kb = Uuid::new_v4();
        let doc = Uuid::new_v4();
        let chunk = |index: i32, content: &str| Chunk {
            id: Chunk::derive_id(&doc, index),
            document_id: doc,
            knowledge_base_id: kb,
            chunk_index: index,
            start_offset: 0,
            end_offset: content.len() as u32,
            content: content.into(),
            content_hash: content.into(),
            chunk_type: ChunkType::Text,
            metadata: ChunkMetadata::default(),
        };
        store
            .insert_chunks(&[chunk(0, "old a"), chunk(1, "old b")])
            .await
            .unwrap();
        let removed = store
            .replace_chunks(doc, &[chunk(0, "new a")])
            .await
            .unwrap();
        assert_eq!(removed.len(), 2);
        let remaining = store.chunks_by_document(doc).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].content, "new a");
    }

    #[tokio::test]
    async fn soft_deleted_kb_hides_documents() {
        let store = MemoryMetadataStore::new();
        let kb_id = Uuid::new_v4();
        let now = Utc::now();
        store
            .create_knowledge_base(&KnowledgeBase {
                id: kb_id,
                name: "demo".into(),
                owner: "tester".into(),
                visibility: corpora_models::knowledge::Visibility::Private,
                allowed_file_types: vec![],
                size_limit_bytes: 1024,
                config: json!({}),
                is_deleted: false,
                deleted_at: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        let doc_id = Uuid::new_v4();
        store
            .insert_document(&Document {
                id: doc_id,
                knowledge_base_id: kb_id,
                filename: "a.txt".into(),
                content_type: "text/plain".into(),
                byte_length: 10,
                content_hash: "h".into(),
                status: ProcessingStatus::Completed,
                error_message: None,
                chunk_count: 0,
                is_deleted: false,
                deleted_at: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        store.soft_delete_knowledge_base(kb_id).await.unwrap();
        assert!(store.get_knowledge_base(kb_id).await.is_err());
        assert!(store.get_document(doc_id).await.is_err());
    }

    #[tokio::test]
    async fn message_pagination_with_cursor() {
        let store = MemoryMetadataStore::new();
        let conversation_id = Uuid::new_v4();
        for i in 0..5 {
            store
                .insert_message(&Message {
                    id: Uuid::new_v4(),
                    conversation_id,
                    role: corpora_models::conversation::MessageRole::User,
                    content: corpora_models::conversation::MessageContent::text(format!("m{}", i)),
                    parent_message_id: None,
                    usage: None,
                    cancelled: false,
                    created_at: Utc::now() + chrono::Duration::milliseconds(i),
                })
                .await
                .unwrap();
        }

        let first = store.list_messages(conversation_id, 2, None).await.unwrap();
        assert_eq!(first.messages.len(), 2);
        let cursor = first.next_cursor.unwrap();
        let second = store
            .list_messages(conversation_id, 2, Some(cursor))
            .await
            .unwrap();
        assert_eq!(second.messages[0].content.text, "m2");
    }
}

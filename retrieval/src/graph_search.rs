//! Graph-walk retrieval: query entities -> traversal -> context chunks.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use corpora_ai::sparse;
use corpora_models::graph::Entity;
use corpora_models::search::{RetrievedChunk, SearchMode};
use corpora_models::CoreResult;
use corpora_storage::{GraphStore, MetadataStore};

const MAX_QUERY_ENTITIES: usize = 4;
const MAX_HOPS: usize = 2;
const TRAVERSAL_LIMIT: usize = 16;

/// Candidate entity mentions in a query: capitalized spans first, then
/// content-bearing tokens as a fallback.
pub fn query_candidates(query: &str) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for token in query.split_whitespace() {
        let cleaned = token.trim_matches(|c: char| c.is_ascii_punctuation() && c != '.');
        let capitalized = cleaned
            .chars()
            .next()
            .map(|c| c.is_uppercase())
            .unwrap_or(false);
        if capitalized && !cleaned.is_empty() {
            current.push(cleaned);
        } else if !current.is_empty() {
            candidates.push(current.join(" "));
            current.clear();
        }
    }
    if !current.is_empty() {
        candidates.push(current.join(" "));
    }

    // Fallback to plain tokens so lowercase queries still reach the graph.
    for token in sparse::tokenize(query) {
        if !candidates.iter().any(|c| c.eq_ignore_ascii_case(&token)) {
            candidates.push(token);
        }
    }

    candidates.truncate(MAX_QUERY_ENTITIES * 2);
    candidates
}

/// Run graph retrieval for a query. Chunks are scored by entity confidence
/// times the product of edge confidences along the path that reached them.
pub async fn graph_search(
    graph: &Arc<dyn GraphStore>,
    metadata: &Arc<dyn MetadataStore>,
    kb_id: Uuid,
    query: &str,
    top_k: usize,
) -> CoreResult<Vec<RetrievedChunk>> {
    if top_k == 0 {
        return Ok(Vec::new());
    }

    // Resolve candidates to known entities.
    let mut entities: Vec<Entity> = Vec::new();
    for candidate in query_candidates(query) {
        let found = graph.find_entities(kb_id, &candidate, &[], 2).await?;
        for entity in found {
            if !entities.iter().any(|e| e.id == entity.id) {
                entities.push(entity);
            }
        }
        if entities.len() >= MAX_QUERY_ENTITIES {
            break;
        }
    }
    if entities.is_empty() {
        return Ok(Vec::new());
    }
    debug!(matched = entities.len(), "graph search matched query entities");

    // Score chunk ids: direct mentions at full entity confidence, traversal
    // hits discounted by the path's edge weights.
    let mut chunk_scores: HashMap<Uuid, f32> = HashMap::new();
    for entity in &entities {
        for chunk_id in &entity.source_chunk_ids {
            let score = entity.confidence;
            chunk_scores
                .entry(*chunk_id)
                .and_modify(|s| *s = s.max(score))
                .or_insert(score);
        }

        let paths = graph
            .traverse(kb_id, &entity.name, MAX_HOPS, &[], TRAVERSAL_LIMIT)
            .await?;
        for path in paths {
            let weight = entity.confidence * path.edge_weight_product();
            let terminal = path.terminal();
            for chunk_id in &terminal.source_chunk_ids {
                chunk_scores
                    .entry(*chunk_id)
                    .and_modify(|s| *s = s.max(weight))
                    .or_insert(weight);
            }
        }
    }

    // Materialize chunk content from the metadata store.
    let ids: Vec<Uuid> = chunk_scores.keys().copied().collect();
    let chunks = metadata.chunks_by_ids(&ids).await?;

    let mut results: Vec<RetrievedChunk> = chunks
        .into_iter()
        .map(|chunk| {
            let score = chunk_scores.get(&chunk.id).copied().unwrap_or(0.0);
            RetrievedChunk {
                chunk_id: chunk.id,
                document_id: chunk.document_id,
                knowledge_base_id: chunk.knowledge_base_id,
                chunk_index: chunk.chunk_index,
                content: chunk.content,
                score: score.clamp(0.0, 1.0),
                chunk_type: chunk.chunk_type,
                matched_modes: vec![SearchMode::Graph],
                metadata: serde_json::to_value(&chunk.metadata).unwrap_or_default(),
            }
        })
        .collect();

    crate::fusion::sort_stable(&mut results);
    results.truncate(top_k);
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capitalized_spans_come_first() {
        let candidates = query_candidates("Who founded Apple Inc. in California?");
        assert_eq!(candidates[0], "Who");
        assert!(candidates.contains(&"Apple Inc.".to_string()));
        assert!(candidates.contains(&"California".to_string()));
    }

    #[test]
    fn lowercase_queries_fall_back_to_tokens() {
        let candidates = query_candidates("capital of france");
        assert!(candidates.contains(&"capital".to_string()));
        assert!(candidates.contains(&"france".to_string()));
    }
}

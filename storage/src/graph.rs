//! Knowledge-graph store façade backed by Neo4j.
//!
//! Entities are `(:Entity)` nodes keyed by the `(kb_id, name, type)` natural
//! key and merged on insert; relations are typed edges merged after both
//! endpoints exist. Merges for the same natural key are serialized through a
//! striped lock so concurrent ingests cannot create duplicate entities.

use std::collections::VecDeque;

use async_trait::async_trait;
use neo4rs::{query, ConfigBuilder, Graph};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use corpora_config::StoreConfig;
use corpora_models::graph::{Entity, EntityType, GraphPath, PathSegment, Relation, RelationType};
use corpora_models::{CoreError, CoreResult};

use crate::error::classify_neo4j;

const MERGE_STRIPES: usize = 64;

/// Narrow interface over the knowledge-graph store.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Merge-on-insert by natural key; returns the canonical entity id.
    async fn upsert_entity(&self, entity: &Entity) -> CoreResult<Uuid>;

    /// Both endpoints must already exist; missing endpoints are `NotFound`.
    async fn upsert_relation(&self, kb_id: Uuid, relation: &Relation) -> CoreResult<()>;

    async fn find_entities(
        &self,
        kb_id: Uuid,
        name_or_pattern: &str,
        types: &[EntityType],
        limit: usize,
    ) -> CoreResult<Vec<Entity>>;

    /// Breadth-first traversal from a named entity, up to `max_hops` edges.
    async fn traverse(
        &self,
        kb_id: Uuid,
        start_entity: &str,
        max_hops: usize,
        relation_filter: &[RelationType],
        limit: usize,
    ) -> CoreResult<Vec<GraphPath>>;

    /// Chunk ids that mentioned the entity, newest-first, up to `limit`.
    async fn context_chunk_ids(
        &self,
        kb_id: Uuid,
        entity_name: &str,
        limit: usize,
    ) -> CoreResult<Vec<Uuid>>;

    /// Remove chunk references (re-ingest path); entities left without
    /// sources are deleted along with their edges.
    async fn remove_chunk_refs(&self, kb_id: Uuid, chunk_ids: &[Uuid]) -> CoreResult<()>;

    /// Drop the whole subgraph of a knowledge base.
    async fn delete_knowledge_base(&self, kb_id: Uuid) -> CoreResult<()>;

    async fn entity_count(&self, kb_id: Uuid) -> CoreResult<u64>;
}

/// Striped locks serializing merges per natural key.
pub(crate) struct MergeLocks {
    stripes: Vec<Mutex<()>>,
}

impl MergeLocks {
    pub fn new() -> Self {
        Self {
            stripes: (0..MERGE_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn stripe(&self, natural_key: &str) -> &Mutex<()> {
        let digest = Sha256::digest(natural_key.as_bytes());
        let index = (digest[0] as usize) % self.stripes.len();
        &self.stripes[index]
    }
}

/// Cypher list literal from uuids; uuid formatting is hex + dashes, safe to
/// inline.
fn uuid_list_literal(ids: &[Uuid]) -> String {
    let quoted: Vec<String> = ids.iter().map(|id| format!("'{}'", id)).collect();
    format!("[{}]", quoted.join(", "))
}

pub struct Neo4jGraphStore {
    graph: Graph,
    merge_locks: MergeLocks,
}

impl Neo4jGraphStore {
    /// Connect and verify the connection with a round trip.
    pub async fn connect(config: &StoreConfig) -> CoreResult<Self> {
        info!(uri = %config.neo4j_uri, "connecting to graph store");
        let neo4j_config = ConfigBuilder::default()
            .uri(&config.neo4j_uri)
            .user(&config.neo4j_user)
            .password(&config.neo4j_password)
            .db("neo4j")
            .fetch_size(500)
            .max_connections(10)
            .build()
            .map_err(classify_neo4j)?;

        let graph = Graph::connect(neo4j_config).await.map_err(classify_neo4j)?;

        let mut result = graph
            .execute(query("RETURN 1 as probe"))
            .await
            .map_err(classify_neo4j)?;
        result.next().await.map_err(classify_neo4j)?;

        Ok(Self {
            graph,
            merge_locks: MergeLocks::new(),
        })
    }

    fn entity_from_row(row: &neo4rs::Row) -> CoreResult<Entity> {
        let id: String = row.get("id").map_err(|e| classify_neo4j(neo4rs::Error::DeserializationError(e)))?;
        let kb_id: String = row.get("kb_id").map_err(|e| classify_neo4j(neo4rs::Error::DeserializationError(e)))?;
        let name: String = row.get("name").map_err(|e| classify_neo4j(neo4rs::Error::DeserializationError(e)))?;
        let entity_type: String = row
            .get("entity_type")
            .map_err(|e| classify_neo4j(neo4rs::Error::DeserializationError(e)))?;
        let confidence: f64 = row.get("confidence").map_err(|e| classify_neo4j(neo4rs::Error::DeserializationError(e)))?;
        let source_chunks: Vec<String> = row
            .get("source_chunks")
            .map_err(|e| classify_neo4j(neo4rs::Error::DeserializationError(e)))?;

        Ok(Entity {
            id: id
                .parse()
                .map_err(|_| CoreError::Permanent(format!("malformed entity id {}", id)))?,
            knowledge_base_id: kb_id
                .parse()
                .map_err(|_| CoreError::Permanent(format!("malformed kb id {}", kb_id)))?,
            name,
            entity_type: EntityType::parse(&entity_type)
                .ok_or_else(|| CoreError::Permanent(format!("unknown entity type {}", entity_type)))?,
            confidence: confidence as f32,
            source_chunk_ids: source_chunks.iter().filter_map(|s| s.parse().ok()).collect(),
        })
    }

    const ENTITY_RETURN: &'static str = "RETURN e.id as id, e.kb_id as kb_id, e.name as name, \
         e.entity_type as entity_type, e.confidence as confidence, \
         e.source_chunks as source_chunks";

    /// Outgoing and incoming neighbors of one entity, one hop.
    async fn neighbors(
        &self,
        kb_id: Uuid,
        entity_name_lc: &str,
    ) -> CoreResult<Vec<(RelationType, f32, Entity)>> {
        let cypher = "MATCH (a:Entity {kb_id: $kb_id, name_lc: $name})-[r]-(e:Entity) \
             RETURN type(r) as rel_type, r.confidence as rel_confidence, \
             e.id as id, e.kb_id as kb_id, e.name as name, \
             e.entity_type as entity_type, e.confidence as confidence, \
             e.source_chunks as source_chunks";
        let mut result = self
            .graph
            .execute(
                query(cypher)
                    .param("kb_id", kb_id.to_string())
                    .param("name", entity_name_lc),
            )
            .await
            .map_err(classify_neo4j)?;

        let mut neighbors = Vec::new();
        while let Some(row) = result.next().await.map_err(classify_neo4j)? {
            let rel_type: String = row.get("rel_type").map_err(|e| classify_neo4j(neo4rs::Error::DeserializationError(e)))?;
            let rel_confidence: f64 = row
                .get("rel_confidence")
                .map_err(|e| classify_neo4j(neo4rs::Error::DeserializationError(e)))?;
            let Some(relation_type) = RelationType::parse(&rel_type) else {
                continue;
            };
            let entity = Self::entity_from_row(&row)?;
            neighbors.push((relation_type, rel_confidence as f32, entity));
        }
        Ok(neighbors)
    }

    async fn get_entity(&self, kb_id: Uuid, name_lc: &str) -> CoreResult<Option<Entity>> {
        let cypher = format!(
            "MATCH (e:Entity {{kb_id: $kb_id, name_lc: $name}}) {} LIMIT 1",
            Self::ENTITY_RETURN
        );
        let mut result = self
            .graph
            .execute(
                query(&cypher)
                    .param("kb_id", kb_id.to_string())
                    .param("name", name_lc),
            )
            .await
            .map_err(classify_neo4j)?;

        match result.next().await.map_err(classify_neo4j)? {
            Some(row) => Ok(Some(Self::entity_from_row(&row)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl GraphStore for Neo4jGraphStore {
    async fn upsert_entity(&self, entity: &Entity) -> CoreResult<Uuid> {
        let natural_key = entity.natural_key();
        let _guard = self.merge_locks.stripe(&natural_key).lock().await;

        // Merge on the natural key: keep max confidence, union source chunks.
        let cypher = format!(
            "MERGE (e:Entity {{kb_id: $kb_id, name_lc: $name_lc, entity_type: $entity_type}}) \
             ON CREATE SET e.id = $id, e.name = $name, e.confidence = $confidence, \
                           e.source_chunks = {chunks} \
             ON MATCH SET e.confidence = CASE WHEN $confidence > e.confidence \
                                              THEN $confidence ELSE e.confidence END, \
                          e.source_chunks = e.source_chunks + \
                              [c IN {chunks} WHERE NOT c IN e.source_chunks] \
             RETURN e.id as id",
            chunks = uuid_list_literal(&entity.source_chunk_ids)
        );

        let mut result = self
            .graph
            .execute(
                query(&cypher)
                    .param("kb_id", entity.knowledge_base_id.to_string())
                    .param("name_lc", entity.name.to_lowercase())
                    .param("entity_type", entity.entity_type.as_str())
                    .param("id", entity.id.to_string())
                    .param("name", entity.name.clone())
                    .param("confidence", entity.confidence as f64),
            )
            .await
            .map_err(classify_neo4j)?;

        let row = result
            .next()
            .await
            .map_err(classify_neo4j)?
            .ok_or_else(|| CoreError::dependency("graph_store", "merge returned no row"))?;
        let id: String = row.get("id").map_err(|e| classify_neo4j(neo4rs::Error::DeserializationError(e)))?;
        id.parse()
            .map_err(|_| CoreError::Permanent(format!("malformed entity id {}", id)))
    }

    async fn upsert_relation(&self, kb_id: Uuid, relation: &Relation) -> CoreResult<()> {
        // Relation type comes from the closed vocabulary, safe to inline.
        let cypher = format!(
            "MATCH (a:Entity {{kb_id: $kb_id, id: $source}}), \
                   (b:Entity {{kb_id: $kb_id, id: $target}}) \
             MERGE (a)-[r:{}]->(b) \
             SET r.confidence = $confidence, r.source_chunk = $source_chunk \
             RETURN count(r) as merged",
            relation.relation_type.as_str()
        );

        let mut result = self
            .graph
            .execute(
                query(&cypher)
                    .param("kb_id", kb_id.to_string())
                    .param("source", relation.source.to_string())
                    .param("target", relation.target.to_string())
                    .param("confidence", relation.confidence as f64)
                    .param("source_chunk", relation.source_chunk_id.to_string()),
            )
            .await
            .map_err(classify_neo4j)?;

        let row = result
            .next()
            .await
            .map_err(classify_neo4j)?
            .ok_or_else(|| CoreError::dependency("graph_store", "merge returned no row"))?;
        let merged: i64 = row.get("merged").map_err(|e| classify_neo4j(neo4rs::Error::DeserializationError(e)))?;
        if merged == 0 {
            return Err(CoreError::NotFound(format!(
                "relation endpoints missing: {} -> {}",
                relation.source, relation.target
            )));
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
        let cypher = format!(
            "MATCH (e:Entity {{kb_id: $kb_id}}) \
             WHERE e.name_lc CONTAINS $pattern {} LIMIT $limit",
            Self::ENTITY_RETURN
        );
        let mut result = self
            .graph
            .execute(
                query(&cypher)
                    .param("kb_id", kb_id.to_string())
                    .param("pattern", name_or_pattern.to_lowercase())
                    .param("limit", (limit.max(1) * 4) as i64),
            )
            .await
            .map_err(classify_neo4j)?;

        let mut entities = Vec::new();
        while let Some(row) = result.next().await.map_err(classify_neo4j)? {
            entities.push(Self::entity_from_row(&row)?);
        }

        if !types.is_empty() {
            entities.retain(|e| types.contains(&e.entity_type));
        }

        // Rank by similarity to the pattern, closest first.
        let pattern_lc = name_or_pattern.to_lowercase();
        entities.sort_by(|a, b| {
            let sim_a = strsim::jaro_winkler(&a.name.to_lowercase(), &pattern_lc);
            let sim_b = strsim::jaro_winkler(&b.name.to_lowercase(), &pattern_lc);
            sim_b.partial_cmp(&sim_a).unwrap_or(std::cmp::Ordering::Equal)
        });
        entities.truncate(limit);
        Ok(entities)
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
            .get_entity(kb_id, &start_entity.to_lowercase())
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("entity '{}' not found", start_entity)))?;

        // Iterative BFS: one-hop expansions until the hop budget is spent.
        let mut paths: Vec<GraphPath> = Vec::new();
        let mut frontier: VecDeque<GraphPath> = VecDeque::new();
        frontier.push_back(GraphPath {
            start: start.clone(),
            segments: Vec::new(),
        });
        let mut visited: Vec<Uuid> = vec![start.id];

        while let Some(path) = frontier.pop_front() {
            if paths.len() >= limit {
                break;
            }
            if path.segments.len() >= max_hops {
                continue;
            }
            let tip = path.terminal().clone();
            for (relation_type, confidence, neighbor) in
                self.neighbors(kb_id, &tip.name.to_lowercase()).await?
            {
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
                frontier.push_back(extended);
            }
        }

        paths.truncate(limit);
        debug!(start = %start_entity, hops = max_hops, found = paths.len(), "graph traversal");
        Ok(paths)
    }

    async fn context_chunk_ids(
        &self,
        kb_id: Uuid,
        entity_name: &str,
        limit: usize,
    ) -> CoreResult<Vec<Uuid>> {
        let entity = self
            .get_entity(kb_id, &entity_name.to_lowercase())
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("entity '{}' not found", entity_name)))?;
        Ok(entity.source_chunk_ids.into_iter().take(limit).collect())
    }

    async fn remove_chunk_refs(&self, kb_id: Uuid, chunk_ids: &[Uuid]) -> CoreResult<()> {
        if chunk_ids.is_empty() {
            return Ok(());
        }
        let removed = uuid_list_literal(chunk_ids);
        let cypher = format!(
            "MATCH (e:Entity {{kb_id: $kb_id}}) \
             SET e.source_chunks = [c IN e.source_chunks WHERE NOT c IN {removed}] \
             WITH e WHERE size(e.source_chunks) = 0 \
             DETACH DELETE e"
        );
        self.graph
            .run(query(&cypher).param("kb_id", kb_id.to_string()))
            .await
            .map_err(classify_neo4j)?;
        Ok(())
    }

    async fn delete_knowledge_base(&self, kb_id: Uuid) -> CoreResult<()> {
        self.graph
            .run(
                query("MATCH (e:Entity {kb_id: $kb_id}) DETACH DELETE e")
                    .param("kb_id", kb_id.to_string()),
            )
            .await
            .map_err(classify_neo4j)?;
        info!(kb_id = %kb_id, "dropped knowledge-base subgraph");
        Ok(())
    }

    async fn entity_count(&self, kb_id: Uuid) -> CoreResult<u64> {
        let mut result = self
            .graph
            .execute(
                query("MATCH (e:Entity {kb_id: $kb_id}) RETURN count(e) as total")
                    .param("kb_id", kb_id.to_string()),
            )
            .await
            .map_err(classify_neo4j)?;
        let row = result
            .next()
            .await
            .map_err(classify_neo4j)?
            .ok_or_else(|| CoreError::dependency("graph_store", "count returned no row"))?;
        let total: i64 = row.get("total").map_err(|e| classify_neo4j(neo4rs::Error::DeserializationError(e)))?;
        Ok(total.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_list_literal_format() {
        let a = Uuid::nil();
        let literal = uuid_list_literal(&[a]);
        assert_eq!(literal, "['00000000-0000-0000-0000-000000000000']");
        assert_eq!(uuid_list_literal(&[]), "[]");
    }

    #[tokio::test]
    async fn merge_stripes_are_stable_per_key() {
        let locks = MergeLocks::new();
        let key = "kb:apple inc.:ORGANIZATION";
        let first = locks.stripe(key) as *const _;
        let second = locks.stripe(key) as *const _;
        assert_eq!(first, second);
    }
}

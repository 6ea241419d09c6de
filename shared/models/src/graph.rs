use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Entity categories extracted from chunk text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Person,
    Organization,
    Location,
    Product,
    Technology,
    Concept,
    Event,
    Date,
    Metric,
    Other,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "PERSON",
            EntityType::Organization => "ORGANIZATION",
            EntityType::Location => "LOCATION",
            EntityType::Product => "PRODUCT",
            EntityType::Technology => "TECHNOLOGY",
            EntityType::Concept => "CONCEPT",
            EntityType::Event => "EVENT",
            EntityType::Date => "DATE",
            EntityType::Metric => "METRIC",
            EntityType::Other => "OTHER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PERSON" => Some(EntityType::Person),
            "ORGANIZATION" => Some(EntityType::Organization),
            "LOCATION" => Some(EntityType::Location),
            "PRODUCT" => Some(EntityType::Product),
            "TECHNOLOGY" => Some(EntityType::Technology),
            "CONCEPT" => Some(EntityType::Concept),
            "EVENT" => Some(EntityType::Event),
            "DATE" => Some(EntityType::Date),
            "METRIC" => Some(EntityType::Metric),
            "OTHER" => Some(EntityType::Other),
            _ => None,
        }
    }
}

/// Closed vocabulary of relation types between entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationType {
    WorksFor,
    Founded,
    LocatedIn,
    PartOf,
    Produces,
    Uses,
    RelatedTo,
    Mentions,
    CompetesWith,
    SucceededBy,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::WorksFor => "WORKS_FOR",
            RelationType::Founded => "FOUNDED",
            RelationType::LocatedIn => "LOCATED_IN",
            RelationType::PartOf => "PART_OF",
            RelationType::Produces => "PRODUCES",
            RelationType::Uses => "USES",
            RelationType::RelatedTo => "RELATED_TO",
            RelationType::Mentions => "MENTIONS",
            RelationType::CompetesWith => "COMPETES_WITH",
            RelationType::SucceededBy => "SUCCEEDED_BY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WORKS_FOR" => Some(RelationType::WorksFor),
            "FOUNDED" => Some(RelationType::Founded),
            "LOCATED_IN" => Some(RelationType::LocatedIn),
            "PART_OF" => Some(RelationType::PartOf),
            "PRODUCES" => Some(RelationType::Produces),
            "USES" => Some(RelationType::Uses),
            "RELATED_TO" => Some(RelationType::RelatedTo),
            "MENTIONS" => Some(RelationType::Mentions),
            "COMPETES_WITH" => Some(RelationType::CompetesWith),
            "SUCCEEDED_BY" => Some(RelationType::SucceededBy),
            _ => None,
        }
    }
}

/// A noun extracted from one or more chunks.
///
/// Identity is the natural key `(knowledge_base_id, name, entity_type)`;
/// duplicates merge on ingest (max confidence, unioned source chunks).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub knowledge_base_id: Uuid,
    /// Canonical (trimmed, case-preserved) surface form.
    pub name: String,
    pub entity_type: EntityType,
    pub confidence: f32,
    pub source_chunk_ids: Vec<Uuid>,
}

impl Entity {
    /// The merge key used for idempotent upserts.
    pub fn natural_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.knowledge_base_id,
            self.name.to_lowercase(),
            self.entity_type.as_str()
        )
    }
}

/// A typed directed edge between two entities. Both endpoints must exist
/// before the relation is inserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relation {
    pub source: Uuid,
    pub target: Uuid,
    pub relation_type: RelationType,
    pub confidence: f32,
    pub source_chunk_id: Uuid,
}

/// One step of a traversal result: edge taken and the entity reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSegment {
    pub relation_type: RelationType,
    pub confidence: f32,
    pub entity: Entity,
}

/// A path through the graph starting at some entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphPath {
    pub start: Entity,
    pub segments: Vec<PathSegment>,
}

impl GraphPath {
    /// Product of edge confidences along the path; 1.0 for a bare start node.
    pub fn edge_weight_product(&self) -> f32 {
        self.segments.iter().map(|s| s.confidence).product()
    }

    pub fn terminal(&self) -> &Entity {
        self.segments.last().map(|s| &s.entity).unwrap_or(&self.start)
    }
}

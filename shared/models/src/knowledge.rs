use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Who can see a knowledge base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
}

/// A named document collection owned by a subject.
///
/// Deleting a knowledge base cascades to its documents, chunks, vectors and
/// graph subgraph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub id: Uuid,
    pub name: String,
    pub owner: String,
    pub visibility: Visibility,
    /// Content types accepted by ingest, e.g. "application/pdf".
    pub allowed_file_types: Vec<String>,
    /// Per-document size cap in bytes.
    pub size_limit_bytes: i64,
    /// Free-form configuration blob (chunking overrides etc).
    pub config: serde_json::Value,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateKnowledgeBaseRequest {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(length(min = 1))]
    pub owner: String,
    pub visibility: Visibility,
    #[serde(default)]
    pub allowed_file_types: Vec<String>,
    #[serde(default)]
    pub size_limit_bytes: Option<i64>,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

/// Aggregate counters for a knowledge base, computed from the metadata and
/// graph stores.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeBaseStats {
    pub document_count: u64,
    pub completed_documents: u64,
    pub failed_documents: u64,
    pub chunk_count: u64,
    pub total_bytes: u64,
    pub entity_count: u64,
}

impl KnowledgeBase {
    /// Default per-document size cap: 50 MiB.
    pub const DEFAULT_SIZE_LIMIT: i64 = 50 * 1024 * 1024;

    pub fn accepts_content_type(&self, content_type: &str) -> bool {
        if self.allowed_file_types.is_empty() {
            return true;
        }
        self.allowed_file_types
            .iter()
            .any(|allowed| content_type.eq_ignore_ascii_case(allowed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kb(allowed: Vec<&str>) -> KnowledgeBase {
        KnowledgeBase {
            id: Uuid::new_v4(),
            name: "demo".into(),
            owner: "tester".into(),
            visibility: Visibility::Private,
            allowed_file_types: allowed.into_iter().map(String::from).collect(),
            size_limit_bytes: KnowledgeBase::DEFAULT_SIZE_LIMIT,
            config: serde_json::json!({}),
            is_deleted: false,
            deleted_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn empty_allow_list_accepts_everything() {
        assert!(kb(vec![]).accepts_content_type("application/pdf"));
    }

    #[test]
    fn allow_list_is_case_insensitive() {
        let kb = kb(vec!["text/plain", "application/pdf"]);
        assert!(kb.accepts_content_type("Text/Plain"));
        assert!(!kb.accepts_content_type("image/png"));
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Processing lifecycle of an ingested document.
///
/// A document is only queryable once it reaches `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ProcessingStatus::Pending),
            "processing" => Some(ProcessingStatus::Processing),
            "completed" => Some(ProcessingStatus::Completed),
            "failed" => Some(ProcessingStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingStatus::Completed | ProcessingStatus::Failed)
    }
}

/// A stored file belonging to exactly one knowledge base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub knowledge_base_id: Uuid,
    pub filename: String,
    pub content_type: String,
    pub byte_length: i64,
    /// sha256 of the raw bytes, hex encoded; drives re-ingest deduplication.
    pub content_hash: String,
    pub status: ProcessingStatus,
    pub error_message: Option<String>,
    pub chunk_count: i32,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Named pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStage {
    Validate,
    Parse,
    Chunk,
    Embed,
    Index,
    Finalize,
}

impl IngestStage {
    pub const ALL: [IngestStage; 6] = [
        IngestStage::Validate,
        IngestStage::Parse,
        IngestStage::Chunk,
        IngestStage::Embed,
        IngestStage::Index,
        IngestStage::Finalize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStage::Validate => "validate",
            IngestStage::Parse => "parse",
            IngestStage::Chunk => "chunk",
            IngestStage::Embed => "embed",
            IngestStage::Index => "index",
            IngestStage::Finalize => "finalize",
        }
    }
}

/// Per-stage progress record, readable by external observers while a
/// document is being processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageProgress {
    pub stage: IngestStage,
    /// 0..=100 within the stage.
    pub percent: u8,
    pub updated_at: DateTime<Utc>,
}

/// Options accepted by the ingest endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestOptions {
    /// Override the chunk size for this document only.
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
    /// Skip entity/relation extraction for this document.
    #[serde(default)]
    pub skip_graph: bool,
}

/// Returned by `IngestDocument`; processing continues asynchronously.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReceipt {
    pub document_id: Uuid,
    pub task_id: Uuid,
    /// True when the upload matched an existing document by content hash and
    /// no reprocessing was scheduled.
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentStatusResponse {
    pub document_id: Uuid,
    pub status: ProcessingStatus,
    /// Overall percentage across all stages.
    pub progress_percent: u8,
    pub stage: Option<StageProgress>,
    pub chunk_count: i32,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            ProcessingStatus::Pending,
            ProcessingStatus::Processing,
            ProcessingStatus::Completed,
            ProcessingStatus::Failed,
        ] {
            assert_eq!(ProcessingStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ProcessingStatus::parse("unknown"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(ProcessingStatus::Completed.is_terminal());
        assert!(ProcessingStatus::Failed.is_terminal());
        assert!(!ProcessingStatus::Processing.is_terminal());
    }
}

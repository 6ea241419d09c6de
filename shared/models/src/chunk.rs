use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of content a chunk holds, used to route embedding profiles and
/// filterable at query time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Text,
    Table,
    Code,
    ImageCaption,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkType::Text => "text",
            ChunkType::Table => "table",
            ChunkType::Code => "code",
            ChunkType::ImageCaption => "image_caption",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(ChunkType::Text),
            "table" => Some(ChunkType::Table),
            "code" => Some(ChunkType::Code),
            "image_caption" => Some(ChunkType::ImageCaption),
            _ => None,
        }
    }
}

/// Structural metadata carried by a chunk from the parse stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Section heading path, outermost first.
    #[serde(default)]
    pub section_path: Vec<String>,
    pub page_number: Option<u32>,
    /// Anything else the parser attached.
    #[serde(default)]
    pub extra: serde_json::Value,
}

/// A contiguous slice of a document's text: the unit of retrieval.
///
/// Ordinals are dense and start at 0 per document; `(document_id, chunk_index)`
/// is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable id: uuid v5 of `document_id` + ordinal, so re-ingests of
    /// identical content produce identical ids.
    pub id: Uuid,
    pub document_id: Uuid,
    pub knowledge_base_id: Uuid,
    pub chunk_index: i32,
    /// Character span in the parsed text.
    pub start_offset: u32,
    pub end_offset: u32,
    pub content: String,
    /// sha256 of `content`, hex encoded.
    pub content_hash: String,
    pub chunk_type: ChunkType,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    /// Derive the stable chunk id from its parent document and ordinal.
    pub fn derive_id(document_id: &Uuid, chunk_index: i32) -> Uuid {
        let name = format!("{}-{}", document_id, chunk_index);
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
    }
}

/// A point in the dense-vector store. One per chunk; deletion cascades from
/// the chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub knowledge_base_id: Uuid,
    /// L2-normalized dense vector of the configured dimension.
    pub dense: Vec<f32>,
    /// Sparse lexical vector: token id -> weight.
    pub sparse: Option<BTreeMap<u32, f32>>,
    /// Keyword blob for keyword-filterable backends.
    pub keywords: Vec<String>,
    /// Content copy, so retrieval does not need a metadata-store join.
    pub content: String,
    pub chunk_type: ChunkType,
    pub chunk_index: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_ids_are_stable() {
        let doc = Uuid::new_v4();
        assert_eq!(Chunk::derive_id(&doc, 3), Chunk::derive_id(&doc, 3));
        assert_ne!(Chunk::derive_id(&doc, 3), Chunk::derive_id(&doc, 4));
    }

    #[test]
    fn chunk_type_round_trip() {
        for t in [
            ChunkType::Text,
            ChunkType::Table,
            ChunkType::Code,
            ChunkType::ImageCaption,
        ] {
            assert_eq!(ChunkType::parse(t.as_str()), Some(t));
        }
    }
}

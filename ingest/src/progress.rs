//! Per-document ingest progress, readable by external observers.

use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use corpora_models::document::{IngestStage, StageProgress};

/// Relative weight of each stage in the overall percentage.
fn stage_weight(stage: IngestStage) -> u32 {
    match stage {
        IngestStage::Validate => 5,
        IngestStage::Parse => 30,
        IngestStage::Chunk => 15,
        IngestStage::Embed => 30,
        IngestStage::Index => 15,
        IngestStage::Finalize => 5,
    }
}

/// Registry of in-flight document progress. Entries are dropped once the
/// document reaches a terminal status.
#[derive(Default)]
pub struct ProgressRegistry {
    progress: DashMap<Uuid, StageProgress>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, document_id: Uuid, stage: IngestStage, percent: u8) {
        self.progress.insert(
            document_id,
            StageProgress {
                stage,
                percent: percent.min(100),
                updated_at: Utc::now(),
            },
        );
    }

    pub fn get(&self, document_id: Uuid) -> Option<StageProgress> {
        self.progress.get(&document_id).map(|p| p.clone())
    }

    /// Overall completion across all stages, weighted.
    pub fn overall_percent(&self, document_id: Uuid) -> u8 {
        let Some(current) = self.get(document_id) else {
            return 0;
        };
        let mut completed: u32 = 0;
        for stage in IngestStage::ALL {
            if stage == current.stage {
                completed += stage_weight(stage) * current.percent as u32 / 100;
                break;
            }
            completed += stage_weight(stage);
        }
        completed.min(100) as u8
    }

    pub fn clear(&self, document_id: Uuid) {
        self.progress.remove(&document_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_cover_the_whole_pipeline() {
        let total: u32 = IngestStage::ALL.iter().map(|s| stage_weight(*s)).sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn overall_percent_advances_with_stages() {
        let registry = ProgressRegistry::new();
        let doc = Uuid::new_v4();
        assert_eq!(registry.overall_percent(doc), 0);

        registry.update(doc, IngestStage::Validate, 100);
        let after_validate = registry.overall_percent(doc);

        registry.update(doc, IngestStage::Embed, 50);
        let mid_embed = registry.overall_percent(doc);
        assert!(mid_embed > after_validate);
        assert!(mid_embed < 100);

        registry.update(doc, IngestStage::Finalize, 100);
        assert_eq!(registry.overall_percent(doc), 100);

        registry.clear(doc);
        assert!(registry.get(doc).is_none());
    }
}

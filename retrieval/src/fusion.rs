//! Weighted reciprocal-rank fusion and result deduplication.

use std::collections::HashMap;

use corpora_models::search::{RetrievedChunk, SearchMode};

/// Fuse ranked lists with weighted RRF: a chunk at rank `r` (0-based) in the
/// list for mode `m` contributes `weight(m) / (k + r + 1)`. Lists are scored
/// independently; chunks missing from a list contribute nothing, so the
/// operation is commutative over list order and associative over merging.
pub fn weighted_rrf(
    lists: Vec<(SearchMode, f32, Vec<RetrievedChunk>)>,
    rrf_k: usize,
) -> Vec<RetrievedChunk> {
    let mut fused: HashMap<(uuid::Uuid, i32), RetrievedChunk> = HashMap::new();

    for (mode, weight, hits) in lists {
        for (rank, mut hit) in hits.into_iter().enumerate() {
            let contribution = weight / (rrf_k + rank + 1) as f32;
            let key = (hit.document_id, hit.chunk_index);
            match fused.get_mut(&key) {
                Some(existing) => {
                    existing.score += contribution;
                    if !existing.matched_modes.contains(&mode) {
                        existing.matched_modes.push(mode);
                    }
                }
                None => {
                    hit.score = contribution;
                    hit.matched_modes = vec![mode];
                    fused.insert(key, hit);
                }
            }
        }
    }

    let mut results: Vec<RetrievedChunk> = fused.into_values().collect();
    sort_stable(&mut results);
    results
}

/// Merge multi-mode result sets keeping the highest score per chunk and
/// tagging each kept chunk with every mode that matched it. The winning
/// mode stays first in the tag list.
pub fn dedupe_max_score(lists: Vec<(SearchMode, Vec<RetrievedChunk>)>) -> Vec<RetrievedChunk> {
    let mut merged: HashMap<(uuid::Uuid, i32), RetrievedChunk> = HashMap::new();

    for (mode, hits) in lists {
        for mut hit in hits {
            let key = (hit.document_id, hit.chunk_index);
            match merged.get_mut(&key) {
                Some(existing) => {
                    if hit.score > existing.score {
                        hit.matched_modes = vec![mode];
                        for prior in existing.matched_modes.drain(..) {
                            if !hit.matched_modes.contains(&prior) {
                                hit.matched_modes.push(prior);
                            }
                        }
                        *existing = hit;
                    } else if !existing.matched_modes.contains(&mode) {
                        existing.matched_modes.push(mode);
                    }
                }
                None => {
                    hit.matched_modes = vec![mode];
                    merged.insert(key, hit);
                }
            }
        }
    }

    let mut results: Vec<RetrievedChunk> = merged.into_values().collect();
    sort_stable(&mut results);
    results
}

/// Score-descending with a deterministic tiebreak so equal inputs always
/// produce equal output order.
pub fn sort_stable(results: &mut [RetrievedChunk]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use corpora_models::chunk::ChunkType;
    use uuid::Uuid;

    fn hit(doc: Uuid, index: i32, score: f32) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: corpora_models::chunk::Chunk::derive_id(&doc, index),
            document_id: doc,
            knowledge_base_id: Uuid::nil(),
            chunk_index: index,
            content: format!("chunk {}", index),
            score,
            chunk_type: ChunkType::Text,
            matched_modes: vec![],
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn rrf_commutative_over_list_order() {
        let doc = Uuid::new_v4();
        let semantic = vec![hit(doc, 0, 0.9), hit(doc, 1, 0.8)];
        let sparse = vec![hit(doc, 1, 3.0), hit(doc, 2, 1.0)];

        let forward = weighted_rrf(
            vec![
                (SearchMode::Semantic, 0.6, semantic.clone()),
                (SearchMode::Sparse, 0.3, sparse.clone()),
            ],
            60,
        );
        let reverse = weighted_rrf(
            vec![
                (SearchMode::Sparse, 0.3, sparse),
                (SearchMode::Semantic, 0.6, semantic),
            ],
            60,
        );

        let keys = |r: &[RetrievedChunk]| r.iter().map(|c| c.chunk_index).collect::<Vec<_>>();
        assert_eq!(keys(&forward), keys(&reverse));
        for (a, b) in forward.iter().zip(reverse.iter()) {
            assert!((a.score - b.score).abs() < 1e-6);
        }
    }

    #[test]
    fn rrf_associative_over_merging() {
        let doc = Uuid::new_v4();
        let list_a = vec![hit(doc, 0, 1.0)];
        let list_b = vec![hit(doc, 0, 1.0), hit(doc, 1, 1.0)];
        let list_c = vec![hit(doc, 1, 1.0)];

        let all_at_once = weighted_rrf(
            vec![
                (SearchMode::Semantic, 1.0, list_a.clone()),
                (SearchMode::Sparse, 1.0, list_b.clone()),
                (SearchMode::Graph, 1.0, list_c.clone()),
            ],
            60,
        );

        // Merging (a+b) then c gives the same scores as a+(b+c): RRF only
        // sums independent per-list contributions.
        let mut expected: HashMap<i32, f32> = HashMap::new();
        for (_, _, list) in [
            (SearchMode::Semantic, 1.0, list_a),
            (SearchMode::Sparse, 1.0, list_b),
            (SearchMode::Graph, 1.0, list_c),
        ] {
            for (rank, h) in list.iter().enumerate() {
                *expected.entry(h.chunk_index).or_insert(0.0) += 1.0 / (60 + rank + 1) as f32;
            }
        }
        for result in &all_at_once {
            assert!((result.score - expected[&result.chunk_index]).abs() < 1e-6);
        }
    }

    #[test]
    fn rrf_tags_contributing_modes() {
        let doc = Uuid::new_v4();
        let fused = weighted_rrf(
            vec![
                (SearchMode::Semantic, 0.6, vec![hit(doc, 0, 0.9)]),
                (SearchMode::Sparse, 0.3, vec![hit(doc, 0, 2.0)]),
            ],
            60,
        );
        assert_eq!(fused.len(), 1);
        assert!(fused[0].matched_modes.contains(&SearchMode::Semantic));
        assert!(fused[0].matched_modes.contains(&SearchMode::Sparse));
    }

    #[test]
    fn dedupe_keeps_max_score_and_winning_mode_first() {
        let doc = Uuid::new_v4();
        let merged = dedupe_max_score(vec![
            (SearchMode::Semantic, vec![hit(doc, 0, 0.4)]),
            (SearchMode::Graph, vec![hit(doc, 0, 0.9)]),
            (SearchMode::Hybrid, vec![hit(doc, 0, 0.6)]),
        ]);
        assert_eq!(merged.len(), 1);
        assert!((merged[0].score - 0.9).abs() < 1e-6);
        assert_eq!(merged[0].matched_modes[0], SearchMode::Graph);
        assert_eq!(merged[0].matched_modes.len(), 3);
    }

    #[test]
    fn dedupe_is_by_document_and_ordinal() {
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        let merged = dedupe_max_score(vec![
            (SearchMode::Semantic, vec![hit(doc_a, 0, 0.5)]),
            (SearchMode::Sparse, vec![hit(doc_b, 0, 0.5)]),
        ]);
        assert_eq!(merged.len(), 2);
    }
}

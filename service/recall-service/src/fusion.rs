//! Weighted score fusion of keyword and semantic result lists.

use std::collections::HashMap;

use memory_model::DocId;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FusedScore {
    pub fused: f32,
    /// Keyword score normalized by the maximum in the result set.
    pub keyword: f32,
    pub semantic: f32,
}

/// Fuse independently ranked keyword and semantic lists.
///
/// Keyword scores are normalized by the maximum keyword score in the set;
/// each candidate's fused score is
/// `keyword_weight * normalized_keyword + semantic_weight * similarity`.
/// A document present in only one list contributes only that term. The
/// result is sorted by fused score descending.
pub fn fuse_scores(
    keyword: &[(DocId, f32)],
    semantic: &[(DocId, f32)],
    keyword_weight: f32,
    semantic_weight: f32,
) -> Vec<(DocId, FusedScore)> {
    let max_keyword = keyword
        .iter()
        .map(|(_, score)| *score)
        .fold(0.0f32, f32::max);

    let mut by_id: HashMap<DocId, FusedScore> = HashMap::new();
    for (id, score) in keyword {
        let normalized = if max_keyword > 0.0 {
            score / max_keyword
        } else {
            0.0
        };
        let entry = by_id.entry(*id).or_default();
        entry.keyword = normalized;
        entry.fused += keyword_weight * normalized;
    }
    for (id, similarity) in semantic {
        let entry = by_id.entry(*id).or_default();
        entry.semantic = *similarity;
        entry.fused += semantic_weight * similarity;
    }

    let mut out: Vec<(DocId, FusedScore)> = by_id.into_iter().collect();
    out.sort_by(|a, b| {
        b.1.fused
            .partial_cmp(&a.1.fused)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    out
}

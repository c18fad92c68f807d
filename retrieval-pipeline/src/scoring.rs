use std::cmp::Ordering;
use std::collections::HashMap;

use common::storage::tiers::ScoredId;

pub const fn clamp_unit(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}

/// Min-max normalize into [0,1]; a constant list maps to all ones and
/// non-finite inputs to zero.
pub fn min_max_normalize(scores: &[f32]) -> Vec<f32> {
    if scores.is_empty() {
        return Vec::new();
    }

    let mut min = f32::MAX;
    let mut max = f32::MIN;

    for s in scores {
        if !s.is_finite() {
            continue;
        }
        if *s < min {
            min = *s;
        }
        if *s > max {
            max = *s;
        }
    }

    if !min.is_finite() || !max.is_finite() {
        return scores.iter().map(|_| 0.0).collect();
    }

    if (max - min).abs() < f32::EPSILON {
        return vec![1.0; scores.len()];
    }

    scores
        .iter()
        .map(|score| {
            if score.is_finite() {
                clamp_unit((score - min) / (max - min))
            } else {
                0.0
            }
        })
        .collect()
}

/// Fused candidate out of reciprocal rank fusion, carrying the per-list raw
/// scores for debugging.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedCandidate {
    pub chunk_id: String,
    pub fused: f32,
    pub semantic: Option<f32>,
    pub fulltext: Option<f32>,
}

/// Reciprocal rank fusion over a semantic and a full-text ranked list:
/// `score(d) = Σ 1 / (k + rank)`, rank starting at 1. Commutative in the
/// order the lists are supplied; ties break on chunk id for determinism.
pub fn reciprocal_rank_fusion(
    semantic: &[ScoredId],
    fulltext: &[ScoredId],
    k: f32,
) -> Vec<FusedCandidate> {
    let mut by_id: HashMap<&str, FusedCandidate> = HashMap::new();

    for (rank, hit) in semantic.iter().enumerate() {
        let entry = by_id
            .entry(hit.chunk_id.as_str())
            .or_insert_with(|| FusedCandidate {
                chunk_id: hit.chunk_id.clone(),
                fused: 0.0,
                semantic: None,
                fulltext: None,
            });
        entry.fused += 1.0 / (k + rank as f32 + 1.0);
        entry.semantic = Some(hit.score);
    }

    for (rank, hit) in fulltext.iter().enumerate() {
        let entry = by_id
            .entry(hit.chunk_id.as_str())
            .or_insert_with(|| FusedCandidate {
                chunk_id: hit.chunk_id.clone(),
                fused: 0.0,
                semantic: None,
                fulltext: None,
            });
        entry.fused += 1.0 / (k + rank as f32 + 1.0);
        entry.fulltext = Some(hit.score);
    }

    let mut fused: Vec<FusedCandidate> = by_id.into_values().collect();
    sort_by_fused_desc(&mut fused);
    fused
}

pub fn sort_by_fused_desc(items: &mut [FusedCandidate]) {
    items.sort_by(|a, b| {
        b.fused
            .partial_cmp(&a.fused)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

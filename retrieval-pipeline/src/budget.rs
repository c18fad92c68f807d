use crate::SearchHit;

/// Estimated token cost of returning one hit.
pub fn estimated_tokens(hit: &SearchHit, per_result_overhead: usize) -> usize {
    hit.text.chars().count().div_ceil(4) + per_result_overhead
}

/// Greedily keep hits in score order until the next one would exceed the
/// budget. The surviving subset preserves its rank order.
pub fn pack(hits: Vec<SearchHit>, budget_tokens: usize, per_result_overhead: usize) -> Vec<SearchHit> {
    let mut spent = 0usize;
    let mut packed = Vec::with_capacity(hits.len());

    for hit in hits {
        let cost = estimated_tokens(&hit, per_result_overhead);
        if spent + cost > budget_tokens {
            break;
        }
        spent += cost;
        packed.push(hit);
    }

    packed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RawScores;

    fn hit(id: &str, chars: usize, score: f32) -> SearchHit {
        SearchHit {
            id: id.to_string(),
            score,
            raw_scores: RawScores::default(),
            text: "x".repeat(chars),
            file_path: "/tmp/a.md".to_string(),
            file_name: "a.md".to_string(),
            qntm_keys: vec![],
            consolidation_level: 0,
        }
    }

    #[test]
    fn packed_estimate_never_exceeds_budget() {
        let hits = vec![hit("a", 100, 0.9), hit("b", 100, 0.8), hit("c", 100, 0.7)];
        let packed = pack(hits, 60, 2);

        let total: usize = packed.iter().map(|h| estimated_tokens(h, 2)).sum();
        assert!(total <= 60);
        assert_eq!(packed.len(), 2);
    }

    #[test]
    fn packing_stops_at_first_overflow_and_keeps_rank_order() {
        let hits = vec![hit("a", 40, 0.9), hit("b", 400, 0.8), hit("c", 4, 0.7)];
        // "b" overflows; packing stops rather than skipping ahead, so the
        // returned prefix is exactly the top-ranked fit.
        let packed = pack(hits, 30, 2);
        let ids: Vec<_> = packed.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[test]
    fn zero_budget_packs_nothing() {
        let packed = pack(vec![hit("a", 10, 0.9)], 0, 2);
        assert!(packed.is_empty());
    }

    #[test]
    fn token_estimate_is_ceiling_division_plus_overhead() {
        assert_eq!(estimated_tokens(&hit("a", 9, 1.0), 8), 3 + 8);
        assert_eq!(estimated_tokens(&hit("a", 8, 1.0), 8), 2 + 8);
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use common::{
    backends::{registry::BackendRegistry, EmbeddingModality},
    error::AppError,
    storage::types::{chunk::Chunk, StoredObject},
};
use storage_coordinator::StorageCoordinator;
use tracing::debug;

/// Upper bound on chunks examined per run; keeps pair selection cheap on
/// large corpora.
const SCAN_LIMIT: usize = 256;

/// How candidate pairs are proposed. Every strategy is deterministic for a
/// given corpus state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProximityStrategy {
    /// Exact content-hash duplicates plus same-source adjacent indices.
    HashAndAdjacency,
    /// Pairwise cosine similarity over freshly embedded chunk texts, above
    /// the configured floor. Costs one embedding call per scanned chunk.
    EmbeddingSimilarity,
}

#[derive(Debug, Clone)]
pub struct CandidatePair {
    pub first: Chunk,
    pub second: Chunk,
    pub score: f32,
}

/// Load active leaf-or-merged chunks in a stable order.
async fn scan_chunks(coordinator: &StorageCoordinator) -> Result<Vec<Chunk>, AppError> {
    let mut response = coordinator
        .db()
        .client
        .query(format!(
            "SELECT * FROM {} WHERE superseded_by = NONE AND deletion_eligible = false \
             AND quarantined = false ORDER BY id ASC LIMIT {SCAN_LIMIT};",
            Chunk::table_name()
        ))
        .await
        .map_err(AppError::Database)?;
    let chunks: Vec<Chunk> = response.take(0).map_err(AppError::Database)?;
    Ok(chunks)
}

/// Orient a pair so `first.id < second.id`; keeps the output independent of
/// discovery order.
fn oriented(a: &Chunk, b: &Chunk, score: f32) -> CandidatePair {
    if a.id <= b.id {
        CandidatePair {
            first: a.clone(),
            second: b.clone(),
            score,
        }
    } else {
        CandidatePair {
            first: b.clone(),
            second: a.clone(),
            score,
        }
    }
}

fn sort_and_bound(mut pairs: Vec<CandidatePair>, max_pairs: usize) -> Vec<CandidatePair> {
    pairs.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.first.id.cmp(&b.first.id))
            .then_with(|| a.second.id.cmp(&b.second.id))
    });
    pairs.dedup_by(|a, b| a.first.id == b.first.id && a.second.id == b.second.id);
    pairs.truncate(max_pairs);
    pairs
}

pub async fn select_pairs(
    coordinator: &StorageCoordinator,
    registry: &Arc<BackendRegistry>,
    strategy: ProximityStrategy,
    similarity_floor: f32,
    max_pairs: usize,
) -> Result<Vec<CandidatePair>, AppError> {
    let chunks = scan_chunks(coordinator).await?;
    if chunks.len() < 2 {
        return Ok(Vec::new());
    }

    let pairs = match strategy {
        ProximityStrategy::HashAndAdjacency => hash_and_adjacency_pairs(&chunks),
        ProximityStrategy::EmbeddingSimilarity => {
            embedding_similarity_pairs(&chunks, registry, similarity_floor).await?
        }
    };

    let bounded = sort_and_bound(pairs, max_pairs);
    debug!(
        scanned = chunks.len(),
        pairs = bounded.len(),
        ?strategy,
        "consolidation pairs selected"
    );
    Ok(bounded)
}

fn hash_and_adjacency_pairs(chunks: &[Chunk]) -> Vec<CandidatePair> {
    let mut pairs = Vec::new();

    // Exact duplicates across sources share a content hash.
    let mut by_hash: HashMap<&str, Vec<&Chunk>> = HashMap::new();
    for chunk in chunks {
        by_hash.entry(chunk.content_hash.as_str()).or_default().push(chunk);
    }
    for group in by_hash.values() {
        for (i, a) in group.iter().enumerate() {
            for b in group.iter().skip(i + 1) {
                if a.source_id != b.source_id || a.chunk_index != b.chunk_index {
                    pairs.push(oriented(a, b, 1.0));
                }
            }
        }
    }

    // Neighbors inside one source often carry overlapping context.
    let mut by_source: HashMap<&str, Vec<&Chunk>> = HashMap::new();
    for chunk in chunks {
        by_source.entry(chunk.source_id.as_str()).or_default().push(chunk);
    }
    for group in by_source.values_mut() {
        group.sort_by_key(|chunk| chunk.chunk_index);
        for window in group.windows(2) {
            if window[1].chunk_index == window[0].chunk_index + 1 {
                pairs.push(oriented(window[0], window[1], 0.5));
            }
        }
    }

    pairs
}

async fn embedding_similarity_pairs(
    chunks: &[Chunk],
    registry: &Arc<BackendRegistry>,
    similarity_floor: f32,
) -> Result<Vec<CandidatePair>, AppError> {
    let backend = registry.embedding(EmbeddingModality::Text).await?;
    let inputs: Vec<String> = chunks
        .iter()
        .map(|chunk| chunk.payload.text().to_string())
        .collect();
    let embeddings = backend.embed(&inputs).await?;

    let mut pairs = Vec::new();
    for (i, a) in chunks.iter().enumerate() {
        for (j, b) in chunks.iter().enumerate().skip(i + 1) {
            let (Some(va), Some(vb)) = (embeddings.get(i), embeddings.get(j)) else {
                continue;
            };
            let score = cosine(va, vb);
            if score >= similarity_floor {
                pairs.push(oriented(a, b, score));
            }
        }
    }
    Ok(pairs)
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{backends::EmbeddingModality, storage::types::chunk::Chunk};

/// Write model for one named vector attached to a chunk. The record key is
/// the chunk id, so an upsert per `(modality, chunk)` is naturally
/// idempotent. Reads go through narrow row structs in the vector tier; this
/// type is only ever serialized.
#[derive(Debug, Clone, Serialize)]
pub struct VectorRecord {
    pub chunk_id: String,
    pub source_id: String,
    pub embedding: Vec<f32>,
    /// Denormalized for payload-indexed pre-filtering.
    pub qntm_keys: Vec<String>,
    pub consolidation_level: u32,
    pub created_at: DateTime<Utc>,
}

impl VectorRecord {
    pub fn for_chunk(chunk: &Chunk, embedding: Vec<f32>) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            source_id: chunk.source_id.clone(),
            embedding,
            qntm_keys: chunk.payload.v1().qntm_keys.clone(),
            consolidation_level: chunk.consolidation_level,
            created_at: chunk.created_at,
        }
    }
}

/// A `(modality, record)` pair ready for the vector tier.
#[derive(Debug, Clone, Serialize)]
pub struct VectorPoint {
    pub modality: EmbeddingModality,
    pub record: VectorRecord,
}

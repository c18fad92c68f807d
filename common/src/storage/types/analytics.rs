use uuid::Uuid;

use crate::{storage::types::chunk::Chunk, stored_object};

/// What happened to the chunk; the analytics tier is append-only so each
/// lifecycle step lands as its own row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AnalyticsEvent {
    Upsert,
    Supersede,
    Purge,
}

stored_object!(AnalyticsRow, "chunk_analytics", {
    chunk_id: String,
    source_id: String,
    event: AnalyticsEvent,
    char_count: u64,
    consolidation_level: u32,
    file_type: String
});

impl AnalyticsRow {
    pub fn for_chunk(chunk: &Chunk, event: AnalyticsEvent) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            chunk_id: chunk.id.clone(),
            source_id: chunk.source_id.clone(),
            event,
            char_count: chunk.char_count,
            consolidation_level: chunk.consolidation_level,
            file_type: chunk.payload.v1().file_type.clone(),
        }
    }
}

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::stored_object;

/// Namespace for deriving stable chunk ids from `(source_id, chunk_index)`.
const CHUNK_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0xe3, 0x7a, 0x92, 0x1f, 0x8c, 0x55, 0x4d, 0x6e, 0xa1, 0x30, 0x7f, 0x0b, 0x2d, 0x9e, 0x64,
    0xc2,
]);

/// Broad classification of the chunk body, used for embedding modality
/// selection and carried into the full-text tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Prose,
    Code,
    Binary,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prose => "prose",
            Self::Code => "code",
            Self::Binary => "binary",
        }
    }
}

/// Recorded when a chunk was synthesized by merging two parents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeProvenance {
    pub merged_from: Vec<String>,
    pub relation: String,
}

/// Versioned chunk payload. Unknown keys survive round-trips through the
/// `extra` map so older daemons can read rows written by newer ones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "version")]
pub enum ChunkPayload {
    #[serde(rename = "v1")]
    V1(ChunkPayloadV1),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkPayloadV1 {
    pub original_text: String,
    pub file_path: String,
    pub file_name: String,
    pub file_type: String,
    pub content_type: ContentKind,
    pub byte_start: u64,
    pub byte_end: u64,
    #[serde(default)]
    pub qntm_keys: Vec<String>,
    /// Modality name -> backend id that produced the stored vector.
    #[serde(default)]
    pub embedding_models: BTreeMap<String, String>,
    #[serde(default)]
    pub merge: Option<MergeProvenance>,
    #[serde(flatten, default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ChunkPayload {
    pub fn v1(&self) -> &ChunkPayloadV1 {
        match self {
            Self::V1(payload) => payload,
        }
    }

    pub fn v1_mut(&mut self) -> &mut ChunkPayloadV1 {
        match self {
            Self::V1(payload) => payload,
        }
    }

    pub fn text(&self) -> &str {
        &self.v1().original_text
    }

    pub fn file_path(&self) -> &str {
        &self.v1().file_path
    }

    pub fn qntm_keys(&self) -> &[String] {
        &self.v1().qntm_keys
    }
}

stored_object!(Chunk, "chunks", {
    source_id: String,
    chunk_index: u32,
    total_chunks: u32,
    char_count: u64,
    /// Hash of the chunk body, kept in its own column so lineage lookups do
    /// not have to unpack the payload.
    content_hash: String,
    payload: ChunkPayload,
    consolidation_level: u32,
    superseded_by: Option<String>,
    deletion_eligible: bool,
    #[serde(serialize_with = "serialize_option_datetime", deserialize_with = "deserialize_option_datetime", default)]
    deletion_marked_at: Option<DateTime<Utc>>,
    quarantined: bool
});

impl Chunk {
    /// Deterministic id from the owning source, the chunk's position, and its
    /// body hash. Unchanged re-ingests reuse ids; modified content mints a new
    /// generation while the old rows stay behind for lineage.
    pub fn id_for(source_id: &str, chunk_index: u32, content_hash: &str) -> String {
        Uuid::new_v5(
            &CHUNK_ID_NAMESPACE,
            format!("{source_id}:{chunk_index}:{content_hash}").as_bytes(),
        )
        .to_string()
    }

    pub fn new(
        source_id: String,
        chunk_index: u32,
        total_chunks: u32,
        content_hash: String,
        payload: ChunkPayloadV1,
    ) -> Self {
        let now = Utc::now();
        let char_count = payload.original_text.chars().count() as u64;
        Self {
            id: Self::id_for(&source_id, chunk_index, &content_hash),
            created_at: now,
            updated_at: now,
            source_id,
            chunk_index,
            total_chunks,
            char_count,
            content_hash,
            payload: ChunkPayload::V1(payload),
            consolidation_level: 0,
            superseded_by: None,
            deletion_eligible: false,
            deletion_marked_at: None,
            quarantined: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.superseded_by.is_none() && !self.deletion_eligible && !self.quarantined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(text: &str) -> ChunkPayloadV1 {
        ChunkPayloadV1 {
            original_text: text.to_string(),
            file_path: "/tmp/a.md".to_string(),
            file_name: "a.md".to_string(),
            file_type: "md".to_string(),
            content_type: ContentKind::Prose,
            byte_start: 0,
            byte_end: text.len() as u64,
            qntm_keys: vec![],
            embedding_models: BTreeMap::new(),
            merge: None,
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn chunk_ids_are_stable_per_source_index_and_content() {
        assert_eq!(Chunk::id_for("src", 0, "h1"), Chunk::id_for("src", 0, "h1"));
        assert_ne!(Chunk::id_for("src", 0, "h1"), Chunk::id_for("src", 1, "h1"));
        assert_ne!(Chunk::id_for("src", 0, "h1"), Chunk::id_for("other", 0, "h1"));
        // Modified content mints a new id for the same position.
        assert_ne!(Chunk::id_for("src", 0, "h1"), Chunk::id_for("src", 0, "h2"));
    }

    #[test]
    fn new_chunk_is_active_leaf() {
        let chunk = Chunk::new("src".into(), 0, 2, "hash".into(), payload("hello world"));
        assert!(chunk.is_active());
        assert_eq!(chunk.consolidation_level, 0);
        assert_eq!(chunk.char_count, 11);
        assert_eq!(chunk.total_chunks, 2);
    }

    #[test]
    fn payload_preserves_unknown_keys() {
        let mut chunk = Chunk::new("src".into(), 0, 1, "hash".into(), payload("body"));
        chunk.payload.v1_mut().extra.insert(
            "future_field".to_string(),
            serde_json::json!({"nested": true}),
        );

        let json = serde_json::to_string(&chunk).expect("serialize");
        let restored: Chunk = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(
            restored.payload.v1().extra.get("future_field"),
            chunk.payload.v1().extra.get("future_field")
        );
    }

    #[test]
    fn superseded_chunk_is_not_active() {
        let mut chunk = Chunk::new("src".into(), 0, 1, "hash".into(), payload("body"));
        chunk.superseded_by = Some(Chunk::id_for("src2", 0, "h1"));
        assert!(!chunk.is_active());
    }
}

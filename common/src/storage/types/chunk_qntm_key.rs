use uuid::Uuid;

use crate::{storage::types::qntm_key::normalize_key, stored_object};

/// Namespace for deriving join-row ids from `(chunk_id, key)`.
const CHUNK_KEY_NAMESPACE: Uuid = Uuid::from_bytes([
    0x83, 0x0f, 0x5d, 0x27, 0x9a, 0x14, 0x4c, 0xd3, 0xb6, 0x78, 0x02, 0xee, 0x41, 0x5b, 0x9c,
    0x31,
]);

stored_object!(ChunkQntmKey, "chunk_qntm_keys", {
    chunk_id: String,
    qntm_key: String
});

impl ChunkQntmKey {
    /// Deterministic join-row id so re-ingesting the same chunk upserts
    /// instead of duplicating the mapping.
    pub fn id_for(chunk_id: &str, key: &str) -> String {
        Uuid::new_v5(
            &CHUNK_KEY_NAMESPACE,
            format!("{chunk_id}\u{1f}{key}").as_bytes(),
        )
        .to_string()
    }

    pub fn new(chunk_id: &str, key: &str) -> Self {
        let now = Utc::now();
        let key = normalize_key(key);
        Self {
            id: Self::id_for(chunk_id, &key),
            created_at: now,
            updated_at: now,
            chunk_id: chunk_id.to_string(),
            qntm_key: key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_row_ids_are_deterministic() {
        assert_eq!(
            ChunkQntmKey::id_for("chunk-1", "tokio"),
            ChunkQntmKey::id_for("chunk-1", "tokio")
        );
        assert_ne!(
            ChunkQntmKey::id_for("chunk-1", "tokio"),
            ChunkQntmKey::id_for("chunk-2", "tokio")
        );
    }

    #[test]
    fn mapping_normalizes_the_key() {
        let row = ChunkQntmKey::new("chunk-1", " Tokio");
        assert_eq!(row.qntm_key, "tokio");
        assert_eq!(row.id, ChunkQntmKey::id_for("chunk-1", "tokio"));
    }
}

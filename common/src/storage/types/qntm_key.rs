use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

use crate::stored_object;

/// Namespace for deriving key record ids from the normalized key text.
const QNTM_KEY_NAMESPACE: Uuid = Uuid::from_bytes([
    0x1f, 0x44, 0xb0, 0x9c, 0x2e, 0x61, 0x4a, 0x85, 0x9b, 0x02, 0xc7, 0x3d, 0x58, 0xe1, 0x0a,
    0x76,
]);

/// Canonical form for semantic tags: NFKC, lowercased, trimmed.
pub fn normalize_key(raw: &str) -> String {
    raw.trim().nfkc().collect::<String>().to_lowercase()
}

stored_object!(QntmKey, "qntm_keys", {
    key: String,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime", default)]
    first_seen_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime", default)]
    last_seen_at: DateTime<Utc>,
    usage_count: u64,
    last_used_in_chunk_id: String
});

impl QntmKey {
    /// Record id for a key; derived from the normalized text so the same tag
    /// always addresses the same row.
    pub fn id_for(key: &str) -> String {
        Uuid::new_v5(&QNTM_KEY_NAMESPACE, normalize_key(key).as_bytes()).to_string()
    }

    pub fn new(key: &str, chunk_id: &str) -> Self {
        let now = Utc::now();
        let key = normalize_key(key);
        Self {
            id: Uuid::new_v5(&QNTM_KEY_NAMESPACE, key.as_bytes()).to_string(),
            created_at: now,
            updated_at: now,
            key,
            first_seen_at: now,
            last_seen_at: now,
            usage_count: 1,
            last_used_in_chunk_id: chunk_id.to_string(),
        }
    }
}

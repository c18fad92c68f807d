use uuid::Uuid;

use crate::stored_object;

/// Namespace for deriving stable record ids from filesystem paths.
const SOURCE_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6b, 0x1e, 0x0d, 0x2a, 0x41, 0x7c, 0x4f, 0x0b, 0x8e, 0x1d, 0x5a, 0x92, 0x3c, 0x44, 0x71,
    0x08,
]);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Active,
    Deleted,
    Ignored,
}

stored_object!(Source, "sources", {
    path: String,
    content_hash: String,
    /// Last observed modification time, unix millis.
    file_mtime: i64,
    status: SourceStatus,
    ingest_count: u32
});

impl Source {
    /// Deterministic id for a canonical absolute path. Re-ingesting the same
    /// path always addresses the same row.
    pub fn id_for_path(path: &str) -> String {
        Uuid::new_v5(&SOURCE_ID_NAMESPACE, path.as_bytes()).to_string()
    }

    pub fn new(path: String, content_hash: String, file_mtime: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Self::id_for_path(&path),
            created_at: now,
            updated_at: now,
            path,
            content_hash,
            file_mtime,
            status: SourceStatus::Active,
            ingest_count: 0,
        }
    }
}

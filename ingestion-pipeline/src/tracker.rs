use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            chunk::Chunk,
            source::{Source, SourceStatus},
            StoredObject,
        },
    },
};
use serde::Deserialize;
use surrealdb::sql::Thing;
use tracing::{debug, warn};

/// Outcome of the per-file change check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestDecision {
    New,
    Modified { reusable_chunk_ids: Vec<String> },
    Unchanged,
}

/// Per-file change detection and chunk lineage over the Metadata tier.
/// Writes for one source are serialized through a keyed mutex; reads go
/// straight to the database.
pub struct FileTracker {
    db: Arc<SurrealDbClient>,
    source_locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

#[derive(Deserialize)]
struct IdRow {
    id: Thing,
}

impl FileTracker {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self {
            db,
            source_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Serialize ingestions per source id: a second ingestion for the same
    /// path cannot begin until the first's metadata commit happened.
    pub fn source_lock(&self, source_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .source_locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(
            locks
                .entry(source_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Decide whether a file needs ingestion, given its freshly computed
    /// content hash and mtime. Any database error degrades to `New`:
    /// re-ingesting wins over staleness.
    pub async fn needs_ingestion(
        &self,
        path: &Path,
        content_hash: &str,
        file_mtime: i64,
    ) -> IngestDecision {
        let source_id = Source::id_for_path(&path.to_string_lossy());

        let source = match self.db.get_item::<Source>(&source_id).await {
            Ok(Some(source)) => source,
            Ok(None) => return IngestDecision::New,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "change check failed; ingesting anyway");
                return IngestDecision::New;
            }
        };

        if source.status == SourceStatus::Deleted {
            // The file came back after a delete; treat as brand new content.
            return IngestDecision::New;
        }

        if source.content_hash == content_hash && file_mtime <= source.file_mtime {
            return IngestDecision::Unchanged;
        }

        match self.active_chunk_ids(&source_id).await {
            Ok(reusable_chunk_ids) => IngestDecision::Modified { reusable_chunk_ids },
            Err(err) => {
                warn!(path = %path.display(), error = %err, "chunk lookup failed; ingesting as new");
                IngestDecision::New
            }
        }
    }

    /// Idempotent upsert of the source row after a successful ingestion:
    /// refreshes hash and mtime, reactivates the row, bumps the counter.
    pub async fn record_ingestion(
        &self,
        path: &Path,
        content_hash: &str,
        file_mtime: i64,
    ) -> Result<String, AppError> {
        let path_str = path.to_string_lossy().into_owned();
        let source_id = Source::id_for_path(&path_str);

        self.db
            .client
            .query(
                "UPSERT type::thing('sources', $id) SET \
                    path = $path, \
                    content_hash = $hash, \
                    file_mtime = $mtime, \
                    status = 'active', \
                    ingest_count = IF ingest_count != NONE THEN ingest_count + 1 ELSE 1 END, \
                    created_at = IF created_at != NONE THEN created_at ELSE time::now() END, \
                    updated_at = time::now();",
            )
            .bind(("id", source_id.clone()))
            .bind(("path", path_str))
            .bind(("hash", content_hash.to_string()))
            .bind(("mtime", file_mtime))
            .await
            .map_err(AppError::Database)?
            .check()
            .map_err(AppError::Database)?;

        debug!(source_id = %source_id, "ingestion recorded");
        Ok(source_id)
    }

    /// Mark a source deleted and hand back the chunk ids still attached, so
    /// the coordinator can supersede them.
    pub async fn mark_deleted(&self, path: &Path) -> Result<Vec<String>, AppError> {
        let source_id = Source::id_for_path(&path.to_string_lossy());

        self.db
            .client
            .query(
                "UPDATE type::thing('sources', $id) SET \
                    status = 'deleted', updated_at = time::now();",
            )
            .bind(("id", source_id.clone()))
            .await
            .map_err(AppError::Database)?
            .check()
            .map_err(AppError::Database)?;

        self.active_chunk_ids(&source_id).await
    }

    /// Content-hash lineage lookup against the chunks' dedicated hash column.
    pub async fn find_chunk_by_content_hash(
        &self,
        content_hash: &str,
    ) -> Result<Option<String>, AppError> {
        let mut response = self
            .db
            .client
            .query(format!(
                "SELECT id FROM {} WHERE content_hash = $hash \
                 AND superseded_by = NONE AND deletion_eligible = false LIMIT 1;",
                Chunk::table_name()
            ))
            .bind(("hash", content_hash.to_string()))
            .await
            .map_err(AppError::Database)?;
        let rows: Vec<IdRow> = response.take(0).map_err(AppError::Database)?;

        Ok(rows.into_iter().next().map(|row| row.id.id.to_raw()))
    }

    async fn active_chunk_ids(&self, source_id: &str) -> Result<Vec<String>, AppError> {
        let mut response = self
            .db
            .client
            .query(format!(
                "SELECT id FROM {} WHERE source_id = $source_id \
                 AND superseded_by = NONE AND deletion_eligible = false;",
                Chunk::table_name()
            ))
            .bind(("source_id", source_id.to_string()))
            .await
            .map_err(AppError::Database)?;
        let rows: Vec<IdRow> = response.take(0).map_err(AppError::Database)?;

        Ok(rows.into_iter().map(|row| row.id.id.to_raw()).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::path::PathBuf;

    use super::*;
    use common::storage::indexes::{ensure_schema, DEFAULT_SCHEMA_WAIT};
    use common::storage::types::chunk::{ChunkPayloadV1, ContentKind};
    use common::utils::hashing::content_hash;
    use uuid::Uuid;

    async fn setup_tracker() -> FileTracker {
        let database = Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("tracker_ns", &database)
                .await
                .expect("in-memory surrealdb"),
        );
        ensure_schema(&db, &HashMap::new(), DEFAULT_SCHEMA_WAIT)
            .await
            .expect("schema");
        FileTracker::new(db)
    }

    fn store_chunk(source_id: &str, index: u32, body: &str) -> Chunk {
        Chunk::new(
            source_id.to_string(),
            index,
            1,
            content_hash(body.as_bytes()),
            ChunkPayloadV1 {
                original_text: body.to_string(),
                file_path: "/tmp/a.md".to_string(),
                file_name: "a.md".to_string(),
                file_type: "md".to_string(),
                content_type: ContentKind::Prose,
                byte_start: 0,
                byte_end: body.len() as u64,
                qntm_keys: vec![],
                embedding_models: BTreeMap::new(),
                merge: None,
                extra: BTreeMap::new(),
            },
        )
    }

    #[tokio::test]
    async fn unknown_path_is_new() {
        let tracker = setup_tracker().await;
        let decision = tracker
            .needs_ingestion(&PathBuf::from("/tmp/fresh.md"), "hash", 100)
            .await;
        assert_eq!(decision, IngestDecision::New);
    }

    #[tokio::test]
    async fn recorded_path_with_same_hash_is_unchanged() {
        let tracker = setup_tracker().await;
        let path = PathBuf::from("/tmp/a.md");
        let hash = content_hash(b"hello world");

        tracker
            .record_ingestion(&path, &hash, 100)
            .await
            .expect("record");

        let decision = tracker.needs_ingestion(&path, &hash, 100).await;
        assert_eq!(decision, IngestDecision::Unchanged);
    }

    #[tokio::test]
    async fn changed_hash_is_modified_with_reusable_chunks() {
        let tracker = setup_tracker().await;
        let path = PathBuf::from("/tmp/a.md");
        let source_id = tracker
            .record_ingestion(&path, &content_hash(b"hello world"), 100)
            .await
            .expect("record");

        let chunk = store_chunk(&source_id, 0, "hello world");
        let chunk_id = chunk.id.clone();
        tracker.db.upsert_item(chunk).await.expect("store chunk");

        let decision = tracker
            .needs_ingestion(&path, &content_hash(b"hello universe"), 100)
            .await;
        assert_eq!(
            decision,
            IngestDecision::Modified {
                reusable_chunk_ids: vec![chunk_id]
            }
        );
    }

    #[tokio::test]
    async fn newer_mtime_with_same_hash_is_still_unchanged_until_mtime_exceeds() {
        let tracker = setup_tracker().await;
        let path = PathBuf::from("/tmp/a.md");
        let hash = content_hash(b"hello world");
        tracker
            .record_ingestion(&path, &hash, 100)
            .await
            .expect("record");

        // Strictly newer mtime forces re-ingestion even with an equal hash.
        let decision = tracker.needs_ingestion(&path, &hash, 101).await;
        assert!(matches!(decision, IngestDecision::Modified { .. }));

        // Equal mtime stays unchanged.
        let decision = tracker.needs_ingestion(&path, &hash, 100).await;
        assert_eq!(decision, IngestDecision::Unchanged);
    }

    #[tokio::test]
    async fn record_ingestion_is_idempotent_and_counts() {
        let tracker = setup_tracker().await;
        let path = PathBuf::from("/tmp/a.md");
        let hash = content_hash(b"hello");

        let id_first = tracker
            .record_ingestion(&path, &hash, 100)
            .await
            .expect("first");
        let id_second = tracker
            .record_ingestion(&path, &hash, 100)
            .await
            .expect("second");
        assert_eq!(id_first, id_second);

        let source: Source = tracker
            .db
            .get_item(&id_first)
            .await
            .expect("select")
            .expect("source row");
        assert_eq!(source.ingest_count, 2);
        assert_eq!(source.status, SourceStatus::Active);
    }

    #[tokio::test]
    async fn mark_deleted_returns_attached_chunks_and_flips_status() {
        let tracker = setup_tracker().await;
        let path = PathBuf::from("/tmp/b.md");
        let source_id = tracker
            .record_ingestion(&path, &content_hash(b"foo bar baz"), 100)
            .await
            .expect("record");

        let chunk = store_chunk(&source_id, 0, "foo bar baz");
        let chunk_id = chunk.id.clone();
        tracker.db.upsert_item(chunk).await.expect("store chunk");

        let superseded = tracker.mark_deleted(&path).await.expect("mark deleted");
        assert_eq!(superseded, vec![chunk_id]);

        let source: Source = tracker
            .db
            .get_item(&source_id)
            .await
            .expect("select")
            .expect("source row");
        assert_eq!(source.status, SourceStatus::Deleted);

        // A file reappearing after deletion reads as new.
        let decision = tracker
            .needs_ingestion(&path, &content_hash(b"foo bar baz"), 100)
            .await;
        assert_eq!(decision, IngestDecision::New);
    }

    #[tokio::test]
    async fn content_hash_lookup_finds_live_chunks_only() {
        let tracker = setup_tracker().await;
        let chunk = store_chunk("some-source", 0, "needle body");
        let hash = chunk.content_hash.clone();
        let chunk_id = chunk.id.clone();
        tracker.db.upsert_item(chunk).await.expect("store");

        let found = tracker
            .find_chunk_by_content_hash(&hash)
            .await
            .expect("lookup");
        assert_eq!(found, Some(chunk_id.clone()));

        // Superseded chunks stop matching.
        tracker
            .db
            .client
            .query(
                "UPDATE type::thing('chunks', $id) SET superseded_by = 'other', deletion_eligible = true;",
            )
            .bind(("id", chunk_id))
            .await
            .expect("update");
        let found = tracker
            .find_chunk_by_content_hash(&hash)
            .await
            .expect("lookup");
        assert_eq!(found, None);
    }

    #[tokio::test]
    async fn source_lock_is_shared_per_source() {
        let tracker = setup_tracker().await;
        let lock_a = tracker.source_lock("src-1");
        let lock_b = tracker.source_lock("src-1");
        let lock_c = tracker.source_lock("src-2");

        assert!(Arc::ptr_eq(&lock_a, &lock_b));
        assert!(!Arc::ptr_eq(&lock_a, &lock_c));
    }
}

use std::collections::{HashMap, HashSet};

use chrono::{Duration as ChronoDuration, Utc};
use common::{
    error::AppError,
    storage::types::{
        analytics::{AnalyticsEvent, AnalyticsRow},
        chunk::Chunk,
        chunk_qntm_key::ChunkQntmKey,
        fulltext_doc::FullTextDoc,
        qntm_key::QntmKey,
        StoredObject,
    },
};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::{ChunkBatch, StorageCoordinator, TierOp, UpsertReport};

/// Metadata transaction for one batch: source row, chunk rows, key counters,
/// and join rows, all or nothing.
const UPSERT_BATCH: &str = r"
    BEGIN TRANSACTION;
    UPSERT type::thing('sources', $source_id) SET
        path = $source.path,
        content_hash = $source.content_hash,
        file_mtime = $source.file_mtime,
        status = $source.status,
        ingest_count = IF ingest_count != NONE THEN ingest_count ELSE 0 END,
        created_at = IF created_at != NONE THEN created_at ELSE time::now() END,
        updated_at = time::now();
    FOR $chunk IN $chunks {
        UPSERT type::thing('chunks', $chunk.id) CONTENT $chunk;
    };
    FOR $key IN $key_rows {
        UPSERT type::thing('qntm_keys', $key.id) SET
            key = $key.key,
            usage_count = IF usage_count != NONE THEN usage_count + 1 ELSE 1 END,
            first_seen_at = IF first_seen_at != NONE THEN first_seen_at ELSE time::now() END,
            last_seen_at = time::now(),
            last_used_in_chunk_id = $key.chunk_id,
            created_at = IF created_at != NONE THEN created_at ELSE time::now() END,
            updated_at = time::now();
    };
    FOR $mapping IN $mappings {
        UPSERT type::thing('chunk_qntm_keys', $mapping.id) CONTENT $mapping;
    };
    COMMIT TRANSACTION;
";

/// Monotonic supersession: an already-superseded chunk keeps its original
/// successor, and deletion eligibility never reverts.
const SUPERSEDE_CHUNK: &str = r"
    UPDATE type::thing('chunks', $id) SET
        superseded_by = IF superseded_by != NONE THEN superseded_by ELSE $replacement END,
        deletion_eligible = true,
        deletion_marked_at = IF deletion_marked_at != NONE THEN deletion_marked_at ELSE time::now() END,
        updated_at = time::now();
";

#[derive(Serialize)]
struct KeyRowBinding {
    id: String,
    key: String,
    chunk_id: String,
}

impl StorageCoordinator {
    /// Persist a batch. The Metadata write is authoritative: it succeeds or
    /// the whole call fails. Vector, full-text, cache, and analytics writes
    /// are dispatched in parallel afterwards; their failures land in the
    /// reconcile queues, never in the caller's lap.
    #[instrument(skip_all, fields(source_id = %batch.source.id, chunks = batch.chunks.len()))]
    pub async fn upsert_batch(&self, batch: ChunkBatch) -> Result<UpsertReport, AppError> {
        let source_id = batch.source.id.clone();
        let previous = self.active_chunk_ids(&source_id).await?;

        let mut key_rows: Vec<KeyRowBinding> = Vec::new();
        let mut mappings: Vec<ChunkQntmKey> = Vec::new();
        for chunk in &batch.chunks {
            for key in chunk.payload.qntm_keys() {
                key_rows.push(KeyRowBinding {
                    id: QntmKey::id_for(key),
                    key: key.clone(),
                    chunk_id: chunk.id.clone(),
                });
                mappings.push(ChunkQntmKey::new(&chunk.id, key));
            }
        }

        self.db
            .client
            .query(UPSERT_BATCH)
            .bind(("source_id", source_id.clone()))
            .bind(("source", batch.source.clone()))
            .bind(("chunks", batch.chunks.clone()))
            .bind(("key_rows", key_rows))
            .bind(("mappings", mappings))
            .await
            .map_err(AppError::Database)?
            .check()
            .map_err(AppError::Database)?;

        // Chunk-id diff drives supersession: previously active ids missing
        // from the new generation are logically replaced (same index) or
        // orphaned (file shrank).
        let new_ids: HashSet<&str> = batch.chunks.iter().map(|c| c.id.as_str()).collect();
        let by_index: HashMap<u32, &str> = batch
            .chunks
            .iter()
            .map(|c| (c.chunk_index, c.id.as_str()))
            .collect();

        let mut superseded = Vec::new();
        for (old_id, old_index) in previous {
            if new_ids.contains(old_id.as_str()) {
                continue;
            }
            let replacement = by_index.get(&old_index).map(|id| (*id).to_string());
            superseded.push((old_id, replacement));
        }
        if !superseded.is_empty() {
            self.supersede_chunks(&superseded).await?;
        }

        self.fan_out_upserts(&batch).await;

        info!(
            source_id = %source_id,
            written = batch.chunks.len(),
            superseded = superseded.len(),
            "chunk batch persisted"
        );

        Ok(UpsertReport {
            written: batch.chunks.len(),
            superseded: superseded.into_iter().map(|(id, _)| id).collect(),
        })
    }

    /// Single-chunk variant of [`upsert_batch`] for writers that do not own a
    /// source generation (consolidation's merged chunks).
    pub async fn upsert_chunk(
        &self,
        chunk: Chunk,
        vectors: Vec<common::storage::types::vector_record::VectorPoint>,
    ) -> Result<(), AppError> {
        self.db
            .upsert_item(chunk.clone())
            .await
            .map_err(AppError::Database)?;

        let batch = ChunkBatch {
            source: self
                .db
                .get_item(&chunk.source_id)
                .await
                .map_err(AppError::Database)?
                .ok_or_else(|| {
                    AppError::Divergence(format!(
                        "chunk {} references missing source {}",
                        chunk.id, chunk.source_id
                    ))
                })?,
            chunks: vec![chunk],
            vectors,
        };
        self.fan_out_upserts(&batch).await;
        Ok(())
    }

    /// Mark chunks as logically replaced. Metadata is updated inline (with
    /// monotonic guards); the derived tiers get delete ops queued.
    pub async fn supersede_chunks(
        &self,
        pairs: &[(String, Option<String>)],
    ) -> Result<(), AppError> {
        for (old_id, replacement) in pairs {
            self.db
                .client
                .query(SUPERSEDE_CHUNK)
                .bind(("id", old_id.clone()))
                .bind(("replacement", replacement.clone()))
                .await
                .map_err(AppError::Database)?
                .check()
                .map_err(AppError::Database)?;

            self.enqueue_vector(TierOp::VectorDelete(old_id.clone()));
            self.enqueue_fulltext(TierOp::FulltextDelete(old_id.clone()));
            self.enqueue_cache(TierOp::CacheInvalidate(old_id.clone()));

            match self.db.get_item::<Chunk>(old_id).await {
                Ok(Some(chunk)) => {
                    self.enqueue_analytics(TierOp::AnalyticsAppend(Box::new(
                        AnalyticsRow::for_chunk(&chunk, AnalyticsEvent::Supersede),
                    )));
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(chunk_id = %old_id, error = %err, "failed to load chunk for analytics row");
                }
            }

            debug!(
                chunk_id = %old_id,
                replacement = replacement.as_deref().unwrap_or("none"),
                "chunk superseded"
            );
        }
        Ok(())
    }

    /// Physically purge chunks that have sat deletion-eligible beyond the
    /// grace window. Metadata and analytics rows go; the derived tiers get
    /// delete ops queued (usually redundant by now, always harmless).
    pub async fn vacuum(&self, grace: std::time::Duration) -> Result<Vec<String>, AppError> {
        #[derive(serde::Deserialize)]
        struct Row {
            id: surrealdb::sql::Thing,
        }

        let cutoff = Utc::now()
            - ChronoDuration::from_std(grace)
                .map_err(|e| AppError::Validation(format!("invalid grace window: {e}")))?;

        let mut response = self
            .db
            .client
            .query(format!(
                "SELECT id FROM {} WHERE deletion_eligible = true \
                 AND deletion_marked_at != NONE AND deletion_marked_at <= $cutoff;",
                Chunk::table_name()
            ))
            .bind(("cutoff", surrealdb::sql::Datetime::from(cutoff)))
            .await
            .map_err(AppError::Database)?;
        let rows: Vec<Row> = response.take(0).map_err(AppError::Database)?;
        let ids: Vec<String> = rows.into_iter().map(|row| row.id.id.to_raw()).collect();

        if ids.is_empty() {
            return Ok(ids);
        }

        self.db
            .client
            .query(format!(
                "DELETE FROM {} WHERE chunk_id IN $ids;",
                ChunkQntmKey::table_name()
            ))
            .query("FOR $id IN $ids { DELETE type::thing('chunks', $id); };")
            .bind(("ids", ids.clone()))
            .await
            .map_err(AppError::Database)?
            .check()
            .map_err(AppError::Database)?;

        if let Err(err) = self.tiers.analytics.purge(&ids).await {
            warn!(error = %err, "analytics purge failed; queueing");
            for id in &ids {
                self.enqueue_analytics(TierOp::AnalyticsPurge(id.clone()));
            }
        }
        for id in &ids {
            self.enqueue_vector(TierOp::VectorDelete(id.clone()));
            self.enqueue_fulltext(TierOp::FulltextDelete(id.clone()));
            self.enqueue_cache(TierOp::CacheInvalidate(id.clone()));
        }

        info!(purged = ids.len(), "vacuum removed expired chunks");
        Ok(ids)
    }

    /// Flag a chunk whose payload failed validation; it stops being served
    /// until re-ingested.
    pub async fn quarantine_chunk(&self, chunk_id: &str, reason: &str) -> Result<(), AppError> {
        warn!(chunk_id, reason, "quarantining chunk");
        self.db
            .client
            .query(
                "UPDATE type::thing('chunks', $id) SET quarantined = true, updated_at = time::now();",
            )
            .bind(("id", chunk_id.to_string()))
            .await
            .map_err(AppError::Database)?
            .check()
            .map_err(AppError::Database)?;
        self.enqueue_cache(TierOp::CacheInvalidate(chunk_id.to_string()));
        Ok(())
    }

    /// Inline fan-out after a metadata commit; each tier failure is queued,
    /// not surfaced.
    async fn fan_out_upserts(&self, batch: &ChunkBatch) {
        let docs: Vec<FullTextDoc> = batch.chunks.iter().map(FullTextDoc::from_chunk).collect();
        let analytics_rows: Vec<AnalyticsRow> = batch
            .chunks
            .iter()
            .map(|chunk| AnalyticsRow::for_chunk(chunk, AnalyticsEvent::Upsert))
            .collect();

        let vector_write = self.tiers.vector.upsert(&batch.vectors);
        let fulltext_write = self.tiers.fulltext.upsert(&docs);
        let analytics_write = self.tiers.analytics.append(&analytics_rows);
        let cache_write = async {
            for chunk in &batch.chunks {
                self.tiers.cache.insert(chunk.clone()).await;
            }
            Ok::<(), AppError>(())
        };

        let (vector_res, fulltext_res, analytics_res, cache_res) =
            tokio::join!(vector_write, fulltext_write, analytics_write, cache_write);

        if let Err(err) = vector_res {
            warn!(error = %err, "vector fan-out failed; queueing per-chunk ops");
            let mut by_chunk: HashMap<String, Vec<_>> = HashMap::new();
            for point in &batch.vectors {
                by_chunk
                    .entry(point.record.chunk_id.clone())
                    .or_default()
                    .push(point.clone());
            }
            for (_, points) in by_chunk {
                self.enqueue_vector(TierOp::VectorUpsert(points));
            }
        }
        if let Err(err) = fulltext_res {
            warn!(error = %err, "full-text fan-out failed; queueing per-doc ops");
            for doc in docs {
                self.enqueue_fulltext(TierOp::FulltextUpsert(Box::new(doc)));
            }
        }
        if let Err(err) = analytics_res {
            warn!(error = %err, "analytics fan-out failed; queueing per-row ops");
            for chunk in &batch.chunks {
                self.enqueue_analytics(TierOp::AnalyticsAppend(Box::new(
                    AnalyticsRow::for_chunk(chunk, AnalyticsEvent::Upsert),
                )));
            }
        }
        // The in-memory cache cannot fail, but keep the shape uniform.
        if let Err(err) = cache_res {
            warn!(error = %err, "cache fan-out failed; queueing inserts");
            for chunk in &batch.chunks {
                self.enqueue_cache(TierOp::CacheInsert(Box::new(chunk.clone())));
            }
        }
    }
}

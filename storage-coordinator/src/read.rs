use std::collections::HashSet;

use common::{
    backends::EmbeddingModality,
    error::AppError,
    storage::{
        tiers::{ScoredId, TierFilter},
        types::{chunk::Chunk, StoredObject},
    },
};
use serde::Deserialize;
use surrealdb::sql::Thing;
use tracing::{debug, warn};

use crate::{StorageCoordinator, TierOp};

#[derive(Deserialize)]
struct IdRow {
    id: Thing,
}

impl StorageCoordinator {
    /// Payload lookup: Cache first, Metadata on miss (filling the cache).
    /// Superseded, deletion-eligible, and quarantined chunks read as absent.
    /// A row that fails to deserialize is quarantined rather than served.
    pub async fn get_chunk(&self, chunk_id: &str) -> Result<Option<Chunk>, AppError> {
        if let Some(chunk) = self.tiers.cache.get(chunk_id).await {
            if chunk.is_active() {
                return Ok(Some(chunk));
            }
            self.tiers
                .cache
                .invalidate(std::slice::from_ref(&chunk.id))
                .await;
            return Ok(None);
        }

        match self.db.get_item::<Chunk>(chunk_id).await {
            Ok(Some(chunk)) if chunk.is_active() => {
                self.tiers.cache.insert(chunk.clone()).await;
                Ok(Some(chunk))
            }
            Ok(_) => Ok(None),
            Err(err) => {
                // A row we cannot decode is corrupt, not transient: park it.
                warn!(chunk_id, error = %err, "chunk row failed to decode");
                self.quarantine_chunk(chunk_id, "row failed to deserialize")
                    .await?;
                Ok(None)
            }
        }
    }

    /// Hydrate many ids, preserving input order; unknown ids are dropped.
    pub async fn hydrate(&self, chunk_ids: &[String]) -> Result<Vec<Chunk>, AppError> {
        let mut chunks = Vec::with_capacity(chunk_ids.len());
        for id in chunk_ids {
            if let Some(chunk) = self.get_chunk(id).await? {
                chunks.push(chunk);
            }
        }
        Ok(chunks)
    }

    /// ANN candidates, containment-checked against Metadata. A vector hit
    /// with no live Metadata row is treated as absent, logged, and healed by
    /// queueing the missing delete.
    pub async fn semantic_candidates(
        &self,
        modality: EmbeddingModality,
        embedding: Vec<f32>,
        take: usize,
        filter: &TierFilter,
    ) -> Result<Vec<ScoredId>, AppError> {
        let hits = self
            .tiers
            .vector
            .search(modality, embedding, take, filter)
            .await?;
        self.retain_live(hits, |ghost| TierOp::VectorDelete(ghost))
            .await
    }

    /// Full-text candidates with the same containment rule.
    pub async fn fulltext_candidates(
        &self,
        terms: &str,
        take: usize,
        filter: &TierFilter,
    ) -> Result<Vec<ScoredId>, AppError> {
        let hits = self.tiers.fulltext.search(terms, take, filter).await?;
        self.retain_live(hits, |ghost| TierOp::FulltextDelete(ghost))
            .await
    }

    /// Ids (and their indices) of chunks still live for a source; the input
    /// to supersession diffing.
    pub async fn active_chunk_ids(
        &self,
        source_id: &str,
    ) -> Result<Vec<(String, u32)>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            id: Thing,
            chunk_index: u32,
        }

        let mut response = self
            .db
            .client
            .query(format!(
                "SELECT id, chunk_index FROM {} WHERE source_id = $source_id \
                 AND superseded_by = NONE AND deletion_eligible = false;",
                Chunk::table_name()
            ))
            .bind(("source_id", source_id.to_string()))
            .await
            .map_err(AppError::Database)?;
        let rows: Vec<Row> = response.take(0).map_err(AppError::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| (row.id.id.to_raw(), row.chunk_index))
            .collect())
    }

    async fn retain_live(
        &self,
        hits: Vec<ScoredId>,
        ghost_op: impl Fn(String) -> TierOp,
    ) -> Result<Vec<ScoredId>, AppError> {
        if hits.is_empty() {
            return Ok(hits);
        }

        let live = self
            .live_ids(hits.iter().map(|hit| hit.chunk_id.as_str()))
            .await?;

        let mut retained = Vec::with_capacity(hits.len());
        for hit in hits {
            if live.contains(&hit.chunk_id) {
                retained.push(hit);
            } else {
                debug!(
                    chunk_id = %hit.chunk_id,
                    "tier hit without a live metadata row; treating as absent and healing"
                );
                self.enqueue_heal(ghost_op(hit.chunk_id));
            }
        }
        Ok(retained)
    }

    async fn live_ids<'a>(
        &self,
        ids: impl Iterator<Item = &'a str>,
    ) -> Result<HashSet<String>, AppError> {
        let things: Vec<Thing> = ids
            .map(|id| Thing::from((Chunk::table_name(), id)))
            .collect();

        let mut response = self
            .db
            .client
            .query(format!(
                "SELECT id FROM {} WHERE id IN $ids AND superseded_by = NONE \
                 AND deletion_eligible = false AND quarantined = false;",
                Chunk::table_name()
            ))
            .bind(("ids", things))
            .await
            .map_err(AppError::Database)?;
        let rows: Vec<IdRow> = response.take(0).map_err(AppError::Database)?;

        Ok(rows.into_iter().map(|row| row.id.id.to_raw()).collect())
    }

    fn enqueue_heal(&self, op: TierOp) {
        match &op {
            TierOp::VectorDelete(_) | TierOp::VectorUpsert(_) => self.enqueue_vector(op),
            TierOp::FulltextDelete(_) | TierOp::FulltextUpsert(_) => self.enqueue_fulltext(op),
            TierOp::CacheInsert(_) | TierOp::CacheInvalidate(_) => self.enqueue_cache(op),
            TierOp::AnalyticsAppend(_) | TierOp::AnalyticsPurge(_) => self.enqueue_analytics(op),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use common::backends::{testing::fixture_embedding, EmbeddingModality};
    use common::storage::tiers::TierFilter;
    use common::storage::types::chunk::{Chunk, ChunkPayloadV1, ContentKind};
    use common::storage::types::source::Source;
    use common::storage::types::vector_record::{VectorPoint, VectorRecord};
    use common::utils::hashing::content_hash;

    use crate::testing::memory_coordinator;
    use crate::ChunkBatch;

    fn batch_for(path: &str, body: &str) -> ChunkBatch {
        let source = Source::new(path.to_string(), content_hash(body.as_bytes()), 1_000);
        let chunk = Chunk::new(
            source.id.clone(),
            0,
            1,
            content_hash(body.as_bytes()),
            ChunkPayloadV1 {
                original_text: body.to_string(),
                file_path: path.to_string(),
                file_name: path.rsplit('/').next().unwrap_or(path).to_string(),
                file_type: "md".to_string(),
                content_type: ContentKind::Prose,
                byte_start: 0,
                byte_end: body.len() as u64,
                qntm_keys: vec![],
                embedding_models: BTreeMap::new(),
                merge: None,
                extra: BTreeMap::new(),
            },
        );
        let vectors = vec![VectorPoint {
            modality: EmbeddingModality::Text,
            record: VectorRecord::for_chunk(&chunk, fixture_embedding(body, 32)),
        }];
        ChunkBatch {
            source,
            chunks: vec![chunk],
            vectors,
        }
    }

    #[tokio::test]
    async fn hydrate_preserves_order_and_drops_unknown_ids() {
        let coordinator = memory_coordinator().await;

        let first = batch_for("/tmp/a.md", "alpha body");
        let second = batch_for("/tmp/b.md", "beta body");
        let id_a = first.chunks[0].id.clone();
        let id_b = second.chunks[0].id.clone();
        coordinator.upsert_batch(first).await.expect("first");
        coordinator.upsert_batch(second).await.expect("second");

        let chunks = coordinator
            .hydrate(&[
                id_b.clone(),
                "does-not-exist".to_string(),
                id_a.clone(),
            ])
            .await
            .expect("hydrate");

        let ids: Vec<_> = chunks.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids, vec![id_b, id_a]);
    }

    #[tokio::test]
    async fn ghost_vector_hits_are_absent_and_healed() {
        let coordinator = memory_coordinator().await;
        let batch = batch_for("/tmp/a.md", "hello world");
        let chunk_id = batch.chunks[0].id.clone();
        coordinator.upsert_batch(batch).await.expect("upsert");

        // Remove the metadata row behind the vector tier's back.
        coordinator
            .db()
            .delete_item::<Chunk>(&chunk_id)
            .await
            .expect("delete metadata row");
        // Drop the stale cache entry too; the read path would otherwise serve it.
        coordinator
            .tiers
            .cache
            .invalidate(std::slice::from_ref(&chunk_id))
            .await;

        let hits = coordinator
            .semantic_candidates(
                EmbeddingModality::Text,
                fixture_embedding("hello world", 32),
                5,
                &TierFilter::default(),
            )
            .await
            .expect("semantic candidates");
        assert!(hits.iter().all(|hit| hit.chunk_id != chunk_id));

        // The heal op drains and removes the ghost vector.
        assert!(coordinator.drain(Duration::from_secs(5)).await);
        let hits = coordinator
            .semantic_candidates(
                EmbeddingModality::Text,
                fixture_embedding("hello world", 32),
                5,
                &TierFilter::default(),
            )
            .await
            .expect("semantic candidates after heal");
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn cache_serves_repeat_hydrations() {
        let coordinator = memory_coordinator().await;
        let batch = batch_for("/tmp/a.md", "cached body");
        let chunk_id = batch.chunks[0].id.clone();
        coordinator.upsert_batch(batch).await.expect("upsert");

        let first = coordinator.get_chunk(&chunk_id).await.expect("first read");
        assert!(first.is_some());

        // Delete the metadata row; the cache still carries the hot copy, so
        // the read path keeps answering until the entry is invalidated.
        coordinator
            .db()
            .delete_item::<Chunk>(&chunk_id)
            .await
            .expect("delete row");
        let second = coordinator.get_chunk(&chunk_id).await.expect("second read");
        assert!(second.is_some());

        coordinator
            .tiers
            .cache
            .invalidate(std::slice::from_ref(&chunk_id))
            .await;
        let third = coordinator.get_chunk(&chunk_id).await.expect("third read");
        assert!(third.is_none());
    }

    #[tokio::test]
    async fn superseded_chunks_read_as_absent() {
        let coordinator = memory_coordinator().await;
        let batch = batch_for("/tmp/a.md", "old body");
        let chunk_id = batch.chunks[0].id.clone();
        coordinator.upsert_batch(batch).await.expect("upsert");

        coordinator
            .supersede_chunks(&[(chunk_id.clone(), None)])
            .await
            .expect("supersede");
        assert!(coordinator.drain(Duration::from_secs(5)).await);

        assert!(coordinator
            .get_chunk(&chunk_id)
            .await
            .expect("get")
            .is_none());
    }
}

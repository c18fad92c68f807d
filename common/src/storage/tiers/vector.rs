use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::{
    backends::EmbeddingModality,
    error::AppError,
    storage::{
        db::SurrealDbClient,
        tiers::{ScoredId, TierFilter, VectorTier},
        types::vector_record::VectorPoint,
    },
};

/// Nearest-neighbor tier backed by one Surreal table per modality, each with
/// its own HNSW index.
pub struct SurrealVectorTier {
    db: Arc<SurrealDbClient>,
}

impl SurrealVectorTier {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self { db }
    }
}

fn filter_clauses(filter: &TierFilter, sql: &mut String) {
    if !filter.qntm_keys.is_empty() {
        let _ = write!(sql, " AND qntm_keys CONTAINSANY $filter_keys");
    }
    if filter.created_after.is_some() {
        let _ = write!(sql, " AND created_at >= $created_after");
    }
    if filter.created_before.is_some() {
        let _ = write!(sql, " AND created_at <= $created_before");
    }
    if filter.max_consolidation_level.is_some() {
        let _ = write!(sql, " AND consolidation_level <= $max_level");
    }
}

#[async_trait]
impl VectorTier for SurrealVectorTier {
    async fn upsert(&self, points: &[VectorPoint]) -> Result<(), AppError> {
        for point in points {
            let table = point.modality.vector_table();
            // The chunk id doubles as the record key, so re-ingestion
            // overwrites in place.
            self.db
                .client
                .query(format!(
                    "UPSERT type::thing('{table}', $id) CONTENT $record;"
                ))
                .bind(("id", point.record.chunk_id.clone()))
                .bind(("record", point.record.clone()))
                .await
                .map_err(AppError::Database)?
                .check()
                .map_err(AppError::Database)?;

            debug!(
                chunk_id = %point.record.chunk_id,
                modality = %point.modality,
                "vector upserted"
            );
        }
        Ok(())
    }

    async fn delete(&self, chunk_ids: &[String]) -> Result<(), AppError> {
        if chunk_ids.is_empty() {
            return Ok(());
        }

        for modality in EmbeddingModality::ALL {
            let table = modality.vector_table();
            self.db
                .client
                .query(format!("DELETE FROM {table} WHERE chunk_id IN $ids;"))
                .bind(("ids", chunk_ids.to_vec()))
                .await
                .map_err(AppError::Database)?
                .check()
                .map_err(AppError::Database)?;
        }
        Ok(())
    }

    async fn search(
        &self,
        modality: EmbeddingModality,
        embedding: Vec<f32>,
        take: usize,
        filter: &TierFilter,
    ) -> Result<Vec<ScoredId>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            chunk_id: String,
            score: f32,
        }

        if take == 0 {
            return Ok(Vec::new());
        }

        let table = modality.vector_table();
        let mut sql = format!(
            "SELECT chunk_id, vector::similarity::cosine(embedding, $embedding) AS score \
             FROM {table} \
             WHERE embedding <|{take},100|> $embedding"
        );
        filter_clauses(filter, &mut sql);
        let _ = write!(sql, " ORDER BY score DESC LIMIT {take};");

        let mut query = self.db.query(sql).bind(("embedding", embedding));
        if !filter.qntm_keys.is_empty() {
            query = query.bind(("filter_keys", filter.qntm_keys.clone()));
        }
        if let Some(after) = filter.created_after {
            query = query.bind(("created_after", surrealdb::sql::Datetime::from(after)));
        }
        if let Some(before) = filter.created_before {
            query = query.bind(("created_before", surrealdb::sql::Datetime::from(before)));
        }
        if let Some(level) = filter.max_consolidation_level {
            query = query.bind(("max_level", level));
        }

        let mut response = query.await.map_err(AppError::Database)?;
        let rows: Vec<Row> = response.take::<Vec<Row>>(0).unwrap_or_default();

        Ok(rows
            .into_iter()
            .map(|row| ScoredId {
                chunk_id: row.chunk_id,
                score: row.score,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::storage::indexes::{ensure_schema, DEFAULT_SCHEMA_WAIT};
    use crate::storage::types::vector_record::VectorRecord;
    use chrono::Utc;
    use uuid::Uuid;

    async fn setup_tier() -> SurrealVectorTier {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("vector_tier_ns", &database)
            .await
            .expect("in-memory surrealdb");

        let mut dims = HashMap::new();
        dims.insert(EmbeddingModality::Text, 3);
        ensure_schema(&db, &dims, DEFAULT_SCHEMA_WAIT)
            .await
            .expect("schema");

        SurrealVectorTier::new(Arc::new(db))
    }

    fn point(chunk_id: &str, embedding: Vec<f32>, keys: Vec<String>) -> VectorPoint {
        VectorPoint {
            modality: EmbeddingModality::Text,
            record: VectorRecord {
                chunk_id: chunk_id.to_string(),
                source_id: "src".to_string(),
                embedding,
                qntm_keys: keys,
                consolidation_level: 0,
                created_at: Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn search_orders_by_similarity() {
        let tier = setup_tier().await;

        tier.upsert(&[
            point("chunk-a", vec![1.0, 0.0, 0.0], vec![]),
            point("chunk-b", vec![0.0, 1.0, 0.0], vec![]),
        ])
        .await
        .expect("upsert");

        let hits = tier
            .search(
                EmbeddingModality::Text,
                vec![0.0, 1.0, 0.0],
                2,
                &TierFilter::default(),
            )
            .await
            .expect("search");

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, "chunk-b");
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn upsert_is_idempotent_per_chunk() {
        let tier = setup_tier().await;

        tier.upsert(&[point("chunk-a", vec![1.0, 0.0, 0.0], vec![])])
            .await
            .expect("first upsert");
        tier.upsert(&[point("chunk-a", vec![0.0, 0.0, 1.0], vec![])])
            .await
            .expect("second upsert");

        let hits = tier
            .search(
                EmbeddingModality::Text,
                vec![0.0, 0.0, 1.0],
                5,
                &TierFilter::default(),
            )
            .await
            .expect("search");

        assert_eq!(hits.len(), 1, "re-upserted chunk must not duplicate");
        assert_eq!(hits[0].chunk_id, "chunk-a");
    }

    #[tokio::test]
    async fn delete_removes_all_vectors_for_chunk() {
        let tier = setup_tier().await;

        tier.upsert(&[point("chunk-a", vec![1.0, 0.0, 0.0], vec![])])
            .await
            .expect("upsert");
        tier.delete(&["chunk-a".to_string()]).await.expect("delete");

        let hits = tier
            .search(
                EmbeddingModality::Text,
                vec![1.0, 0.0, 0.0],
                5,
                &TierFilter::default(),
            )
            .await
            .expect("search");
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn qntm_key_filter_restricts_results() {
        let tier = setup_tier().await;

        tier.upsert(&[
            point("tagged", vec![1.0, 0.0, 0.0], vec!["tokio".to_string()]),
            point("untagged", vec![0.9, 0.1, 0.0], vec![]),
        ])
        .await
        .expect("upsert");

        let filter = TierFilter {
            qntm_keys: vec!["tokio".to_string()],
            ..TierFilter::default()
        };
        let hits = tier
            .search(EmbeddingModality::Text, vec![1.0, 0.0, 0.0], 5, &filter)
            .await
            .expect("search");

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "tagged");
    }
}

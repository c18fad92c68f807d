use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use surrealdb::sql::Thing;

use crate::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        tiers::{FullTextTier, ScoredId, TierFilter},
        types::{fulltext_doc::FullTextDoc, StoredObject},
    },
};

/// Keyword tier over `fulltext_docs`, ranked by Surreal's BM25 scorer.
pub struct SurrealFullTextTier {
    db: Arc<SurrealDbClient>,
}

impl SurrealFullTextTier {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl FullTextTier for SurrealFullTextTier {
    async fn upsert(&self, docs: &[FullTextDoc]) -> Result<(), AppError> {
        for doc in docs {
            self.db
                .upsert_item(doc.clone())
                .await
                .map_err(AppError::Database)?;
        }
        Ok(())
    }

    async fn delete(&self, chunk_ids: &[String]) -> Result<(), AppError> {
        if chunk_ids.is_empty() {
            return Ok(());
        }

        // Document ids equal chunk ids, so the delete is a keyed sweep.
        let things: Vec<Thing> = chunk_ids
            .iter()
            .map(|id| Thing::from((FullTextDoc::table_name(), id.as_str())))
            .collect();
        self.db
            .client
            .query("DELETE $ids;")
            .bind(("ids", things))
            .await
            .map_err(AppError::Database)?
            .check()
            .map_err(AppError::Database)?;

        Ok(())
    }

    async fn search(
        &self,
        terms: &str,
        take: usize,
        filter: &TierFilter,
    ) -> Result<Vec<ScoredId>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            id: Thing,
            score: f32,
        }

        if take == 0 || terms.trim().is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = format!(
            "SELECT id, \
             IF search::score(0) != NONE THEN search::score(0) ELSE 0 END AS score \
             FROM {table} \
             WHERE original_text @0@ $terms",
            table = FullTextDoc::table_name(),
        );
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
        let _ = write!(sql, " ORDER BY score DESC LIMIT {take};");

        let mut query = self.db.query(sql).bind(("terms", terms.to_owned()));
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

        let mut response = query
            .await
            .map_err(AppError::Database)?
            .check()
            .map_err(AppError::Database)?;
        let rows: Vec<Row> = response.take::<Vec<Row>>(0).map_err(AppError::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| ScoredId {
                chunk_id: row.id.id.to_raw(),
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
    use chrono::Utc;
    use uuid::Uuid;

    async fn setup_tier() -> SurrealFullTextTier {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("fulltext_tier_ns", &database)
            .await
            .expect("in-memory surrealdb");

        ensure_schema(&db, &HashMap::new(), DEFAULT_SCHEMA_WAIT)
            .await
            .expect("schema");

        SurrealFullTextTier::new(Arc::new(db))
    }

    fn doc(id: &str, text: &str, keys: Vec<String>) -> FullTextDoc {
        let now = Utc::now();
        FullTextDoc {
            id: id.to_string(),
            created_at: now,
            updated_at: now,
            original_text: text.to_string(),
            file_path: format!("/tmp/{id}.md"),
            file_name: format!("{id}.md"),
            qntm_keys: keys,
            file_type: "md".to_string(),
            consolidation_level: 0,
            content_type: "prose".to_string(),
        }
    }

    #[tokio::test]
    async fn search_finds_matching_document() {
        let tier = setup_tier().await;

        tier.upsert(&[
            doc("doc-rust", "rustaceans love rust and tokio", vec![]),
            doc("doc-other", "gardening for beginners", vec![]),
        ])
        .await
        .expect("upsert");

        let hits = tier
            .search("rust", 5, &TierFilter::default())
            .await
            .expect("search");

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "doc-rust");
        assert!(hits[0].score.is_finite());
    }

    #[tokio::test]
    async fn delete_removes_document_from_results() {
        let tier = setup_tier().await;

        tier.upsert(&[doc("doc-rust", "rust is fast", vec![])])
            .await
            .expect("upsert");
        tier.delete(&["doc-rust".to_string()]).await.expect("delete");

        let hits = tier
            .search("rust", 5, &TierFilter::default())
            .await
            .expect("search");
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn empty_terms_short_circuit() {
        let tier = setup_tier().await;
        let hits = tier
            .search("   ", 5, &TierFilter::default())
            .await
            .expect("search");
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn key_filter_restricts_results() {
        let tier = setup_tier().await;

        tier.upsert(&[
            doc("tagged", "async rust programming", vec!["tokio".to_string()]),
            doc("untagged", "async rust essays", vec![]),
        ])
        .await
        .expect("upsert");

        let filter = TierFilter {
            qntm_keys: vec!["tokio".to_string()],
            ..TierFilter::default()
        };
        let hits = tier.search("rust", 5, &filter).await.expect("search");

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "tagged");
    }
}

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        tiers::AnalyticsTier,
        types::{analytics::AnalyticsRow, StoredObject},
    },
};

/// Append-only columnar copy for out-of-band reporting. Writes never update
/// in place; vacuum is the only path that removes rows.
pub struct SurrealAnalyticsTier {
    db: Arc<SurrealDbClient>,
}

impl SurrealAnalyticsTier {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AnalyticsTier for SurrealAnalyticsTier {
    async fn append(&self, rows: &[AnalyticsRow]) -> Result<(), AppError> {
        for row in rows {
            self.db
                .store_item(row.clone())
                .await
                .map_err(AppError::Database)?;
        }
        Ok(())
    }

    async fn purge(&self, chunk_ids: &[String]) -> Result<(), AppError> {
        if chunk_ids.is_empty() {
            return Ok(());
        }

        self.db
            .client
            .query(format!(
                "DELETE FROM {} WHERE chunk_id IN $ids;",
                AnalyticsRow::table_name()
            ))
            .bind(("ids", chunk_ids.to_vec()))
            .await
            .map_err(AppError::Database)?
            .check()
            .map_err(AppError::Database)?;

        Ok(())
    }
}

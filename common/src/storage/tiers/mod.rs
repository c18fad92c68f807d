pub mod analytics;
pub mod cache;
pub mod fulltext;
pub mod vector;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    backends::EmbeddingModality,
    error::AppError,
    storage::types::{
        analytics::AnalyticsRow, chunk::Chunk, fulltext_doc::FullTextDoc,
        vector_record::VectorPoint,
    },
};

pub use analytics::SurrealAnalyticsTier;
pub use cache::InMemoryCacheTier;
pub use fulltext::SurrealFullTextTier;
pub use vector::SurrealVectorTier;

/// The part of a search filter a tier can evaluate inside its own query.
/// Anything beyond this is applied post-hoc by the retrieval engine.
#[derive(Debug, Clone, Default)]
pub struct TierFilter {
    /// Match chunks carrying at least one of these (normalized) keys.
    pub qntm_keys: Vec<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub max_consolidation_level: Option<u32>,
}

impl TierFilter {
    pub fn is_empty(&self) -> bool {
        self.qntm_keys.is_empty()
            && self.created_after.is_none()
            && self.created_before.is_none()
            && self.max_consolidation_level.is_none()
    }
}

/// A candidate id with the tier's native score; payloads are hydrated later.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredId {
    pub chunk_id: String,
    pub score: f32,
}

#[async_trait]
pub trait VectorTier: Send + Sync {
    fn name(&self) -> &'static str {
        "vector"
    }

    async fn upsert(&self, points: &[VectorPoint]) -> Result<(), AppError>;

    /// Remove every named vector for the given chunk ids.
    async fn delete(&self, chunk_ids: &[String]) -> Result<(), AppError>;

    async fn search(
        &self,
        modality: EmbeddingModality,
        embedding: Vec<f32>,
        take: usize,
        filter: &TierFilter,
    ) -> Result<Vec<ScoredId>, AppError>;
}

#[async_trait]
pub trait FullTextTier: Send + Sync {
    fn name(&self) -> &'static str {
        "fulltext"
    }

    async fn upsert(&self, docs: &[FullTextDoc]) -> Result<(), AppError>;

    async fn delete(&self, chunk_ids: &[String]) -> Result<(), AppError>;

    async fn search(
        &self,
        terms: &str,
        take: usize,
        filter: &TierFilter,
    ) -> Result<Vec<ScoredId>, AppError>;
}

#[async_trait]
pub trait CacheTier: Send + Sync {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn get(&self, chunk_id: &str) -> Option<Chunk>;

    async fn insert(&self, chunk: Chunk);

    async fn invalidate(&self, chunk_ids: &[String]);
}

#[async_trait]
pub trait AnalyticsTier: Send + Sync {
    fn name(&self) -> &'static str {
        "analytics"
    }

    async fn append(&self, rows: &[AnalyticsRow]) -> Result<(), AppError>;

    /// Physical removal during vacuum; the only deletion this tier sees.
    async fn purge(&self, chunk_ids: &[String]) -> Result<(), AppError>;
}

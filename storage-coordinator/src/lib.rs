#![allow(clippy::missing_docs_in_private_items)]

//! Keeps the five chunk tiers consistent: Metadata (authoritative), Vector,
//! Full-text, Cache, and Analytics. Writes commit to Metadata first; the
//! other tiers follow inline or through per-tier reconcile queues.

pub mod read;
pub mod reconcile;
pub mod write;

use std::{collections::HashMap, sync::Arc, time::Duration};

use common::{
    backends::EmbeddingModality,
    error::AppError,
    storage::{
        db::SurrealDbClient,
        indexes::{ensure_schema, DEFAULT_SCHEMA_WAIT},
        tiers::{
            InMemoryCacheTier, SurrealAnalyticsTier, SurrealFullTextTier, SurrealVectorTier,
        },
        types::{chunk::Chunk, source::Source, vector_record::VectorPoint},
    },
};
use tokio::sync::watch;

pub use reconcile::{BackpressureGauge, ReconcileQueue, TierHandles, TierHealth, TierOp};

/// One source's worth of freshly prepared rows, handed over by the ingestion
/// pipeline for persistence.
#[derive(Debug, Clone)]
pub struct ChunkBatch {
    pub source: Source,
    pub chunks: Vec<Chunk>,
    pub vectors: Vec<VectorPoint>,
}

/// What a batch write did, reported back into task progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertReport {
    pub written: usize,
    pub superseded: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub queue_high_water: usize,
    pub queue_low_water: usize,
    pub schema_wait: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            queue_high_water: 512,
            queue_low_water: 128,
            schema_wait: DEFAULT_SCHEMA_WAIT,
        }
    }
}

pub struct StorageCoordinator {
    pub(crate) db: Arc<SurrealDbClient>,
    pub(crate) tiers: TierHandles,
    gauge: Arc<BackpressureGauge>,
    vector_queue: Arc<ReconcileQueue>,
    fulltext_queue: Arc<ReconcileQueue>,
    cache_queue: Arc<ReconcileQueue>,
    analytics_queue: Arc<ReconcileQueue>,
    embedding_dimensions: HashMap<EmbeddingModality, usize>,
    settings: CoordinatorSettings,
}

impl StorageCoordinator {
    pub fn new(
        db: Arc<SurrealDbClient>,
        tiers: TierHandles,
        embedding_dimensions: HashMap<EmbeddingModality, usize>,
        settings: CoordinatorSettings,
    ) -> Self {
        let gauge = Arc::new(BackpressureGauge::new(
            settings.queue_high_water,
            settings.queue_low_water,
        ));

        let vector_queue = ReconcileQueue::spawn("vector", tiers.clone(), Arc::clone(&gauge));
        let fulltext_queue = ReconcileQueue::spawn("fulltext", tiers.clone(), Arc::clone(&gauge));
        let cache_queue = ReconcileQueue::spawn("cache", tiers.clone(), Arc::clone(&gauge));
        let analytics_queue =
            ReconcileQueue::spawn("analytics", tiers.clone(), Arc::clone(&gauge));

        Self {
            db,
            tiers,
            gauge,
            vector_queue,
            fulltext_queue,
            cache_queue,
            analytics_queue,
            embedding_dimensions,
            settings,
        }
    }

    /// Coordinator over Surreal-backed tiers plus the in-memory cache; the
    /// arrangement every non-test binary uses.
    pub fn with_surreal_tiers(
        db: Arc<SurrealDbClient>,
        cache_capacity: u64,
        cache_ttl: Duration,
        embedding_dimensions: HashMap<EmbeddingModality, usize>,
        settings: CoordinatorSettings,
    ) -> Self {
        let tiers = TierHandles {
            vector: Arc::new(SurrealVectorTier::new(Arc::clone(&db))),
            fulltext: Arc::new(SurrealFullTextTier::new(Arc::clone(&db))),
            cache: Arc::new(InMemoryCacheTier::new(cache_capacity, cache_ttl)),
            analytics: Arc::new(SurrealAnalyticsTier::new(Arc::clone(&db))),
        };
        Self::new(db, tiers, embedding_dimensions, settings)
    }

    /// Verify tables, analyzers, and indexes exist; waits out background DDL
    /// up to the configured bound. Must succeed before the daemon serves.
    pub async fn ensure_ready(&self) -> Result<(), AppError> {
        ensure_schema(&self.db, &self.embedding_dimensions, self.settings.schema_wait).await
    }

    pub fn db(&self) -> &Arc<SurrealDbClient> {
        &self.db
    }

    /// True while any reconcile queue sits above its high-water mark;
    /// ingestion dispatch subscribes and pauses.
    pub fn backpressure(&self) -> watch::Receiver<bool> {
        self.gauge.subscribe()
    }

    pub async fn tier_health(&self) -> Vec<TierHealth> {
        vec![
            self.vector_queue.health().await,
            self.fulltext_queue.health().await,
            self.cache_queue.health().await,
            self.analytics_queue.health().await,
        ]
    }

    /// Drain all reconcile queues, bounded by `deadline`. Returns whether
    /// everything caught up.
    pub async fn drain(&self, deadline: Duration) -> bool {
        let mut drained = true;
        for queue in [
            &self.vector_queue,
            &self.fulltext_queue,
            &self.cache_queue,
            &self.analytics_queue,
        ] {
            drained &= queue.drain(deadline).await;
        }
        drained
    }

    pub fn shutdown(&self) {
        for queue in [
            &self.vector_queue,
            &self.fulltext_queue,
            &self.cache_queue,
            &self.analytics_queue,
        ] {
            queue.stop();
        }
    }

    pub(crate) fn enqueue_vector(&self, op: TierOp) {
        self.vector_queue.enqueue(op, &self.gauge);
    }

    pub(crate) fn enqueue_fulltext(&self, op: TierOp) {
        self.fulltext_queue.enqueue(op, &self.gauge);
    }

    pub(crate) fn enqueue_cache(&self, op: TierOp) {
        self.cache_queue.enqueue(op, &self.gauge);
    }

    pub(crate) fn enqueue_analytics(&self, op: TierOp) {
        self.analytics_queue.enqueue(op, &self.gauge);
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    use super::*;
    use uuid::Uuid;

    /// In-memory coordinator with small fixture dimensions, schema applied.
    pub async fn memory_coordinator() -> Arc<StorageCoordinator> {
        let database = Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("coordinator_ns", &database)
                .await
                .expect("in-memory surrealdb"),
        );

        let mut dims = HashMap::new();
        dims.insert(EmbeddingModality::Text, 32);
        dims.insert(EmbeddingModality::Code, 32);

        let coordinator = StorageCoordinator::with_surreal_tiers(
            db,
            1_000,
            Duration::from_secs(60),
            dims,
            CoordinatorSettings::default(),
        );
        coordinator.ensure_ready().await.expect("schema ready");
        Arc::new(coordinator)
    }
}

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use common::{
    error::AppError,
    storage::{
        tiers::{AnalyticsTier, CacheTier, FullTextTier, VectorTier},
        types::{analytics::AnalyticsRow, chunk::Chunk, fulltext_doc::FullTextDoc,
            vector_record::VectorPoint},
    },
};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

/// Retry budget per queued op before it is parked as dead and surfaced via
/// health.
const MAX_OP_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(50);

/// A pending tier write that must eventually catch up to Metadata.
#[derive(Debug, Clone)]
pub enum TierOp {
    VectorUpsert(Vec<VectorPoint>),
    VectorDelete(String),
    FulltextUpsert(Box<FullTextDoc>),
    FulltextDelete(String),
    CacheInsert(Box<Chunk>),
    CacheInvalidate(String),
    AnalyticsAppend(Box<AnalyticsRow>),
    AnalyticsPurge(String),
}

impl TierOp {
    pub fn chunk_id(&self) -> &str {
        match self {
            Self::VectorUpsert(points) => points
                .first()
                .map_or("", |point| point.record.chunk_id.as_str()),
            Self::FulltextUpsert(doc) => &doc.id,
            Self::CacheInsert(chunk) => &chunk.id,
            Self::AnalyticsAppend(row) => &row.chunk_id,
            Self::VectorDelete(id)
            | Self::FulltextDelete(id)
            | Self::CacheInvalidate(id)
            | Self::AnalyticsPurge(id) => id,
        }
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::VectorUpsert(_)
            | Self::FulltextUpsert(_)
            | Self::CacheInsert(_)
            | Self::AnalyticsAppend(_) => "upsert",
            Self::VectorDelete(_)
            | Self::FulltextDelete(_)
            | Self::CacheInvalidate(_)
            | Self::AnalyticsPurge(_) => "delete",
        }
    }
}

struct PendingOp {
    op: TierOp,
    enqueued_at: Instant,
}

/// Shared view of every queue depth; flips the backpressure flag when any
/// tier exceeds the high-water mark and releases it once all are below low.
pub struct BackpressureGauge {
    high_water: usize,
    low_water: usize,
    depths: std::sync::Mutex<Vec<Arc<AtomicUsize>>>,
    paused: watch::Sender<bool>,
}

impl BackpressureGauge {
    pub fn new(high_water: usize, low_water: usize) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            high_water,
            low_water,
            depths: std::sync::Mutex::new(Vec::new()),
            paused,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.paused.subscribe()
    }

    fn register(&self, depth: Arc<AtomicUsize>) {
        self.depths
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(depth);
    }

    fn recheck(&self) {
        let depths = self
            .depths
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let max_depth = depths
            .iter()
            .map(|d| d.load(Ordering::Relaxed))
            .max()
            .unwrap_or(0);
        drop(depths);

        let currently_paused = *self.paused.borrow();
        if !currently_paused && max_depth > self.high_water {
            self.paused.send_replace(true);
        } else if currently_paused && max_depth <= self.low_water {
            self.paused.send_replace(false);
        }
    }
}

/// Snapshot for the `health` RPC.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TierHealth {
    pub name: String,
    pub queue_depth: usize,
    /// Milliseconds the oldest pending op has been waiting; the observable
    /// bound on tier divergence.
    pub lag_ms: u64,
    pub dead_ops: usize,
    pub last_error: Option<String>,
}

/// Multi-producer, single-consumer catch-up queue for one tier.
pub struct ReconcileQueue {
    name: &'static str,
    tx: mpsc::UnboundedSender<PendingOp>,
    depth: Arc<AtomicUsize>,
    dead_ops: Arc<AtomicUsize>,
    last_error: Arc<Mutex<Option<String>>>,
    oldest_pending: Arc<Mutex<Option<Instant>>>,
    handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// The tier handles a reconcile consumer applies ops against.
#[derive(Clone)]
pub struct TierHandles {
    pub vector: Arc<dyn VectorTier>,
    pub fulltext: Arc<dyn FullTextTier>,
    pub cache: Arc<dyn CacheTier>,
    pub analytics: Arc<dyn AnalyticsTier>,
}

async fn apply_op(tiers: &TierHandles, op: &TierOp) -> Result<(), AppError> {
    match op {
        TierOp::VectorUpsert(points) => tiers.vector.upsert(points).await,
        TierOp::VectorDelete(id) => tiers.vector.delete(std::slice::from_ref(id)).await,
        TierOp::FulltextUpsert(doc) => tiers.fulltext.upsert(std::slice::from_ref(doc)).await,
        TierOp::FulltextDelete(id) => tiers.fulltext.delete(std::slice::from_ref(id)).await,
        TierOp::CacheInsert(chunk) => {
            tiers.cache.insert((**chunk).clone()).await;
            Ok(())
        }
        TierOp::CacheInvalidate(id) => {
            tiers.cache.invalidate(std::slice::from_ref(id)).await;
            Ok(())
        }
        TierOp::AnalyticsAppend(row) => tiers.analytics.append(std::slice::from_ref(row)).await,
        TierOp::AnalyticsPurge(id) => tiers.analytics.purge(std::slice::from_ref(id)).await,
    }
}

impl ReconcileQueue {
    pub fn spawn(
        name: &'static str,
        tiers: TierHandles,
        gauge: Arc<BackpressureGauge>,
    ) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<PendingOp>();
        let depth = Arc::new(AtomicUsize::new(0));
        let dead_ops = Arc::new(AtomicUsize::new(0));
        let last_error = Arc::new(Mutex::new(None));
        let oldest_pending = Arc::new(Mutex::new(None));
        gauge.register(Arc::clone(&depth));

        let consumer_depth = Arc::clone(&depth);
        let consumer_dead = Arc::clone(&dead_ops);
        let consumer_error = Arc::clone(&last_error);
        let consumer_oldest = Arc::clone(&oldest_pending);
        let consumer_gauge = Arc::clone(&gauge);

        let handle = tokio::spawn(async move {
            while let Some(pending) = rx.recv().await {
                *consumer_oldest.lock().await = Some(pending.enqueued_at);

                let mut attempts: u32 = 0;
                loop {
                    attempts += 1;
                    match apply_op(&tiers, &pending.op).await {
                        Ok(()) => {
                            debug!(
                                tier = name,
                                chunk_id = pending.op.chunk_id(),
                                op = pending.op.kind(),
                                attempts,
                                "reconciled tier write"
                            );
                            break;
                        }
                        Err(err) if attempts < MAX_OP_ATTEMPTS => {
                            let backoff = RETRY_BASE.saturating_mul(1_u32 << (attempts - 1));
                            warn!(
                                tier = name,
                                chunk_id = pending.op.chunk_id(),
                                op = pending.op.kind(),
                                attempts,
                                error = %err,
                                "reconcile attempt failed; backing off"
                            );
                            tokio::time::sleep(backoff).await;
                        }
                        Err(err) => {
                            warn!(
                                tier = name,
                                chunk_id = pending.op.chunk_id(),
                                op = pending.op.kind(),
                                error = %err,
                                "reconcile retries exhausted; parking op"
                            );
                            consumer_dead.fetch_add(1, Ordering::Relaxed);
                            *consumer_error.lock().await = Some(err.to_string());
                            break;
                        }
                    }
                }

                let remaining = consumer_depth.fetch_sub(1, Ordering::Relaxed) - 1;
                if remaining == 0 {
                    *consumer_oldest.lock().await = None;
                }
                consumer_gauge.recheck();
            }
        });

        Arc::new(Self {
            name,
            tx,
            depth,
            dead_ops,
            last_error,
            oldest_pending,
            handle: std::sync::Mutex::new(Some(handle)),
        })
    }

    pub fn enqueue(&self, op: TierOp, gauge: &BackpressureGauge) {
        let pending = PendingOp {
            op,
            enqueued_at: Instant::now(),
        };
        if self.tx.send(pending).is_ok() {
            self.depth.fetch_add(1, Ordering::Relaxed);
            gauge.recheck();
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub async fn health(&self) -> TierHealth {
        let lag_ms = self
            .oldest_pending
            .lock()
            .await
            .map(|oldest| oldest.elapsed().as_millis() as u64)
            .unwrap_or(0);
        TierHealth {
            name: self.name.to_string(),
            queue_depth: self.depth(),
            lag_ms,
            dead_ops: self.dead_ops.load(Ordering::Relaxed),
            last_error: self.last_error.lock().await.clone(),
        }
    }

    /// Wait until the queue is empty or the deadline passes. Returns whether
    /// it fully drained.
    pub async fn drain(&self, deadline: Duration) -> bool {
        let until = Instant::now() + deadline;
        while self.depth() > 0 {
            if Instant::now() >= until {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    pub fn stop(&self) {
        if let Some(handle) = self
            .handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicBool;

    use super::*;
    use async_trait::async_trait;
    use common::backends::EmbeddingModality;
    use common::storage::tiers::{CacheTier, InMemoryCacheTier, ScoredId, TierFilter};
    use common::storage::types::chunk::{ChunkPayloadV1, ContentKind};

    fn chunk(body: &str) -> Chunk {
        Chunk::new(
            "src".to_string(),
            0,
            1,
            common::utils::hashing::content_hash(body.as_bytes()),
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

    /// Vector tier that fails while `poisoned` is set; counts delete calls.
    #[derive(Default)]
    struct FlakyVectorTier {
        poisoned: AtomicBool,
        deletes: AtomicUsize,
    }

    #[async_trait]
    impl VectorTier for FlakyVectorTier {
        async fn upsert(&self, _points: &[VectorPoint]) -> Result<(), AppError> {
            if self.poisoned.load(Ordering::Relaxed) {
                return Err(AppError::Transient("vector tier down".into()));
            }
            Ok(())
        }

        async fn delete(&self, chunk_ids: &[String]) -> Result<(), AppError> {
            if self.poisoned.load(Ordering::Relaxed) {
                return Err(AppError::Transient("vector tier down".into()));
            }
            self.deletes.fetch_add(chunk_ids.len(), Ordering::Relaxed);
            Ok(())
        }

        async fn search(
            &self,
            _modality: EmbeddingModality,
            _embedding: Vec<f32>,
            _take: usize,
            _filter: &TierFilter,
        ) -> Result<Vec<ScoredId>, AppError> {
            Ok(Vec::new())
        }
    }

    struct NoopFulltext;

    #[async_trait]
    impl common::storage::tiers::FullTextTier for NoopFulltext {
        async fn upsert(&self, _docs: &[FullTextDoc]) -> Result<(), AppError> {
            Ok(())
        }
        async fn delete(&self, _chunk_ids: &[String]) -> Result<(), AppError> {
            Ok(())
        }
        async fn search(
            &self,
            _terms: &str,
            _take: usize,
            _filter: &TierFilter,
        ) -> Result<Vec<ScoredId>, AppError> {
            Ok(Vec::new())
        }
    }

    struct NoopAnalytics;

    #[async_trait]
    impl AnalyticsTier for NoopAnalytics {
        async fn append(&self, _rows: &[AnalyticsRow]) -> Result<(), AppError> {
            Ok(())
        }
        async fn purge(&self, _chunk_ids: &[String]) -> Result<(), AppError> {
            Ok(())
        }
    }

    fn handles(vector: Arc<FlakyVectorTier>) -> TierHandles {
        TierHandles {
            vector,
            fulltext: Arc::new(NoopFulltext),
            cache: Arc::new(InMemoryCacheTier::new(16, Duration::from_secs(60))),
            analytics: Arc::new(NoopAnalytics),
        }
    }

    #[tokio::test]
    async fn queue_drains_successful_ops() {
        let vector = Arc::new(FlakyVectorTier::default());
        let gauge = Arc::new(BackpressureGauge::new(8, 2));
        let queue = ReconcileQueue::spawn("vector", handles(Arc::clone(&vector)), Arc::clone(&gauge));

        queue.enqueue(TierOp::VectorDelete("chunk-a".to_string()), &gauge);
        assert!(queue.drain(Duration::from_secs(2)).await);
        assert_eq!(vector.deletes.load(Ordering::Relaxed), 1);

        let health = queue.health().await;
        assert_eq!(health.queue_depth, 0);
        assert_eq!(health.dead_ops, 0);
        queue.stop();
    }

    #[tokio::test]
    async fn exhausted_retries_park_the_op_and_surface_in_health() {
        let vector = Arc::new(FlakyVectorTier::default());
        vector.poisoned.store(true, Ordering::Relaxed);
        let gauge = Arc::new(BackpressureGauge::new(8, 2));
        let queue = ReconcileQueue::spawn("vector", handles(Arc::clone(&vector)), Arc::clone(&gauge));

        queue.enqueue(TierOp::VectorDelete("chunk-a".to_string()), &gauge);
        assert!(queue.drain(Duration::from_secs(5)).await);

        let health = queue.health().await;
        assert_eq!(health.dead_ops, 1);
        assert!(health.last_error.is_some());
        queue.stop();
    }

    #[tokio::test]
    async fn recovered_tier_heals_later_ops() {
        let vector = Arc::new(FlakyVectorTier::default());
        vector.poisoned.store(true, Ordering::Relaxed);
        let gauge = Arc::new(BackpressureGauge::new(8, 2));
        let queue = ReconcileQueue::spawn("vector", handles(Arc::clone(&vector)), Arc::clone(&gauge));

        queue.enqueue(TierOp::VectorDelete("chunk-a".to_string()), &gauge);
        // Recover before the retry budget is spent.
        tokio::time::sleep(Duration::from_millis(20)).await;
        vector.poisoned.store(false, Ordering::Relaxed);

        assert!(queue.drain(Duration::from_secs(5)).await);
        assert_eq!(vector.deletes.load(Ordering::Relaxed), 1);
        queue.stop();
    }

    #[tokio::test]
    async fn backpressure_flips_on_high_water_and_releases_on_low() {
        let vector = Arc::new(FlakyVectorTier::default());
        vector.poisoned.store(true, Ordering::Relaxed);
        let gauge = Arc::new(BackpressureGauge::new(2, 0));
        let queue = ReconcileQueue::spawn("vector", handles(Arc::clone(&vector)), Arc::clone(&gauge));
        let mut paused = gauge.subscribe();

        for i in 0..4 {
            queue.enqueue(TierOp::VectorDelete(format!("chunk-{i}")), &gauge);
        }
        assert!(*paused.borrow_and_update() || {
            paused.changed().await.expect("watch alive");
            *paused.borrow_and_update()
        });

        vector.poisoned.store(false, Ordering::Relaxed);
        assert!(queue.drain(Duration::from_secs(5)).await);
        // Queue empty again: flag must clear.
        while *paused.borrow_and_update() {
            paused.changed().await.expect("watch alive");
        }
        queue.stop();
    }

    #[tokio::test]
    async fn cache_ops_round_trip_through_the_queue() {
        let vector = Arc::new(FlakyVectorTier::default());
        let cache = Arc::new(InMemoryCacheTier::new(16, Duration::from_secs(60)));
        let tiers = TierHandles {
            vector,
            fulltext: Arc::new(NoopFulltext),
            cache: Arc::clone(&cache) as Arc<dyn common::storage::tiers::CacheTier>,
            analytics: Arc::new(NoopAnalytics),
        };
        let gauge = Arc::new(BackpressureGauge::new(8, 2));
        let queue = ReconcileQueue::spawn("cache", tiers, Arc::clone(&gauge));

        let chunk = chunk("cache me");
        let id = chunk.id.clone();
        queue.enqueue(TierOp::CacheInsert(Box::new(chunk)), &gauge);
        assert!(queue.drain(Duration::from_secs(2)).await);
        assert!(cache.get(&id).await.is_some());

        queue.enqueue(TierOp::CacheInvalidate(id.clone()), &gauge);
        assert!(queue.drain(Duration::from_secs(2)).await);
        assert!(cache.get(&id).await.is_none());
        queue.stop();
    }
}

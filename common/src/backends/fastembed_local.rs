use std::{
    fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::available_parallelism,
};

use async_trait::async_trait;
use fastembed::{InitOptions, RerankInitOptions, TextEmbedding, TextRerank};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::debug;

use crate::{
    backends::{EmbeddingBackend, RerankScore, RerankerBackend},
    error::AppError,
};

/// Local ONNX embeddings. The model is loaded on the first readiness probe,
/// off the async runtime; inference takes the engine mutex.
pub struct LocalEmbeddingBackend {
    id: String,
    dimension: usize,
    cache_dir: Option<PathBuf>,
    engine: Mutex<Option<TextEmbedding>>,
}

impl LocalEmbeddingBackend {
    pub fn new(id: &str, dimension: usize, cache_dir: Option<PathBuf>) -> Self {
        Self {
            id: id.to_string(),
            dimension,
            cache_dir,
            engine: Mutex::new(None),
        }
    }
}

#[async_trait]
impl EmbeddingBackend for LocalEmbeddingBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn ensure_available(&self) -> Result<(), AppError> {
        let mut guard = self.engine.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let mut options = InitOptions::default();
        if let Some(dir) = &self.cache_dir {
            fs::create_dir_all(dir)?;
            options.cache_dir = dir.clone();
        }

        debug!(backend = %self.id, "loading local embedding model");
        let engine = tokio::task::spawn_blocking(move || TextEmbedding::try_new(options))
            .await?
            .map_err(|e| AppError::Transient(format!("embedding model load failed: {e}")))?;

        *guard = Some(engine);
        Ok(())
    }

    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let mut guard = self.engine.lock().await;
        let engine = guard.as_mut().ok_or_else(|| {
            AppError::InternalError("local embedding backend used before warm-up".into())
        })?;

        engine
            .embed(inputs.to_vec(), None)
            .map_err(|e| AppError::Transient(format!("local embedding failed: {e}")))
    }
}

static NEXT_ENGINE: AtomicUsize = AtomicUsize::new(0);

fn pick_engine_index(pool_len: usize) -> usize {
    let n = NEXT_ENGINE.fetch_add(1, Ordering::Relaxed);
    n % pool_len
}

fn default_pool_size() -> usize {
    available_parallelism()
        .map(|value| value.get().min(2))
        .unwrap_or(2)
        .max(1)
}

/// Local cross-encoder reranking. A small pool of engines sits behind a
/// semaphore; each call leases one engine for its duration.
pub struct LocalRerankerBackend {
    id: String,
    pool_size: usize,
    cache_dir: Option<PathBuf>,
    engines: RwLock<Vec<Arc<Mutex<TextRerank>>>>,
    semaphore: Arc<Semaphore>,
}

impl LocalRerankerBackend {
    pub fn new(id: &str, pool_size: Option<usize>, cache_dir: Option<PathBuf>) -> Self {
        let pool_size = pool_size.unwrap_or_else(default_pool_size).max(1);
        Self {
            id: id.to_string(),
            pool_size,
            cache_dir,
            engines: RwLock::new(Vec::new()),
            semaphore: Arc::new(Semaphore::new(pool_size)),
        }
    }
}

#[async_trait]
impl RerankerBackend for LocalRerankerBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn ensure_available(&self) -> Result<(), AppError> {
        {
            let engines = self.engines.read().await;
            if !engines.is_empty() {
                return Ok(());
            }
        }

        let mut engines = self.engines.write().await;
        if !engines.is_empty() {
            return Ok(());
        }

        let mut options = RerankInitOptions::default();
        if let Some(dir) = &self.cache_dir {
            fs::create_dir_all(dir)?;
            options.cache_dir = dir.clone();
        }

        for index in 0..self.pool_size {
            debug!(backend = %self.id, engine = index, "loading reranking engine");
            let engine_options = options.clone();
            let model = tokio::task::spawn_blocking(move || TextRerank::try_new(engine_options))
                .await?
                .map_err(|e| AppError::Transient(format!("reranker model load failed: {e}")))?;
            engines.push(Arc::new(Mutex::new(model)));
        }

        Ok(())
    }

    async fn rerank(
        &self,
        query: &str,
        documents: Vec<String>,
        return_documents: bool,
    ) -> Result<Vec<RerankScore>, AppError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let engine = {
            let engines = self.engines.read().await;
            if engines.is_empty() {
                return Err(AppError::InternalError(
                    "local reranker used before warm-up".into(),
                ));
            }
            let idx = pick_engine_index(engines.len());
            Arc::clone(&engines[idx])
        };

        // The permit enforces backpressure across concurrent searches.
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::Cancelled)?;

        let mut guard = engine.lock().await;
        let results = guard
            .rerank(query.to_owned(), documents, return_documents, None)
            .map_err(|e| AppError::Transient(format!("rerank failed: {e}")))?;

        Ok(results
            .into_iter()
            .map(|result| RerankScore {
                index: result.index,
                score: result.score,
                document: result.document,
            })
            .collect())
    }
}

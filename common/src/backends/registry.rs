use std::{
    collections::HashMap,
    path::PathBuf,
    str::FromStr,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    backends::{
        fastembed_local::{LocalEmbeddingBackend, LocalRerankerBackend},
        openai::{OpenAiCompletionBackend, OpenAiEmbeddingBackend},
        BackendHealth, BackendInstance, BackendStatus, Capability, CompletionBackend,
        EmbeddingBackend, EmbeddingModality, RerankerBackend,
    },
    error::AppError,
    utils::config::{BackendsConfig, ProviderConfig, RerankingConfig},
};

/// Which trait object a capability needs; one provider id can hold several
/// instances (OpenAI serves embeddings and completions as separate slots).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum InstanceKind {
    Embedding,
    Completion,
    Reranker,
}

impl InstanceKind {
    const fn for_capability(capability: Capability) -> Self {
        match capability {
            Capability::TextEmbedding
            | Capability::CodeEmbedding
            | Capability::ContextualizedEmbedding => Self::Embedding,
            Capability::JsonCompletion => Self::Completion,
            Capability::TextReranking => Self::Reranker,
        }
    }
}

enum SlotState {
    Uninit,
    Ready(BackendInstance),
    Failed {
        failures: u32,
        next_retry_at: Instant,
        last_error: String,
    },
}

struct Slot {
    state: Mutex<SlotState>,
}

type SlotKey = (String, InstanceKind);

/// Resolves capabilities to concrete backends. Instantiation is lazy and
/// guarded per slot; readiness outcomes are cached, failures retried with
/// exponential backoff on later resolutions.
pub struct BackendRegistry {
    bindings: HashMap<Capability, Vec<String>>,
    providers: HashMap<String, ProviderConfig>,
    reranking: RerankingConfig,
    data_dir: PathBuf,
    slots: std::sync::Mutex<HashMap<SlotKey, Arc<Slot>>>,
    init_order: std::sync::Mutex<Vec<SlotKey>>,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl BackendRegistry {
    pub fn new(backends: &BackendsConfig, reranking: &RerankingConfig, data_dir: &str) -> Self {
        let mut bindings = HashMap::new();
        for (capability, ids) in &backends.bindings {
            match Capability::from_str(capability) {
                Ok(parsed) => {
                    bindings.insert(parsed, ids.clone());
                }
                Err(_) => warn!(capability = %capability, "ignoring binding for unknown capability"),
            }
        }

        Self {
            bindings,
            providers: backends.providers.clone(),
            reranking: reranking.clone(),
            data_dir: PathBuf::from(data_dir),
            slots: std::sync::Mutex::new(HashMap::new()),
            init_order: std::sync::Mutex::new(Vec::new()),
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(60),
        }
    }

    /// Resolve a capability to the first bound backend that passes its
    /// readiness probe.
    pub async fn resolve(&self, capability: Capability) -> Result<BackendInstance, AppError> {
        let kind = InstanceKind::for_capability(capability);
        let Some(candidates) = self.bindings.get(&capability) else {
            return Err(AppError::CapabilityUnavailable(
                capability.as_str().to_string(),
            ));
        };

        let mut last_error: Option<String> = None;

        for backend_id in candidates {
            let slot = self.slot(backend_id, kind);
            let mut state = slot.state.lock().await;

            match &*state {
                SlotState::Ready(instance) => {
                    if instance.supports(capability) {
                        return Ok(instance.clone());
                    }
                    warn!(
                        backend = %backend_id,
                        capability = %capability,
                        "bound backend does not declare this capability; skipping"
                    );
                    continue;
                }
                SlotState::Failed {
                    next_retry_at,
                    last_error: error,
                    ..
                } if Instant::now() < *next_retry_at => {
                    last_error = Some(error.clone());
                    continue;
                }
                _ => {}
            }

            let failures = match &*state {
                SlotState::Failed { failures, .. } => *failures,
                _ => 0,
            };

            match self.probe(backend_id, kind, capability).await {
                Ok(instance) => {
                    info!(backend = %backend_id, capability = %capability, "backend ready");
                    *state = SlotState::Ready(instance.clone());
                    self.init_order
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .push((backend_id.clone(), kind));
                    return Ok(instance);
                }
                Err(err) => {
                    let failures = failures.saturating_add(1);
                    let backoff = self
                        .backoff_base
                        .saturating_mul(2_u32.saturating_pow(failures.saturating_sub(1)))
                        .min(self.backoff_cap);
                    warn!(
                        backend = %backend_id,
                        capability = %capability,
                        error = %err,
                        retry_in_ms = backoff.as_millis() as u64,
                        "backend readiness probe failed"
                    );
                    last_error = Some(err.to_string());
                    *state = SlotState::Failed {
                        failures,
                        next_retry_at: Instant::now() + backoff,
                        last_error: err.to_string(),
                    };
                }
            }
        }

        if let Some(error) = last_error {
            debug!(capability = %capability, error = %error, "capability unresolved");
        }
        Err(AppError::CapabilityUnavailable(
            capability.as_str().to_string(),
        ))
    }

    pub async fn embedding(
        &self,
        modality: EmbeddingModality,
    ) -> Result<Arc<dyn EmbeddingBackend>, AppError> {
        match self.resolve(modality.capability()).await? {
            BackendInstance::Embedding(backend) => Ok(backend),
            _ => Err(AppError::InternalError(
                "embedding capability resolved to a non-embedding backend".into(),
            )),
        }
    }

    pub async fn completion(&self) -> Result<Arc<dyn CompletionBackend>, AppError> {
        match self.resolve(Capability::JsonCompletion).await? {
            BackendInstance::Completion(backend) => Ok(backend),
            _ => Err(AppError::InternalError(
                "json-completion capability resolved to a non-completion backend".into(),
            )),
        }
    }

    pub async fn reranker(&self) -> Result<Arc<dyn RerankerBackend>, AppError> {
        match self.resolve(Capability::TextReranking).await? {
            BackendInstance::Reranker(backend) => Ok(backend),
            _ => Err(AppError::InternalError(
                "text-reranking capability resolved to a non-reranker backend".into(),
            )),
        }
    }

    /// Status of every slot that has been touched so far.
    pub async fn health(&self) -> Vec<BackendStatus> {
        let slots: Vec<(SlotKey, Arc<Slot>)> = {
            let guard = self
                .slots
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard
                .iter()
                .map(|(key, slot)| (key.clone(), Arc::clone(slot)))
                .collect()
        };

        let mut statuses = Vec::with_capacity(slots.len());
        for ((backend_id, _), slot) in slots {
            let state = slot.state.lock().await;
            let status = match &*state {
                SlotState::Ready(_) => BackendHealth::Ok,
                SlotState::Failed { .. } => BackendHealth::Unavailable,
                SlotState::Uninit => BackendHealth::Degraded,
            };
            statuses.push(BackendStatus {
                name: backend_id,
                status,
            });
        }
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses.dedup_by(|a, b| a.name == b.name && a.status == b.status);
        statuses
    }

    /// Close ready backends in reverse init order. Errors are logged and do
    /// not abort the sequence.
    pub async fn shutdown(&self) {
        let order: Vec<SlotKey> = {
            let mut guard = self
                .init_order
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };

        for key in order.into_iter().rev() {
            let slot = {
                let guard = self
                    .slots
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                guard.get(&key).cloned()
            };
            let Some(slot) = slot else { continue };

            let mut state = slot.state.lock().await;
            if let SlotState::Ready(instance) = &*state {
                if let Err(err) = instance.close().await {
                    warn!(backend = %key.0, error = %err, "backend close failed");
                }
            }
            *state = SlotState::Uninit;
        }
    }

    fn slot(&self, backend_id: &str, kind: InstanceKind) -> Arc<Slot> {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(
            slots
                .entry((backend_id.to_string(), kind))
                .or_insert_with(|| {
                    Arc::new(Slot {
                        state: Mutex::new(SlotState::Uninit),
                    })
                }),
        )
    }

    async fn probe(
        &self,
        backend_id: &str,
        kind: InstanceKind,
        capability: Capability,
    ) -> Result<BackendInstance, AppError> {
        let instance = self.construct(backend_id, kind, capability)?;
        instance.ensure_available().await?;
        Ok(instance)
    }

    fn construct(
        &self,
        backend_id: &str,
        kind: InstanceKind,
        capability: Capability,
    ) -> Result<BackendInstance, AppError> {
        let Some(provider) = self.providers.get(backend_id) else {
            return Err(AppError::Validation(format!(
                "binding for '{capability}' references unknown backend '{backend_id}'"
            )));
        };

        match (provider, kind) {
            (
                ProviderConfig::Openai {
                    api_key,
                    base_url,
                    embedding_model,
                    embedding_dimensions,
                    ..
                },
                InstanceKind::Embedding,
            ) => Ok(BackendInstance::Embedding(Arc::new(
                OpenAiEmbeddingBackend::new(
                    backend_id,
                    api_key,
                    base_url,
                    embedding_model,
                    *embedding_dimensions,
                ),
            ))),
            (
                ProviderConfig::Openai {
                    api_key,
                    base_url,
                    completion_model,
                    ..
                },
                InstanceKind::Completion,
            ) => Ok(BackendInstance::Completion(Arc::new(
                OpenAiCompletionBackend::new(backend_id, api_key, base_url, completion_model),
            ))),
            (ProviderConfig::Fastembed { cache_dir, dimension }, InstanceKind::Embedding) => {
                let cache = cache_dir
                    .as_ref()
                    .map(PathBuf::from)
                    .or_else(|| Some(self.data_dir.join("fastembed").join("embedding")));
                Ok(BackendInstance::Embedding(Arc::new(
                    LocalEmbeddingBackend::new(backend_id, *dimension, cache),
                )))
            }
            (ProviderConfig::Fastembed { cache_dir, .. }, InstanceKind::Reranker) => {
                let cache = cache_dir
                    .as_ref()
                    .map(PathBuf::from)
                    .or_else(|| Some(self.data_dir.join("fastembed").join("reranker")));
                Ok(BackendInstance::Reranker(Arc::new(
                    LocalRerankerBackend::new(backend_id, self.reranking.pool_size, cache),
                )))
            }
            #[cfg(any(test, feature = "test-utils"))]
            (ProviderConfig::Fixture { dimension }, kind) => {
                Ok(super::testing::fixture_instance(backend_id, *dimension, kind_to_pub(kind)))
            }
            _ => Err(AppError::Validation(format!(
                "backend '{backend_id}' cannot serve capability '{capability}'"
            ))),
        }
    }
}

#[cfg(any(test, feature = "test-utils"))]
fn kind_to_pub(kind: InstanceKind) -> super::testing::FixtureKind {
    match kind {
        InstanceKind::Embedding => super::testing::FixtureKind::Embedding,
        InstanceKind::Completion => super::testing::FixtureKind::Completion,
        InstanceKind::Reranker => super::testing::FixtureKind::Reranker,
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl BackendRegistry {
    /// Force a ready instance in front of a capability's candidate list.
    /// Tests use this to inject scripted backends without touching probes.
    pub fn preload(&mut self, capability: Capability, backend_id: &str, instance: BackendInstance) {
        let kind = InstanceKind::for_capability(capability);
        {
            let mut slots = self
                .slots
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            slots.insert(
                (backend_id.to_string(), kind),
                Arc::new(Slot {
                    state: Mutex::new(SlotState::Ready(instance)),
                }),
            );
        }
        let entry = self.bindings.entry(capability).or_default();
        entry.retain(|id| id != backend_id);
        entry.insert(0, backend_id.to_string());
        self.init_order
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((backend_id.to_string(), kind));
    }

    /// Drop a capability's bindings entirely, simulating an absent backend.
    pub fn unbind(&mut self, capability: Capability) {
        self.bindings.remove(&capability);
    }
}

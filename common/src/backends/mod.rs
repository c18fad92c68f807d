pub mod fastembed_local;
pub mod openai;
pub mod registry;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Closed set of contracts a backend can fulfill. Components ask the registry
/// for a capability, never for a concrete provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    TextEmbedding,
    CodeEmbedding,
    ContextualizedEmbedding,
    JsonCompletion,
    TextReranking,
}

impl Capability {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TextEmbedding => "text-embedding",
            Self::CodeEmbedding => "code-embedding",
            Self::ContextualizedEmbedding => "contextualized-embedding",
            Self::JsonCompletion => "json-completion",
            Self::TextReranking => "text-reranking",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Capability {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "text-embedding" => Ok(Self::TextEmbedding),
            "code-embedding" => Ok(Self::CodeEmbedding),
            "contextualized-embedding" => Ok(Self::ContextualizedEmbedding),
            "json-completion" => Ok(Self::JsonCompletion),
            "text-reranking" => Ok(Self::TextReranking),
            other => Err(AppError::Validation(format!(
                "unknown capability '{other}'"
            ))),
        }
    }
}

/// Named embedding spaces a chunk can carry. Each modality maps to one
/// capability and one vector collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingModality {
    Text,
    Code,
    Contextualized,
}

impl EmbeddingModality {
    pub const ALL: [Self; 3] = [Self::Text, Self::Code, Self::Contextualized];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Code => "code",
            Self::Contextualized => "contextualized",
        }
    }

    pub const fn capability(self) -> Capability {
        match self {
            Self::Text => Capability::TextEmbedding,
            Self::Code => Capability::CodeEmbedding,
            Self::Contextualized => Capability::ContextualizedEmbedding,
        }
    }

    /// Surreal table holding this modality's vectors; one HNSW index each.
    pub const fn vector_table(self) -> &'static str {
        match self {
            Self::Text => "chunk_embedding_text",
            Self::Code => "chunk_embedding_code",
            Self::Contextualized => "chunk_embedding_contextualized",
        }
    }
}

impl fmt::Display for EmbeddingModality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Readiness as reported through the `health` RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendHealth {
    Ok,
    Degraded,
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub name: String,
    pub status: BackendHealth,
}

#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    fn id(&self) -> &str;
    fn dimension(&self) -> usize;

    /// One-shot readiness probe; may be expensive (model warm-up). The
    /// registry caches the outcome.
    async fn ensure_available(&self) -> Result<(), AppError>;

    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, AppError>;

    /// Release held resources at shutdown.
    async fn close(&self) -> Result<(), AppError> {
        Ok(())
    }
}

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    fn id(&self) -> &str;

    async fn ensure_available(&self) -> Result<(), AppError>;

    /// Schema-constrained JSON completion. Implementations must return valid
    /// JSON matching `schema` or raise a typed error; they never return prose.
    async fn complete_json(
        &self,
        system: &str,
        user: &str,
        schema_name: &str,
        schema: serde_json::Value,
        temperature: f32,
    ) -> Result<serde_json::Value, AppError>;

    /// Release held resources at shutdown.
    async fn close(&self) -> Result<(), AppError> {
        Ok(())
    }
}

/// One scored candidate out of a rerank call, indexed into the input order.
#[derive(Debug, Clone, PartialEq)]
pub struct RerankScore {
    pub index: usize,
    pub score: f32,
    pub document: Option<String>,
}

#[async_trait]
pub trait RerankerBackend: Send + Sync {
    fn id(&self) -> &str;

    async fn ensure_available(&self) -> Result<(), AppError>;

    async fn rerank(
        &self,
        query: &str,
        documents: Vec<String>,
        return_documents: bool,
    ) -> Result<Vec<RerankScore>, AppError>;

    /// Release held resources at shutdown.
    async fn close(&self) -> Result<(), AppError> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn RerankerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RerankerBackend").field("id", &self.id()).finish()
    }
}

/// A resolved backend instance; the registry stores these behind slots.
#[derive(Clone)]
pub enum BackendInstance {
    Embedding(Arc<dyn EmbeddingBackend>),
    Completion(Arc<dyn CompletionBackend>),
    Reranker(Arc<dyn RerankerBackend>),
}

impl BackendInstance {
    pub fn supports(&self, capability: Capability) -> bool {
        match (self, capability) {
            (
                Self::Embedding(_),
                Capability::TextEmbedding
                | Capability::CodeEmbedding
                | Capability::ContextualizedEmbedding,
            )
            | (Self::Completion(_), Capability::JsonCompletion)
            | (Self::Reranker(_), Capability::TextReranking) => true,
            _ => false,
        }
    }

    pub async fn ensure_available(&self) -> Result<(), AppError> {
        match self {
            Self::Embedding(backend) => backend.ensure_available().await,
            Self::Completion(backend) => backend.ensure_available().await,
            Self::Reranker(backend) => backend.ensure_available().await,
        }
    }

    pub async fn close(&self) -> Result<(), AppError> {
        match self {
            Self::Embedding(backend) => backend.close().await,
            Self::Completion(backend) => backend.close().await,
            Self::Reranker(backend) => backend.close().await,
        }
    }
}

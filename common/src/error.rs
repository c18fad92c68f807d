use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Transient backend error: {0}")]
    Transient(String),
    #[error("No backend available for capability '{0}'")]
    CapabilityUnavailable(String),
    #[error("Tier divergence: {0}")]
    Divergence(String),
    #[error("Corrupt payload: {0}")]
    Corruption(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Fatal initialization error: {0}")]
    FatalInit(String),
    #[error("LLM parsing error: {0}")]
    LLMParsing(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Whether a retry at the failing call site is worthwhile.
    ///
    /// Validation, cancellation, and corruption never clear on retry; connection
    /// resets, rate limits, and Surreal write conflicts usually do.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_) | Self::Io(_) => true,
            Self::Database(err) => is_surreal_conflict(err),
            Self::OpenAI(err) => is_openai_retryable(err),
            _ => false,
        }
    }

    /// Wrap a backend error with the operation and the record it touched.
    pub fn in_operation(self, operation: &str, record_id: &str) -> Self {
        match self {
            Self::Transient(msg) => Self::Transient(format!("{operation} ({record_id}): {msg}")),
            other if other.is_retryable() => {
                Self::Transient(format!("{operation} ({record_id}): {other}"))
            }
            other => Self::InternalError(format!("{operation} ({record_id}): {other}")),
        }
    }
}

fn is_surreal_conflict(error: &surrealdb::Error) -> bool {
    error
        .to_string()
        .contains("Failed to commit transaction due to a read or write conflict")
}

fn is_openai_retryable(error: &OpenAIError) -> bool {
    match error {
        OpenAIError::Reqwest(_) => true,
        OpenAIError::ApiError(api) => api
            .code
            .as_deref()
            .is_some_and(|code| code.contains("rate_limit") || code.starts_with("5")),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_is_not_retryable() {
        assert!(!AppError::Validation("bad input".into()).is_retryable());
        assert!(!AppError::Cancelled.is_retryable());
        assert!(!AppError::Corruption("schema mismatch".into()).is_retryable());
    }

    #[test]
    fn transient_is_retryable_and_keeps_context() {
        let err = AppError::Transient("timeout".into());
        assert!(err.is_retryable());

        let wrapped = err.in_operation("vector upsert", "chunk-1");
        assert!(matches!(wrapped, AppError::Transient(_)));
        assert!(wrapped.to_string().contains("chunk-1"));
    }

    #[test]
    fn non_retryable_wrap_becomes_internal() {
        let wrapped =
            AppError::Validation("nope".into()).in_operation("metadata upsert", "chunk-2");
        assert!(matches!(wrapped, AppError::InternalError(_)));
    }
}

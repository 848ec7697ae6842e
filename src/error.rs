//! Error types for the invoice router.

use std::time::Duration;

use crate::pipeline::types::Stage;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Blob error: {0}")]
    Blob(#[from] BlobError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Document-understanding service errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },
}

impl LlmError {
    /// Whether another attempt of the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::RequestFailed { reason, .. } => {
                reason.starts_with("HTTP 5") || reason.starts_with("transport")
            }
            _ => false,
        }
    }
}

/// Raw message storage errors.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Invalid blob key: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outbound delivery errors, split by whether a retry may help.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    #[error("Transient delivery failure to {destination}: {reason}")]
    Transient { destination: String, reason: String },

    #[error("Permanent delivery failure to {destination}: {reason}")]
    Permanent { destination: String, reason: String },
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Work queue substrate errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue backend error: {0}")]
    Backend(#[from] DatabaseError),

    #[error("Queue entry {id} has an invalid payload: {reason}")]
    InvalidPayload { id: String, reason: String },
}

/// Fatal errors raised by a single pipeline stage.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("ExtractionError: {0}")]
    Extraction(String),

    #[error("ExtractionTimeout: no result within {timeout:?}")]
    ExtractionTimeout { timeout: Duration },

    #[error("ClassificationTimeout: no result within {timeout:?}")]
    ClassificationTimeout { timeout: Duration },

    #[error("ClassificationFailed: {0}")]
    ClassificationFailed(String),

    #[error("UnroutableDestinationError: no routing configured for recipient {recipient}")]
    UnroutableDestination { recipient: String },
}

/// Failure of one processing attempt, as reported to the ingestion coordinator.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Stage {stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: StageError,
    },

    #[error("{failed} of {total} delivery units failed transiently")]
    DeliveryIncomplete { failed: usize, total: usize },
}

impl PipelineError {
    /// The stage the attempt stopped at.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Stage { stage, .. } => *stage,
            Self::DeliveryIncomplete { .. } => Stage::Delivered,
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

//! Collaborator Traits
//!
//! Interfaces the router core consumes from the outside world. Implementations
//! handle provider-specific details (API formats, auth, model loading, disk).
//!
//! - [`BackendInvoker`]: runs a prompt against a model, optionally streaming
//! - [`ModelCatalog`]: lists the models that can be routed to
//! - [`ModelLifecycle`]: unloads resident models under memory pressure
//! - [`PersistentStore`]: byte store backing the Cold cache tier

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::request::RequestOptions;
use crate::routing::selector::ModelDescriptor;

// ============================================================================
// Streaming
// ============================================================================

/// Chunk delivered to streaming callers
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamingToken {
    /// A token from the response
    Token(String),
    /// The previous model failed mid-stream; tokens from `model_id` follow
    Restarted {
        /// Model the router fell back to
        model_id: String,
    },
}

// ============================================================================
// Errors
// ============================================================================

/// Failure of one model in a fallback chain
#[derive(Clone, Debug, PartialEq)]
pub struct AttemptFailure {
    /// Model that was tried
    pub model_id: String,
    /// Why it failed
    pub error: BackendError,
}

/// Backend call failures
#[derive(Clone, Debug, Error, PartialEq)]
pub enum BackendError {
    /// The call did not finish in time
    #[error("model {model_id} timed out after {after_ms}ms")]
    Timeout {
        /// Model called
        model_id: String,
        /// Elapsed budget
        after_ms: u64,
    },

    /// The provider refused the call for rate reasons
    #[error("model {model_id} is rate limited")]
    RateLimited {
        /// Model called
        model_id: String,
        /// Provider's retry hint
        retry_after_ms: Option<u64>,
    },

    /// The provider answered with something unusable
    #[error("invalid response from model {model_id}: {detail}")]
    InvalidResponse {
        /// Model called
        model_id: String,
        /// What was wrong
        detail: String,
    },

    /// Transport-level failure
    #[error("network error calling model {model_id}: {detail}")]
    Network {
        /// Model called
        model_id: String,
        /// Underlying error
        detail: String,
    },

    /// Every model in the chain failed
    #[error("all {} models in the fallback chain failed", .attempts.len())]
    AllFallbacksExhausted {
        /// One entry per model tried, in order
        attempts: Vec<AttemptFailure>,
    },
}

impl BackendError {
    /// Model the error is about, if it concerns a single model
    #[must_use]
    pub fn model_id(&self) -> Option<&str> {
        match self {
            Self::Timeout { model_id, .. }
            | Self::RateLimited { model_id, .. }
            | Self::InvalidResponse { model_id, .. }
            | Self::Network { model_id, .. } => Some(model_id),
            Self::AllFallbacksExhausted { .. } => None,
        }
    }

    /// Build a timeout error
    #[must_use]
    pub fn timeout(model_id: &str, after: Duration) -> Self {
        Self::Timeout {
            model_id: model_id.to_string(),
            after_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Persistent store failures
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem or device error
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored bytes could not be interpreted
    #[error("invalid stored entry: {0}")]
    Invalid(String),
}

// ============================================================================
// Traits
// ============================================================================

/// Output of a single backend call
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackendResponse {
    /// Generated text
    pub text: String,
    /// Tokens reported by the backend
    pub tokens_used: Option<u32>,
    /// Backend-measured duration
    pub duration_ms: Option<u64>,
}

/// Executes prompts against models (local runtimes or remote providers)
///
/// Calls must be safe to retry.
#[async_trait]
pub trait BackendInvoker: Send + Sync {
    /// Run `prompt` on `model_id`
    ///
    /// When `chunks` is given, tokens are sent to it as they arrive; the
    /// returned response still carries the complete text.
    async fn invoke(
        &self,
        model_id: &str,
        prompt: &str,
        options: &RequestOptions,
        chunks: Option<mpsc::Sender<StreamingToken>>,
    ) -> Result<BackendResponse, BackendError>;
}

/// Source of routable models
#[async_trait]
pub trait ModelCatalog: Send + Sync {
    /// Current model list
    async fn list(&self) -> Result<Vec<ModelDescriptor>, BackendError>;
}

/// Controls which models stay resident
#[async_trait]
pub trait ModelLifecycle: Send + Sync {
    /// Unload a resident model
    async fn unload(&self, model_id: &str) -> Result<(), BackendError>;

    /// Whether the model must never be unloaded
    fn is_pinned(&self, model_id: &str) -> bool;
}

/// Durable byte store keyed by string
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Read a value; `None` when absent or expired
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a value that expires after `ttl`
    async fn write(&self, key: &str, bytes: &[u8], ttl: Duration) -> Result<(), StoreError>;

    /// Remove a value; absent keys are not an error
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

//! Fallback Chain Tracking
//!
//! A [`FallbackContext`] walks the chain of one [`RoutingDecision`]:
//!
//! ```text
//! primary ──fail──► fallback 1 ──fail──► fallback 2 ──fail──► AllFallbacksExhausted
//!    │                  │                    │
//!    └── circuit open? skipped without a call
//! ```
//!
//! Each failure is recorded as an [`AttemptFailure`]; when the chain runs out
//! the context turns into [`BackendError::AllFallbacksExhausted`] with the
//! attempts in the order they were made.

use crate::backend::{AttemptFailure, BackendError};
use crate::routing::selector::RoutingDecision;

/// Progress through one request's fallback chain
#[derive(Clone, Debug)]
pub struct FallbackContext {
    /// Model the decision picked first
    pub original_model: String,

    /// Models that have been called, in order
    pub tried_models: Vec<String>,

    /// Models passed over because they were unavailable
    pub skipped_models: Vec<String>,

    chain: Vec<String>,
    position: usize,
    failures: Vec<AttemptFailure>,
}

impl FallbackContext {
    /// Start at the head of `decision`'s chain
    #[must_use]
    pub fn new(decision: &RoutingDecision) -> Self {
        Self {
            original_model: decision.primary.clone(),
            tried_models: Vec::new(),
            skipped_models: Vec::new(),
            chain: decision.chain().map(str::to_string).collect(),
            position: 0,
            failures: Vec::new(),
        }
    }

    /// Advance to the next model `is_available` accepts
    ///
    /// Models it rejects are skipped without an attempt. Returns `None` once
    /// the chain is exhausted.
    pub fn next_model<F>(&mut self, is_available: F) -> Option<String>
    where
        F: Fn(&str) -> bool,
    {
        while let Some(model) = self.chain.get(self.position).cloned() {
            self.position += 1;
            if is_available(&model) {
                self.tried_models.push(model.clone());
                return Some(model);
            }
            tracing::debug!(model = %model, "Skipping unavailable model in fallback chain");
            self.skipped_models.push(model);
        }
        None
    }

    /// Pass over the current model without counting it as an attempt
    pub fn skip_current(&mut self) {
        if let Some(model) = self.tried_models.pop() {
            self.skipped_models.push(model);
        }
    }

    /// Record that `model_id` failed with `error`
    pub fn record_failure(&mut self, model_id: &str, error: BackendError) {
        self.failures.push(AttemptFailure {
            model_id: model_id.to_string(),
            error,
        });
    }

    /// Model currently being tried
    #[must_use]
    pub fn current_model(&self) -> Option<&str> {
        self.tried_models.last().map(String::as_str)
    }

    /// Check if a model has already been called
    #[must_use]
    pub fn has_tried(&self, model: &str) -> bool {
        self.tried_models.iter().any(|m| m == model)
    }

    /// Get the number of fallback attempts
    #[must_use]
    pub fn fallback_count(&self) -> usize {
        self.tried_models.len().saturating_sub(1)
    }

    /// Whether the current model is not the one originally picked
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        self.current_model()
            .is_some_and(|current| current != self.original_model)
    }

    /// Failures recorded so far
    #[must_use]
    pub fn failures(&self) -> &[AttemptFailure] {
        &self.failures
    }

    /// Total models in the chain
    #[must_use]
    pub fn depth(&self) -> usize {
        self.chain.len()
    }

    /// The error reported once every model has failed
    #[must_use]
    pub fn into_exhausted(self) -> BackendError {
        BackendError::AllFallbacksExhausted {
            attempts: self.failures,
        }
    }
}

//! Test Utilities
//!
//! Mock collaborators for exercising the router without real backends.
//!
//! # Usage
//!
//! ```ignore
//! use router_core::test_utils::{descriptor, MockInvoker};
//!
//! let invoker = MockInvoker::new();
//! invoker.fail_always("m1");
//!
//! // ... route requests ...
//!
//! assert_eq!(invoker.call_count("m2"), 1);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::backend::{BackendError, BackendInvoker, BackendResponse, ModelLifecycle, StreamingToken};
use crate::cache::{CachePressureTarget, TierKind};
use crate::request::RequestOptions;
use crate::routing::selector::{Capability, ModelDescriptor};

// ============================================================================
// Descriptors
// ============================================================================

/// Chat + streaming model with an 8K context
#[must_use]
pub fn descriptor(id: &str, quality: f64, cost_per_unit: f64, latency_ms: u64) -> ModelDescriptor {
    ModelDescriptor::new(id, quality, cost_per_unit, latency_ms).with_capability(Capability::Streaming)
}

/// Three models where `m1` is best under every strategy, then `m2`, then `m3`
#[must_use]
pub fn standard_models() -> Vec<ModelDescriptor> {
    vec![
        descriptor("m1", 0.9, 0.000_01, 200),
        descriptor("m2", 0.8, 0.000_02, 400),
        descriptor("m3", 0.7, 0.000_04, 800),
    ]
}

/// A `Network` error for `model_id`
#[must_use]
pub fn network_error(model_id: &str) -> BackendError {
    BackendError::Network {
        model_id: model_id.to_string(),
        detail: "connection refused".to_string(),
    }
}

// ============================================================================
// MockInvoker
// ============================================================================

/// What a mock model does on one call
#[derive(Clone, Debug)]
pub enum MockOutcome {
    /// Answer with this text
    Respond(String),
    /// Fail with this error
    Fail(BackendError),
    /// Never answer
    Hang,
}

/// One recorded invocation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MockCall {
    /// Model called
    pub model_id: String,
    /// Prompt sent
    pub prompt: String,
    /// Whether a chunk channel was passed
    pub streaming: bool,
}

/// Scripted [`BackendInvoker`]
///
/// Each model first consumes its queued outcomes, then falls back to its
/// standing outcome. Models with neither echo `"{model}: {prompt}"`.
#[derive(Debug, Default)]
pub struct MockInvoker {
    queued: Mutex<HashMap<String, VecDeque<MockOutcome>>>,
    standing: Mutex<HashMap<String, MockOutcome>>,
    calls: Mutex<Vec<MockCall>>,
    delay: Mutex<Duration>,
}

impl MockInvoker {
    /// Invoker where every model echoes the prompt
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every call
    #[must_use]
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock() = delay;
        self
    }

    /// Queue a one-shot outcome for `model_id`
    pub fn push_outcome(&self, model_id: &str, outcome: MockOutcome) {
        self.queued
            .lock()
            .entry(model_id.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Make `model_id` fail with a network error until told otherwise
    pub fn fail_always(&self, model_id: &str) {
        self.standing
            .lock()
            .insert(model_id.to_string(), MockOutcome::Fail(network_error(model_id)));
    }

    /// Make `model_id` never answer
    pub fn hang_always(&self, model_id: &str) {
        self.standing
            .lock()
            .insert(model_id.to_string(), MockOutcome::Hang);
    }

    /// Restore the echo behaviour for `model_id`
    pub fn recover(&self, model_id: &str) {
        self.standing.lock().remove(model_id);
        self.queued.lock().remove(model_id);
    }

    /// Every call made, in order
    #[must_use]
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// Calls made to `model_id`
    #[must_use]
    pub fn call_count(&self, model_id: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.model_id == model_id)
            .count()
    }

    /// Calls made to any model
    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }

    fn next_outcome(&self, model_id: &str, prompt: &str) -> MockOutcome {
        let queued = self
            .queued
            .lock()
            .get_mut(model_id)
            .and_then(VecDeque::pop_front);
        if let Some(outcome) = queued {
            return outcome;
        }
        let standing = self.standing.lock().get(model_id).cloned();
        standing.unwrap_or_else(|| MockOutcome::Respond(format!("{model_id}: {prompt}")))
    }
}

#[async_trait]
impl BackendInvoker for MockInvoker {
    async fn invoke(
        &self,
        model_id: &str,
        prompt: &str,
        _options: &RequestOptions,
        chunks: Option<mpsc::Sender<StreamingToken>>,
    ) -> Result<BackendResponse, BackendError> {
        self.calls.lock().push(MockCall {
            model_id: model_id.to_string(),
            prompt: prompt.to_string(),
            streaming: chunks.is_some(),
        });

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match self.next_outcome(model_id, prompt) {
            MockOutcome::Respond(text) => {
                if let Some(tx) = chunks {
                    for word in text.split_inclusive(' ') {
                        // Receiver gone means the caller stopped listening
                        let _ = tx.send(StreamingToken::Token(word.to_string())).await;
                    }
                }
                let tokens = u32::try_from(text.split_whitespace().count()).unwrap_or(u32::MAX);
                Ok(BackendResponse {
                    text,
                    tokens_used: Some(tokens),
                    duration_ms: Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)),
                })
            }
            MockOutcome::Fail(error) => Err(error),
            MockOutcome::Hang => std::future::pending().await,
        }
    }
}

// ============================================================================
// MockLifecycle
// ============================================================================

/// [`ModelLifecycle`] that records unloads
#[derive(Debug, Default)]
pub struct MockLifecycle {
    pinned: HashSet<String>,
    failing: AtomicBool,
    unloaded: Mutex<Vec<String>>,
}

impl MockLifecycle {
    /// Nothing pinned, unloads succeed
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin these models
    #[must_use]
    pub fn with_pinned<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pinned.extend(models.into_iter().map(Into::into));
        self
    }

    /// Make every unload fail
    #[must_use]
    pub fn failing(self) -> Self {
        self.failing.store(true, Ordering::Release);
        self
    }

    /// Models unloaded so far, in order
    #[must_use]
    pub fn unloaded(&self) -> Vec<String> {
        self.unloaded.lock().clone()
    }
}

#[async_trait]
impl ModelLifecycle for MockLifecycle {
    async fn unload(&self, model_id: &str) -> Result<(), BackendError> {
        if self.failing.load(Ordering::Acquire) {
            return Err(network_error(model_id));
        }
        self.unloaded.lock().push(model_id.to_string());
        Ok(())
    }

    fn is_pinned(&self, model_id: &str) -> bool {
        self.pinned.contains(model_id)
    }
}

// ============================================================================
// MockPressureTarget
// ============================================================================

/// [`CachePressureTarget`] holding a byte count
#[derive(Debug, Default)]
pub struct MockPressureTarget {
    resident: AtomicU64,
    fractions: Mutex<Vec<f64>>,
}

impl MockPressureTarget {
    /// Target holding `resident_bytes`
    #[must_use]
    pub fn new(resident_bytes: u64) -> Self {
        Self {
            resident: AtomicU64::new(resident_bytes),
            fractions: Mutex::new(Vec::new()),
        }
    }

    /// Bytes still held
    #[must_use]
    pub fn resident(&self) -> u64 {
        self.resident.load(Ordering::Acquire)
    }

    /// Replace the byte count, as if the cache had grown or shrunk
    pub fn set_resident(&self, bytes: u64) {
        self.resident.store(bytes, Ordering::Release);
    }

    /// Fractions requested so far
    #[must_use]
    pub fn fractions(&self) -> Vec<f64> {
        self.fractions.lock().clone()
    }
}

#[async_trait]
impl CachePressureTarget for MockPressureTarget {
    fn resident_bytes(&self) -> u64 {
        self.resident()
    }

    async fn evict_fraction(&self, _tiers: &[TierKind], fraction: f64) -> u64 {
        self.fractions.lock().push(fraction);
        let current = self.resident();
        let freed = ((current as f64 * fraction).round() as u64).min(current);
        self.resident.fetch_sub(freed, Ordering::AcqRel);
        freed
    }

    async fn clear_all(&self) -> u64 {
        self.resident.swap(0, Ordering::AcqRel)
    }
}

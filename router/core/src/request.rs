//! Inference requests and responses
//!
//! An [`InferenceRequest`] is built once with the `with_*` builder methods
//! and never changes afterwards; the router, selector and cache only read it.

use serde::{Deserialize, Serialize};

use crate::cache::TierKind;
use crate::memory::AllocationPriority;
use crate::routing::selector::Capability;

/// Rough characters-per-token ratio used for estimates
const CHARS_PER_TOKEN: usize = 4;

// ============================================================================
// Request
// ============================================================================

/// Service tier of the caller
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserTier {
    /// Best-effort traffic
    Free,
    /// Regular traffic
    #[default]
    Standard,
    /// Paying traffic, allocated ahead of the others
    Premium,
}

impl UserTier {
    /// Priority used for this tier's execution-budget allocations
    #[must_use]
    pub fn allocation_priority(self) -> AllocationPriority {
        match self {
            Self::Free => AllocationPriority::Low,
            Self::Standard => AllocationPriority::Normal,
            Self::Premium => AllocationPriority::High,
        }
    }
}

/// Per-request generation options
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestOptions {
    /// Preferred model, honoured when it is viable
    pub model_hint: Option<String>,
    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Conversation context the prompt is evaluated against
    pub context: Option<String>,
    /// Capabilities the serving model must have
    pub required_capabilities: Vec<Capability>,
}

/// Optional routing constraints; `None` means unconstrained
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestConstraints {
    /// Maximum estimated cost for the request
    pub budget_limit: Option<f64>,
    /// Minimum model quality score
    pub quality_threshold: Option<f64>,
    /// Maximum average latency of the serving model
    pub max_latency_ms: Option<u64>,
}

/// A unit of inference work
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    request_id: String,
    prompt: String,
    options: RequestOptions,
    constraints: RequestConstraints,
    user_tier: UserTier,
}

impl InferenceRequest {
    /// Create a request for `prompt` with a fresh request id
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            options: RequestOptions::default(),
            constraints: RequestConstraints::default(),
            user_tier: UserTier::default(),
        }
    }

    /// Override the generated request id
    #[must_use]
    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = id.into();
        self
    }

    /// Prefer a specific model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.options.model_hint = Some(model.into());
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.options.max_tokens = Some(max_tokens);
        self
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.options.temperature = Some(temperature);
        self
    }

    /// Attach conversation context
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.options.context = Some(context.into());
        self
    }

    /// Require a model capability
    #[must_use]
    pub fn requiring(mut self, capability: Capability) -> Self {
        if !self.options.required_capabilities.contains(&capability) {
            self.options.required_capabilities.push(capability);
        }
        self
    }

    /// Cap the estimated cost
    #[must_use]
    pub fn with_budget_limit(mut self, limit: f64) -> Self {
        self.constraints.budget_limit = Some(limit);
        self
    }

    /// Require a minimum quality score
    #[must_use]
    pub fn with_quality_threshold(mut self, threshold: f64) -> Self {
        self.constraints.quality_threshold = Some(threshold);
        self
    }

    /// Cap the serving model's average latency
    #[must_use]
    pub fn with_max_latency_ms(mut self, max_latency_ms: u64) -> Self {
        self.constraints.max_latency_ms = Some(max_latency_ms);
        self
    }

    /// Set the caller's tier
    #[must_use]
    pub fn with_user_tier(mut self, tier: UserTier) -> Self {
        self.user_tier = tier;
        self
    }

    /// Request id
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Prompt text
    #[must_use]
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Generation options
    #[must_use]
    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    /// Routing constraints
    #[must_use]
    pub fn constraints(&self) -> &RequestConstraints {
        &self.constraints
    }

    /// Caller tier
    #[must_use]
    pub fn user_tier(&self) -> UserTier {
        self.user_tier
    }

    /// Estimated prompt tokens, context included
    #[must_use]
    pub fn prompt_tokens(&self) -> u32 {
        let chars = self.prompt.chars().count()
            + self.options.context.as_deref().map_or(0, |c| c.chars().count());
        u32::try_from(chars.div_ceil(CHARS_PER_TOKEN).max(1)).unwrap_or(u32::MAX)
    }

    /// Estimated total tokens: prompt plus the generation allowance
    #[must_use]
    pub fn estimated_tokens(&self, default_max_tokens: u32) -> u32 {
        self.prompt_tokens()
            .saturating_add(self.options.max_tokens.unwrap_or(default_max_tokens))
    }
}

// ============================================================================
// Response
// ============================================================================

/// Result of a routed inference call
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    /// Model that produced the text
    pub model_id: String,
    /// Generated text
    pub text: String,
    /// Tokens billed for the call
    pub tokens_used: u32,
    /// Cost of the backend call
    pub cost: f64,
    /// Backend latency in milliseconds
    pub latency_ms: u64,
    /// How many fallbacks were needed (0 = primary served it)
    pub fallback_depth: usize,
    /// Cache tier that served the response, if any
    #[serde(default)]
    pub served_from: Option<TierKind>,
}

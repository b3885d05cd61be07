//! Model Selection
//!
//! Filters the catalog down to the models that can serve a request and ranks
//! them with the active [`SelectionStrategy`].
//!
//! # Filters
//!
//! A candidate survives when all of these hold:
//! - its circuit is not open
//! - `quality_score >= quality_threshold`
//! - `cost_per_unit * estimated_tokens <= budget_limit`
//! - `average_latency_ms <= max_latency_ms`
//! - it has every required capability and enough context for the prompt
//!
//! # Scoring
//!
//! `score = wq * quality + wc * cost_score + ws * speed_score`, where the cost
//! and speed terms are inverse values normalized against the cheapest and
//! fastest surviving candidate (so the best candidate on each axis scores 1.0).
//! Ties go to the cheaper model, then to the lexicographically smaller id.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::RoutingConfig;
use crate::events::{EventBus, RouterEvent};
use crate::request::InferenceRequest;
use crate::routing::circuit::{CircuitRegistry, CircuitState};

// ============================================================================
// Model Descriptor
// ============================================================================

/// Something a model can do
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Multi-turn chat
    Chat,
    /// Plain completion
    Completion,
    /// Token streaming
    Streaming,
    /// Tool / function calling
    Tools,
    /// Image input
    Vision,
    /// Embedding generation
    Embedding,
}

/// Catalog entry for one model
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Model id, also the backend's model name
    pub id: String,
    /// Quality in [0, 1]
    pub quality_score: f64,
    /// Cost per token
    pub cost_per_unit: f64,
    /// Average latency in milliseconds
    pub average_latency_ms: u64,
    /// Context window in tokens
    #[serde(default = "default_context_limit")]
    pub context_limit: u32,
    /// Capability set
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
    /// Resident memory for locally executed models
    #[serde(default)]
    pub memory_bytes: Option<u64>,
}

fn default_context_limit() -> u32 {
    8192
}

impl ModelDescriptor {
    /// Create a chat model descriptor with an 8K context
    pub fn new(id: impl Into<String>, quality_score: f64, cost_per_unit: f64, average_latency_ms: u64) -> Self {
        Self {
            id: id.into(),
            quality_score,
            cost_per_unit,
            average_latency_ms,
            context_limit: default_context_limit(),
            capabilities: [Capability::Chat].into_iter().collect(),
            memory_bytes: None,
        }
    }

    /// Set the context window
    #[must_use]
    pub fn with_context_limit(mut self, tokens: u32) -> Self {
        self.context_limit = tokens;
        self
    }

    /// Add a capability
    #[must_use]
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    /// Mark as a local model occupying `bytes` while loaded
    #[must_use]
    pub fn with_memory_bytes(mut self, bytes: u64) -> Self {
        self.memory_bytes = Some(bytes);
        self
    }

    /// Estimated cost of serving `tokens` tokens
    #[must_use]
    pub fn estimated_cost(&self, tokens: u32) -> f64 {
        self.cost_per_unit * f64::from(tokens)
    }

    /// Whether the model runs locally and holds memory while loaded
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.memory_bytes.is_some()
    }
}

// ============================================================================
// Strategy
// ============================================================================

/// Weights applied to quality, cost and speed
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StrategyWeights {
    /// Quality weight
    pub quality: f64,
    /// Inverse-cost weight
    pub cost: f64,
    /// Inverse-latency weight
    pub speed: f64,
}

/// Named scoring strategy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SelectionStrategy {
    /// Even trade-off (0.4 / 0.3 / 0.3)
    #[default]
    Balanced,
    /// Prefer the best model
    QualityFirst,
    /// Prefer the cheapest model
    CostOptimized,
    /// Prefer the fastest model
    SpeedPriority,
}

impl SelectionStrategy {
    /// Every strategy
    pub const ALL: [Self; 4] = [
        Self::Balanced,
        Self::QualityFirst,
        Self::CostOptimized,
        Self::SpeedPriority,
    ];

    /// Weight tuple for this strategy
    #[must_use]
    pub fn weights(self) -> StrategyWeights {
        let (quality, cost, speed) = match self {
            Self::Balanced => (0.4, 0.3, 0.3),
            Self::QualityFirst => (0.7, 0.15, 0.15),
            Self::CostOptimized => (0.2, 0.6, 0.2),
            Self::SpeedPriority => (0.2, 0.2, 0.6),
        };
        StrategyWeights {
            quality,
            cost,
            speed,
        }
    }

    /// Configuration name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Balanced => "balanced",
            Self::QualityFirst => "qualityFirst",
            Self::CostOptimized => "costOptimized",
            Self::SpeedPriority => "speedPriority",
        }
    }
}

impl std::fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown strategy '{s}'"))
    }
}

// ============================================================================
// Decision
// ============================================================================

/// Per-candidate score components
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    /// Model id
    pub model_id: String,
    /// Quality term before weighting
    pub quality: f64,
    /// Normalized inverse cost before weighting
    pub cost: f64,
    /// Normalized inverse latency before weighting
    pub speed: f64,
    /// Weighted total
    pub total: f64,
}

/// Outcome of selection for one request
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RoutingDecision {
    /// Model tried first
    pub primary: String,
    /// Models tried next, in order
    pub fallbacks: Vec<String>,
    /// Scores of every viable candidate, best first
    pub scores: Vec<ScoreBreakdown>,
    /// Strategy that produced the ranking
    pub strategy: SelectionStrategy,
}

impl RoutingDecision {
    /// Primary followed by the fallbacks
    pub fn chain(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.fallbacks.iter().map(String::as_str))
    }
}

/// Selection failures
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    /// No candidate satisfies the request's constraints
    #[error("no viable model among {considered} candidates")]
    NoViableModel {
        /// Candidates examined
        considered: usize,
    },
}

// ============================================================================
// Selector
// ============================================================================

/// Scores and ranks catalog models for requests
#[derive(Debug)]
pub struct ModelSelector {
    descriptors: RwLock<Vec<ModelDescriptor>>,
    circuits: Arc<CircuitRegistry>,
    strategy: SelectionStrategy,
    default_max_tokens: u32,
    max_fallbacks: usize,
    events: EventBus,
}

impl ModelSelector {
    /// Create a selector over an empty catalog
    #[must_use]
    pub fn new(
        strategy: SelectionStrategy,
        routing: &RoutingConfig,
        circuits: Arc<CircuitRegistry>,
        events: EventBus,
    ) -> Self {
        Self {
            descriptors: RwLock::new(Vec::new()),
            circuits,
            strategy,
            default_max_tokens: routing.default_max_tokens,
            max_fallbacks: routing.max_fallbacks,
            events,
        }
    }

    /// Replace the catalog
    pub fn set_descriptors(&self, descriptors: Vec<ModelDescriptor>) {
        tracing::debug!(count = descriptors.len(), "Model catalog updated");
        *self.descriptors.write() = descriptors;
    }

    /// Copy of the catalog
    pub fn descriptors(&self) -> Vec<ModelDescriptor> {
        self.descriptors.read().clone()
    }

    /// Look up one descriptor
    pub fn descriptor(&self, model_id: &str) -> Option<ModelDescriptor> {
        self.descriptors
            .read()
            .iter()
            .find(|d| d.id == model_id)
            .cloned()
    }

    /// Configured strategy
    #[must_use]
    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Select over the current catalog with the configured strategy
    pub fn select(&self, request: &InferenceRequest) -> Result<RoutingDecision, RoutingError> {
        let candidates = self.descriptors();
        self.select_from(request, &candidates, self.strategy)
    }

    /// Select over explicit candidates with an explicit strategy
    pub fn select_from(
        &self,
        request: &InferenceRequest,
        candidates: &[ModelDescriptor],
        strategy: SelectionStrategy,
    ) -> Result<RoutingDecision, RoutingError> {
        let decision = rank(
            request,
            candidates,
            strategy,
            self.default_max_tokens,
            self.max_fallbacks,
            |id| self.circuits.state(id),
        )?;

        tracing::debug!(
            request_id = %request.request_id(),
            primary = %decision.primary,
            fallbacks = ?decision.fallbacks,
            strategy = %strategy,
            "Routing decided"
        );
        self.events.emit(RouterEvent::RoutingDecided {
            request_id: request.request_id().to_string(),
            primary: decision.primary.clone(),
            fallbacks: decision.fallbacks.clone(),
            strategy,
        });
        Ok(decision)
    }
}

/// Filter and rank `candidates`; `circuit_state` reports each model's breaker
pub fn rank<F>(
    request: &InferenceRequest,
    candidates: &[ModelDescriptor],
    strategy: SelectionStrategy,
    default_max_tokens: u32,
    max_fallbacks: usize,
    circuit_state: F,
) -> Result<RoutingDecision, RoutingError>
where
    F: Fn(&str) -> CircuitState,
{
    let tokens = request.estimated_tokens(default_max_tokens);
    let prompt_tokens = request.prompt_tokens();
    let constraints = request.constraints();
    let required = &request.options().required_capabilities;

    let viable: Vec<&ModelDescriptor> = candidates
        .iter()
        .filter(|d| circuit_state(&d.id) != CircuitState::Open)
        .filter(|d| constraints.quality_threshold.map_or(true, |q| d.quality_score >= q))
        .filter(|d| constraints.budget_limit.map_or(true, |b| d.estimated_cost(tokens) <= b))
        .filter(|d| constraints.max_latency_ms.map_or(true, |l| d.average_latency_ms <= l))
        .filter(|d| required.iter().all(|c| d.capabilities.contains(c)))
        .filter(|d| d.context_limit >= prompt_tokens)
        .collect();

    if viable.is_empty() {
        tracing::debug!(
            request_id = %request.request_id(),
            considered = candidates.len(),
            "No viable model"
        );
        return Err(RoutingError::NoViableModel {
            considered: candidates.len(),
        });
    }

    let min_cost = min_positive(viable.iter().map(|d| d.cost_per_unit));
    let min_latency = min_positive(viable.iter().map(|d| d.average_latency_ms as f64));
    let weights = strategy.weights();

    let mut scored: Vec<(&ModelDescriptor, ScoreBreakdown)> = viable
        .into_iter()
        .map(|d| {
            let quality = d.quality_score;
            let cost = inverse_normalized(d.cost_per_unit, min_cost);
            let speed = inverse_normalized(d.average_latency_ms as f64, min_latency);
            let total = weights.quality * quality + weights.cost * cost + weights.speed * speed;
            (
                d,
                ScoreBreakdown {
                    model_id: d.id.clone(),
                    quality,
                    cost,
                    speed,
                    total,
                },
            )
        })
        .collect();

    scored.sort_by(|(a, sa), (b, sb)| {
        sb.total
            .total_cmp(&sa.total)
            .then_with(|| a.cost_per_unit.total_cmp(&b.cost_per_unit))
            .then_with(|| a.id.cmp(&b.id))
    });

    // A viable hinted model jumps the queue
    if let Some(hint) = request.options().model_hint.as_deref() {
        if let Some(pos) = scored.iter().position(|(d, _)| d.id == hint) {
            let hinted = scored.remove(pos);
            scored.insert(0, hinted);
        }
    }

    let mut chain = scored.iter().map(|(d, _)| d.id.clone());
    let primary = chain.next().unwrap_or_default();
    let fallbacks = chain.take(max_fallbacks).collect();

    Ok(RoutingDecision {
        primary,
        fallbacks,
        scores: scored.into_iter().map(|(_, s)| s).collect(),
        strategy,
    })
}

fn min_positive(values: impl Iterator<Item = f64>) -> Option<f64> {
    values
        .filter(|v| *v > 0.0)
        .min_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal))
}

fn inverse_normalized(value: f64, min: Option<f64>) -> f64 {
    match min {
        Some(min) if value > 0.0 => min / value,
        _ => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn catalog() -> Vec<ModelDescriptor> {
        vec![
            ModelDescriptor::new("m1", 0.9, 0.000_02, 1200),
            ModelDescriptor::new("m2", 0.7, 0.000_005, 600),
            ModelDescriptor::new("m3", 0.5, 0.000_001, 200),
            ModelDescriptor::new("m4", 0.6, 0.000_01, 900),
        ]
    }

    fn closed(_: &str) -> CircuitState {
        CircuitState::Closed
    }

    fn chain(decision: &RoutingDecision) -> Vec<&str> {
        decision.chain().collect()
    }

    #[test]
    fn test_balanced_weights_are_default() {
        let w = SelectionStrategy::default().weights();
        assert_eq!(w, StrategyWeights { quality: 0.4, cost: 0.3, speed: 0.3 });
        for strategy in SelectionStrategy::ALL {
            let w = strategy.weights();
            assert!((w.quality + w.cost + w.speed - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_strategy_parse_round_trip() {
        for strategy in SelectionStrategy::ALL {
            assert_eq!(strategy.as_str().parse::<SelectionStrategy>(), Ok(strategy));
        }
        assert!("fastest".parse::<SelectionStrategy>().is_err());
    }

    #[test]
    fn test_returns_primary_and_two_fallbacks() {
        let request = InferenceRequest::new("hello");
        let decision = rank(&request, &catalog(), SelectionStrategy::Balanced, 256, 2, closed).unwrap();
        assert_eq!(decision.fallbacks.len(), 2);
        assert_eq!(decision.scores.len(), 4);
        assert!(decision.scores.windows(2).all(|w| w[0].total >= w[1].total));
    }

    #[test]
    fn test_strategies_change_primary() {
        let request = InferenceRequest::new("hello");
        let quality = rank(&request, &catalog(), SelectionStrategy::QualityFirst, 256, 2, closed).unwrap();
        let cost = rank(&request, &catalog(), SelectionStrategy::CostOptimized, 256, 2, closed).unwrap();
        let speed = rank(&request, &catalog(), SelectionStrategy::SpeedPriority, 256, 2, closed).unwrap();
        assert_eq!(quality.primary, "m1");
        assert_eq!(cost.primary, "m3");
        assert_eq!(speed.primary, "m3");
    }

    #[test]
    fn test_ties_break_on_cost_then_id() {
        let candidates = vec![
            ModelDescriptor::new("b", 0.8, 0.0, 500),
            ModelDescriptor::new("a", 0.8, 0.0, 500),
            ModelDescriptor::new("c", 0.8, 0.0, 500),
        ];
        let request = InferenceRequest::new("hi");
        let decision = rank(&request, &candidates, SelectionStrategy::Balanced, 256, 2, closed).unwrap();
        assert_eq!(chain(&decision), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_open_circuit_never_selected() {
        let request = InferenceRequest::new("hi");
        let decision = rank(&request, &catalog(), SelectionStrategy::QualityFirst, 256, 3, |id| {
            if id == "m1" {
                CircuitState::Open
            } else {
                CircuitState::Closed
            }
        })
        .unwrap();
        assert!(!chain(&decision).contains(&"m1"));
    }

    #[test]
    fn test_half_open_is_selectable() {
        let request = InferenceRequest::new("hi");
        let decision = rank(&request, &catalog(), SelectionStrategy::QualityFirst, 256, 2, |_| {
            CircuitState::HalfOpen
        })
        .unwrap();
        assert_eq!(decision.primary, "m1");
    }

    #[test]
    fn test_quality_threshold_excludes_everything() {
        let candidates = vec![
            ModelDescriptor::new("m1", 0.8, 0.0, 100),
            ModelDescriptor::new("m2", 0.8, 0.0, 100),
        ];
        let request = InferenceRequest::new("hi").with_quality_threshold(0.95);
        let err = rank(&request, &candidates, SelectionStrategy::Balanced, 256, 2, closed).unwrap_err();
        assert_eq!(err, RoutingError::NoViableModel { considered: 2 });
    }

    #[test]
    fn test_budget_limit_filters_expensive_models() {
        // 8 prompt chars + 100 max tokens = 102 estimated tokens
        let request = InferenceRequest::new("abcdefgh")
            .with_max_tokens(100)
            .with_budget_limit(0.0011);
        let decision = rank(&request, &catalog(), SelectionStrategy::QualityFirst, 256, 2, closed).unwrap();
        assert_eq!(chain(&decision), vec!["m3", "m2", "m4"]);

        let broke = request.with_budget_limit(0.000_01);
        assert!(rank(&broke, &catalog(), SelectionStrategy::Balanced, 256, 2, closed).is_err());
    }

    #[test]
    fn test_latency_and_capability_filters() {
        let candidates = vec![
            ModelDescriptor::new("slow", 0.9, 0.0, 5000).with_capability(Capability::Streaming),
            ModelDescriptor::new("fast", 0.5, 0.0, 100),
            ModelDescriptor::new("streamer", 0.6, 0.0, 300).with_capability(Capability::Streaming),
        ];
        let request = InferenceRequest::new("hi")
            .with_max_latency_ms(1000)
            .requiring(Capability::Streaming);
        let decision = rank(&request, &candidates, SelectionStrategy::Balanced, 256, 2, closed).unwrap();
        assert_eq!(chain(&decision), vec!["streamer"]);
    }

    #[test]
    fn test_context_limit_filter() {
        let candidates = vec![
            ModelDescriptor::new("tiny", 0.9, 0.0, 100).with_context_limit(2),
            ModelDescriptor::new("big", 0.5, 0.0, 100),
        ];
        let request = InferenceRequest::new("a prompt longer than eight chars");
        let decision = rank(&request, &candidates, SelectionStrategy::QualityFirst, 256, 2, closed).unwrap();
        assert_eq!(decision.primary, "big");
    }

    #[test]
    fn test_viable_hint_becomes_primary() {
        let request = InferenceRequest::new("hi").with_model("m3");
        let decision = rank(&request, &catalog(), SelectionStrategy::QualityFirst, 256, 2, closed).unwrap();
        assert_eq!(chain(&decision), vec!["m3", "m1", "m2"]);

        let unknown = InferenceRequest::new("hi").with_model("nope");
        let decision = rank(&unknown, &catalog(), SelectionStrategy::QualityFirst, 256, 2, closed).unwrap();
        assert_eq!(decision.primary, "m1");
    }

    #[tokio::test]
    async fn test_selector_uses_registry_and_emits() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let circuits = Arc::new(CircuitRegistry::new(Default::default(), bus.clone()));
        let selector = ModelSelector::new(
            SelectionStrategy::QualityFirst,
            &RoutingConfig::default(),
            Arc::clone(&circuits),
            bus,
        );
        selector.set_descriptors(catalog());

        for _ in 0..5 {
            circuits.record_failure("m1");
        }
        let decision = selector.select(&InferenceRequest::new("hi").with_request_id("r1")).unwrap();
        assert_eq!(decision.primary, "m3");
        assert!(!decision.chain().any(|id| id == "m1"));

        let mut saw_decision = false;
        while let Ok(event) = rx.try_recv() {
            if let RouterEvent::RoutingDecided { request_id, primary, .. } = event {
                assert_eq!(request_id, "r1");
                assert_eq!(primary, "m3");
                saw_decision = true;
            }
        }
        assert!(saw_decision);
    }
}

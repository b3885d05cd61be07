//! Request Routing
//!
//! Model selection, health tracking and the request path.
//!
//! # Architecture
//!
//! ```text
//! +------------------+
//! |      Router      |  <-- Entry point: dedup, cache, budget, fallback
//! +--------+---------+
//!          |
//!          v
//! +------------------+      +------------------+
//! |  ModelSelector   | ---> | CircuitRegistry  |  <-- Open circuits are filtered out
//! +--------+---------+      +------------------+
//!          |
//!          v
//! +------------------+
//! | FallbackContext  |  <-- Walks primary + fallbacks, collects failures
//! +--------+---------+
//!          |
//!          v
//! +------------------+
//! | BackendInvoker   |  <-- Local runtimes and remote providers
//! +------------------+
//! ```
//!
//! # Design Principles
//!
//! 1. **Deterministic Ranking**: Fixed strategy weights, ties broken by cost then id
//! 2. **Health Isolation**: One failing model never blocks the others
//! 3. **Graceful Degradation**: Fallback chains when primary models fail
//! 4. **Observability**: Events and counters for every decision

pub mod circuit;
pub mod fallback;
pub mod metrics;
pub mod router;
pub mod selector;

pub use circuit::{CircuitBreaker, CircuitOpenError, CircuitRegistry, CircuitSnapshot, CircuitState};
pub use fallback::FallbackContext;
pub use metrics::{Histogram, HistogramSnapshot, ModelMetricsSummary, RouterMetrics};
pub use router::{ResponseCache, RouteOutcome, Router, RouterBuilder, RouterError, RouterStats};
pub use selector::{
    Capability, ModelDescriptor, ModelSelector, RoutingDecision, RoutingError, ScoreBreakdown,
    SelectionStrategy, StrategyWeights,
};

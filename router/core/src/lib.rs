//! Router Core - Request Routing, Caching and Resource Pressure
//!
//! Routes inference requests across interchangeable model backends (local
//! runtimes and remote providers), avoids repeating expensive calls through
//! a multi-tier response cache, and keeps the host inside a memory budget.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            Router                                │
//! │   submit ─► CacheKey ─► MultiTierCache.get_or_await              │
//! │                              │ miss (leader)                     │
//! │                              ▼                                   │
//! │   ModelSelector ─► MemoryManager.allocate ─► fallback chain      │
//! │        │                    │                      │             │
//! │        ▼                    ▼                      ▼             │
//! │  CircuitRegistry      ResourcePool          BackendInvoker       │
//! └────────┼────────────────────┼──────────────────────┼─────────────┘
//!          │                    │                      │
//!     EventBus            ModelLifecycle        local / remote models
//!  (routingDecided,     (unload under pressure)
//!   circuitStateChanged,
//!   cacheEvicted,
//!   pressureChanged)
//! ```
//!
//! # Key Types
//!
//! - [`Router`]: the request entry point
//! - [`ModelSelector`]: filters and ranks models per request
//! - [`CircuitRegistry`]: per-model circuit breakers
//! - [`MultiTierCache`]: Hot/Warm/Cold response cache with in-flight dedup
//! - [`MemoryManager`]: execution budget, pressure states and cleanup
//! - [`ResourcePool`]: size-class block allocator
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use router_core::{backend::OllamaInvoker, InferenceRequest, Router, RouterConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RouterConfig::default();
//!     let invoker = Arc::new(OllamaInvoker::from_settings(&config.backend, config.models.clone())?);
//!     let router = Router::builder(config, invoker).build()?;
//!     router.start_background();
//!
//!     let response = router.submit(InferenceRequest::new("Explain TCP")).await;
//!     println!("{response:?}");
//!
//!     router.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: collaborator traits and the shipped adapters
//! - [`cache`]: cache keys, tiers, Cold-tier envelopes and dedup tokens
//! - [`config`]: TOML configuration with environment overrides
//! - [`events`]: observability events
//! - [`memory`]: memory manager and block pool
//! - [`request`]: requests and responses
//! - [`routing`]: selection, circuit breakers, fallback and the router
//! - [`test_utils`]: mock collaborators for tests

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod backend;
pub mod cache;
pub mod config;
pub mod events;
pub mod memory;
pub mod request;
pub mod routing;
pub mod test_utils;

// Re-exports for convenience
pub use backend::{
    AttemptFailure, BackendError, BackendInvoker, BackendResponse, ModelCatalog, ModelLifecycle,
    PersistentStore, StreamingToken,
};
pub use cache::{CacheError, CacheKey, MultiTierCache, TierKind};
pub use config::{ConfigError, RouterConfig};
pub use events::{EventBus, RouterEvent};
pub use memory::{MemoryError, MemoryManager, PressureState, ResourcePool};
pub use request::{InferenceRequest, InferenceResponse, UserTier};
pub use routing::{
    CircuitRegistry, CircuitState, ModelDescriptor, ModelSelector, Router, RouterError,
    RouterStats, RoutingError, SelectionStrategy,
};

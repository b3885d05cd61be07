//! Request Router
//!
//! The main entry point. Coordinates the selector, the response cache, the
//! memory manager and the backend invoker.
//!
//! # Request Path
//!
//! ```text
//! submit(request)
//!   │
//!   ├─► CacheKey ──► cache.get_or_await ──hit──► response
//!   │                   │
//!   │                   ├─follower──► await the in-flight outcome
//!   │                   │
//!   │                   └─leader──► spawned call (survives caller cancellation)
//!   │                                 │
//!   │                                 ├─► selector.select
//!   │                                 ├─► memory.allocate (execution budget)
//!   │                                 ├─► fallback chain: circuit check, invoke with timeout
//!   │                                 ├─► cache.set on success
//!   │                                 └─► complete: every waiter gets the outcome
//!   ▼
//! Result<InferenceResponse, RouterError>
//! ```
//!
//! # Background Tasks
//!
//! [`Router::start_background`] spawns the periodic pressure relief, TTL
//! sweep, idle-model scan and (when a catalog is configured) catalog
//! refresh. [`Router::shutdown`] stops and joins them.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::circuit::{CircuitRegistry, CircuitSnapshot};
use super::fallback::FallbackContext;
use super::metrics::{ModelMetricsSummary, RouterMetrics};
use super::selector::{Capability, ModelSelector, RoutingDecision, RoutingError};
use crate::backend::{
    BackendError, BackendInvoker, InMemoryStore, ModelCatalog, ModelLifecycle, PersistentStore,
    StreamingToken,
};
use crate::cache::{CacheError, CacheHit, CacheKey, CachePressureTarget, CacheStats, InFlightError, Lookup, MultiTierCache, TierKind};
use crate::config::{ConfigError, RouterConfig};
use crate::events::{EventBus, RouterEvent};
use crate::memory::{AllocationOptions, MemoryError, MemoryManager, MemoryStats};
use crate::request::{InferenceRequest, InferenceResponse};

/// How many times a caller re-joins after its in-flight call was abandoned
const MAX_ABANDONED_RETRIES: usize = 2;

/// Quality assumed for responses from models no longer in the catalog
const UNKNOWN_MODEL_QUALITY: f64 = 0.5;

// ============================================================================
// Errors
// ============================================================================

/// Caller-facing request failures
#[derive(Clone, Debug, Error, PartialEq)]
pub enum RouterError {
    /// No model can serve the request; nothing was called
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// Every model in the fallback chain failed
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The execution budget could not be reserved
    #[error("resource exhausted: {0}")]
    ResourceExhausted(#[from] MemoryError),

    /// The shared call went away without producing an outcome
    #[error("request interrupted before an outcome was produced")]
    Interrupted,
}

/// Outcome shared between deduplicated callers
pub type RouteOutcome = Result<InferenceResponse, RouterError>;

/// Response cache used by the router
pub type ResponseCache = MultiTierCache<RouteOutcome>;

// ============================================================================
// Stats
// ============================================================================

/// Point-in-time view of the router
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RouterStats {
    /// Requests submitted
    pub requests: u64,
    /// Requests served from Hot
    pub hot_hits: u64,
    /// Requests served from Warm
    pub warm_hits: u64,
    /// Requests served from Cold
    pub cold_hits: u64,
    /// Requests that led a backend call
    pub cache_misses: u64,
    /// Requests that joined an in-flight call
    pub dedup_joins: u64,
    /// Fallback attempts made
    pub fallbacks: u64,
    /// Requests with no viable model
    pub routing_errors: u64,
    /// Requests whose whole chain failed
    pub exhausted_chains: u64,
    /// Requests refused for lack of memory
    pub resource_exhausted: u64,
    /// Median end-to-end latency (bucket upper bound, ms)
    pub latency_p50_ms: f64,
    /// 99th percentile end-to-end latency (bucket upper bound, ms)
    pub latency_p99_ms: f64,
    /// Cache usage
    pub cache: CacheStats,
    /// Memory usage
    pub memory: MemoryStats,
    /// Breaker states
    pub circuits: Vec<CircuitSnapshot>,
    /// Per-model call counters
    pub models: Vec<ModelMetricsSummary>,
}

// ============================================================================
// Builder
// ============================================================================

/// Assembles a [`Router`] from configuration and collaborators
pub struct RouterBuilder {
    config: RouterConfig,
    invoker: Arc<dyn BackendInvoker>,
    catalog: Option<Arc<dyn ModelCatalog>>,
    lifecycle: Option<Arc<dyn ModelLifecycle>>,
    store: Option<Arc<dyn PersistentStore>>,
    events: Option<EventBus>,
}

impl RouterBuilder {
    /// Start from a configuration and the backend invoker
    pub fn new(config: RouterConfig, invoker: Arc<dyn BackendInvoker>) -> Self {
        Self {
            config,
            invoker,
            catalog: None,
            lifecycle: None,
            store: None,
            events: None,
        }
    }

    /// Refresh descriptors from `catalog`
    #[must_use]
    pub fn catalog(mut self, catalog: Arc<dyn ModelCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Unload models through `lifecycle` under pressure
    #[must_use]
    pub fn lifecycle(mut self, lifecycle: Arc<dyn ModelLifecycle>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Back the Cold tier with `store` (default: in-memory)
    #[must_use]
    pub fn store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Publish events on an existing bus
    #[must_use]
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Validate the configuration and wire the components together
    pub fn build(self) -> Result<Router, ConfigError> {
        self.config.validate()?;
        let config = self.config;

        let events = self
            .events
            .unwrap_or_else(|| EventBus::new(config.routing.event_capacity));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()) as Arc<dyn PersistentStore>);

        let circuits = Arc::new(CircuitRegistry::new(config.circuit.clone(), events.clone()));
        let selector = ModelSelector::new(
            config.strategy,
            &config.routing,
            Arc::clone(&circuits),
            events.clone(),
        );
        selector.set_descriptors(config.models.clone());

        let cache = Arc::new(ResponseCache::new(config.cache.clone(), store, events.clone()));
        let mut memory = MemoryManager::new(config.memory.clone())
            .with_cache(Arc::clone(&cache) as Arc<dyn CachePressureTarget>)
            .with_events(events.clone());
        if let Some(lifecycle) = self.lifecycle {
            memory = memory.with_lifecycle(lifecycle);
        }

        let (shutdown_tx, _) = watch::channel(false);

        tracing::info!(
            strategy = %config.strategy,
            models = config.models.len(),
            budget_bytes = config.memory.budget_bytes,
            "Router created"
        );

        Ok(Router {
            inner: Arc::new(RouterInner {
                config,
                selector,
                circuits,
                cache,
                memory: Arc::new(memory),
                invoker: self.invoker,
                catalog: self.catalog,
                metrics: RouterMetrics::default(),
                events,
            }),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

// ============================================================================
// Router
// ============================================================================

struct RouterInner {
    config: RouterConfig,
    selector: ModelSelector,
    circuits: Arc<CircuitRegistry>,
    cache: Arc<ResponseCache>,
    memory: Arc<MemoryManager>,
    invoker: Arc<dyn BackendInvoker>,
    catalog: Option<Arc<dyn ModelCatalog>>,
    metrics: RouterMetrics,
    events: EventBus,
}

/// Routes inference requests across models with caching and fallback
pub struct Router {
    inner: Arc<RouterInner>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Router {
    /// Builder for a router over `invoker`
    pub fn builder(config: RouterConfig, invoker: Arc<dyn BackendInvoker>) -> RouterBuilder {
        RouterBuilder::new(config, invoker)
    }

    /// Route one request
    ///
    /// Concurrent requests with the same cache key share one backend call.
    /// Dropping the returned future detaches this caller only; the shared
    /// call still finishes and fills the cache.
    pub async fn submit(&self, request: InferenceRequest) -> RouteOutcome {
        let started = Instant::now();
        self.inner.metrics.requests.inc();
        let key = CacheKey::for_request(&request, self.inner.selector.strategy());

        let outcome = self.submit_deduplicated(&request, &key).await;
        self.record_latency(started);
        outcome
    }

    async fn submit_deduplicated(&self, request: &InferenceRequest, key: &CacheKey) -> RouteOutcome {
        let inner = &self.inner;
        let mut abandoned = 0;
        loop {
            let waiter = match inner.cache.get_or_await(key).await {
                Lookup::Hit(hit) => match inner.decode_hit(key, hit) {
                    Some(response) => return Ok(response),
                    None => {
                        // Unreadable entry; serve this caller directly
                        inner.metrics.cache_misses.inc();
                        let outcome = inner.execute(request, None).await;
                        if let Ok(response) = &outcome {
                            inner.store_response(request, key, response).await;
                        }
                        return outcome;
                    }
                },
                Lookup::Follower(waiter) => {
                    inner.metrics.dedup_joins.inc();
                    tracing::debug!(request_id = %request.request_id(), key = %key, "Joined in-flight call");
                    waiter
                }
                Lookup::Leader(leader) => {
                    inner.metrics.cache_misses.inc();
                    let waiter = leader.subscribe();
                    let shared = Arc::clone(inner);
                    let request = request.clone();
                    tokio::spawn(async move {
                        let key = leader.key().clone();
                        let outcome = shared.execute(&request, None).await;
                        if let Ok(response) = &outcome {
                            shared.store_response(&request, &key, response).await;
                        }
                        let delivered = leader.complete(outcome);
                        if delivered == 0 {
                            tracing::debug!(key = %key, "In-flight call finished with no waiters left");
                        }
                    });
                    waiter
                }
            };

            match waiter.wait().await {
                Ok(outcome) => return outcome,
                Err(InFlightError::Released) => {
                    tracing::debug!(key = %key, "In-flight call released, retrying cache");
                }
                Err(e) => {
                    abandoned += 1;
                    tracing::warn!(key = %key, error = %e, attempt = abandoned, "In-flight call abandoned");
                    if abandoned > MAX_ABANDONED_RETRIES {
                        return Err(RouterError::Interrupted);
                    }
                }
            }
        }
    }

    /// Route one request, forwarding tokens to `tokens` as they arrive
    ///
    /// Only models with [`Capability::Streaming`] are considered. When the
    /// router falls back mid-request, [`StreamingToken::Restarted`] precedes
    /// the next model's tokens. A cached response is delivered as a single
    /// token. Streaming requests do not join in-flight calls.
    pub async fn submit_streaming(
        &self,
        request: InferenceRequest,
        tokens: mpsc::Sender<StreamingToken>,
    ) -> RouteOutcome {
        let started = Instant::now();
        let inner = &self.inner;
        inner.metrics.requests.inc();
        let key = CacheKey::for_request(&request, inner.selector.strategy());

        let cached = inner.cache.get(&key).await;
        if let Some(response) = cached.and_then(|hit| inner.decode_hit(&key, hit)) {
            let _ = tokens.send(StreamingToken::Token(response.text.clone())).await;
            self.record_latency(started);
            return Ok(response);
        }

        inner.metrics.cache_misses.inc();
        let streaming = request.clone().requiring(Capability::Streaming);
        let outcome = inner.execute(&streaming, Some(tokens)).await;
        if let Ok(response) = &outcome {
            inner.store_response(&request, &key, response).await;
        }
        self.record_latency(started);
        outcome
    }

    fn record_latency(&self, started: Instant) {
        self.inner
            .metrics
            .latency_ms
            .record(started.elapsed().as_secs_f64() * 1000.0);
    }

    /// Replace the selector's descriptors from the catalog
    ///
    /// Returns the number of descriptors loaded. On failure the previous set
    /// is kept.
    pub async fn refresh_catalog(&self) -> Result<usize, BackendError> {
        self.inner.refresh_catalog().await
    }

    /// Spawn the periodic maintenance tasks
    pub fn start_background(&self) {
        let config = &self.inner.config;
        let mut tasks = Vec::new();

        tasks.push(self.spawn_periodic(
            "pressure",
            Duration::from_secs(config.memory.check_interval_secs),
            |inner| async move {
                inner.memory.relieve_pressure().await;
            },
        ));
        tasks.push(self.spawn_periodic(
            "ttl-sweep",
            Duration::from_secs(config.cache.sweep_interval_secs),
            |inner| async move {
                inner.cache.sweep_expired().await;
            },
        ));
        tasks.push(self.spawn_periodic(
            "idle-scan",
            Duration::from_secs(config.memory.model_scan_interval_secs),
            |inner| async move {
                let (unloaded, swept) = inner.memory.run_idle_scan().await;
                if !unloaded.is_empty() || swept > 0 {
                    tracing::debug!(unloaded = ?unloaded, swept, "Idle scan finished");
                }
            },
        ));
        if self.inner.catalog.is_some() {
            tasks.push(self.spawn_periodic(
                "catalog-refresh",
                Duration::from_secs(config.routing.catalog_refresh_secs),
                |inner| async move {
                    // Failures are logged inside; the old catalog stays
                    let _ = inner.refresh_catalog().await;
                },
            ));
        }

        let count = tasks.len();
        self.tasks.lock().extend(tasks);
        tracing::info!(tasks = count, "Router background tasks started");
    }

    fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, task: F) -> JoinHandle<()>
    where
        F: Fn(Arc<RouterInner>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let mut shutdown = self.shutdown_tx.subscribe();
        let period = period.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => task(Arc::clone(&inner)).await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(task = name, "Background task stopped");
        })
    }

    /// Stop the background tasks and wait for them to finish
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        tracing::info!("Router shut down");
    }

    /// Snapshot of counters and component usage
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        let inner = &self.inner;
        let m = &inner.metrics;
        let latency = m.latency_ms.snapshot();
        RouterStats {
            requests: m.requests.get(),
            hot_hits: m.cache_hits[0].get(),
            warm_hits: m.cache_hits[1].get(),
            cold_hits: m.cache_hits[2].get(),
            cache_misses: m.cache_misses.get(),
            dedup_joins: m.dedup_joins.get(),
            fallbacks: m.fallbacks.get(),
            routing_errors: m.routing_errors.get(),
            exhausted_chains: m.exhausted_chains.get(),
            resource_exhausted: m.resource_exhausted.get(),
            latency_p50_ms: latency.p50(),
            latency_p99_ms: latency.p99(),
            cache: inner.cache.stats(),
            memory: inner.memory.stats(),
            circuits: inner.circuits.snapshot(),
            models: m.model_summaries(),
        }
    }

    /// Subscribe to router events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.inner.events.subscribe()
    }

    /// The event bus
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// The response cache
    #[must_use]
    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.inner.cache
    }

    /// The memory manager
    #[must_use]
    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.inner.memory
    }

    /// The circuit breakers
    #[must_use]
    pub fn circuits(&self) -> &Arc<CircuitRegistry> {
        &self.inner.circuits
    }

    /// The model selector
    #[must_use]
    pub fn selector(&self) -> &ModelSelector {
        &self.inner.selector
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }
}

impl RouterInner {
    /// Select, reserve the execution budget and walk the fallback chain
    async fn execute(
        &self,
        request: &InferenceRequest,
        tokens: Option<mpsc::Sender<StreamingToken>>,
    ) -> RouteOutcome {
        let decision = match self.selector.select(request) {
            Ok(decision) => decision,
            Err(e) => {
                self.metrics.routing_errors.inc();
                tracing::debug!(request_id = %request.request_id(), error = %e, "No viable model");
                return Err(e.into());
            }
        };

        let estimated = request.estimated_tokens(self.config.routing.default_max_tokens);
        let budget = u64::from(estimated).saturating_mul(self.config.memory.bytes_per_token);
        let options = AllocationOptions::new(request.request_id())
            .with_priority(request.user_tier().allocation_priority());
        let allocation = match self.memory.allocate(budget, options).await {
            Ok(allocation) => allocation,
            Err(e) => {
                self.metrics.resource_exhausted.inc();
                tracing::warn!(request_id = %request.request_id(), error = %e, "Execution budget unavailable");
                return Err(e.into());
            }
        };

        let outcome = self.run_chain(request, &decision, tokens).await;
        self.memory.release(allocation);
        outcome
    }

    async fn run_chain(
        &self,
        request: &InferenceRequest,
        decision: &RoutingDecision,
        tokens: Option<mpsc::Sender<StreamingToken>>,
    ) -> RouteOutcome {
        let timeout = Duration::from_millis(self.config.routing.invoke_timeout_ms);
        let mut ctx = FallbackContext::new(decision);
        let mut memory_error = None;

        while let Some(model_id) = ctx.next_model(|m| self.circuits.check(m).is_ok()) {
            let descriptor = self.selector.descriptor(&model_id);
            if let Some(bytes) = descriptor.as_ref().and_then(|d| d.memory_bytes) {
                if let Err(e) = self.memory.ensure_model_resident(&model_id, bytes).await {
                    tracing::warn!(model = %model_id, error = %e, "Model cannot be made resident; skipping");
                    ctx.skip_current();
                    memory_error = Some(e);
                    continue;
                }
            }

            if !ctx.failures().is_empty() {
                self.metrics.fallbacks.inc();
                if let Some(tx) = &tokens {
                    let _ = tx
                        .send(StreamingToken::Restarted {
                            model_id: model_id.clone(),
                        })
                        .await;
                }
            }

            let model_metrics = self.metrics.model(&model_id);
            model_metrics.attempts.inc();
            let started = Instant::now();
            let call = self
                .invoker
                .invoke(&model_id, request.prompt(), request.options(), tokens.clone());
            let result = match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(BackendError::timeout(&model_id, timeout)),
            };

            match result {
                Ok(response) => {
                    self.circuits.record_success(&model_id);
                    model_metrics.successes.inc();
                    let tokens_used = response.tokens_used.unwrap_or_else(|| {
                        request.estimated_tokens(self.config.routing.default_max_tokens)
                    });
                    let latency_ms = response.duration_ms.unwrap_or_else(|| {
                        u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
                    });
                    tracing::debug!(
                        request_id = %request.request_id(),
                        model = %model_id,
                        fallback_depth = ctx.fallback_count(),
                        latency_ms,
                        "Request served"
                    );
                    return Ok(InferenceResponse {
                        cost: descriptor.map_or(0.0, |d| d.estimated_cost(tokens_used)),
                        model_id,
                        text: response.text,
                        tokens_used,
                        latency_ms,
                        fallback_depth: ctx.fallback_count(),
                        served_from: None,
                    });
                }
                Err(e) => {
                    self.circuits.record_failure(&model_id);
                    model_metrics.failures.inc();
                    if matches!(e, BackendError::Timeout { .. }) {
                        model_metrics.timeouts.inc();
                    }
                    tracing::warn!(
                        request_id = %request.request_id(),
                        model = %model_id,
                        error = %e,
                        "Backend call failed"
                    );
                    ctx.record_failure(&model_id, e);
                }
            }
        }

        if ctx.failures().is_empty() {
            // Nothing was called: every model was unavailable by the time we got to it
            if let Some(e) = memory_error {
                self.metrics.resource_exhausted.inc();
                return Err(RouterError::ResourceExhausted(e));
            }
            self.metrics.routing_errors.inc();
            return Err(RoutingError::NoViableModel {
                considered: ctx.depth(),
            }
            .into());
        }

        self.metrics.exhausted_chains.inc();
        tracing::error!(
            request_id = %request.request_id(),
            attempts = ctx.failures().len(),
            "All models in the fallback chain failed"
        );
        Err(ctx.into_exhausted().into())
    }

    fn decode_hit(&self, key: &CacheKey, hit: CacheHit) -> Option<InferenceResponse> {
        match serde_json::from_slice::<InferenceResponse>(&hit.payload) {
            Ok(mut response) => {
                self.metrics.record_hit(hit.tier);
                tracing::debug!(key = %key, tier = %hit.tier, hits = hit.hit_count, "Cache hit");
                response.served_from = Some(hit.tier);
                Some(response)
            }
            Err(e) => {
                let error = CacheError::SerializationFailed(e.to_string());
                tracing::warn!(key = %key, error = %error, "Cached response unreadable; treating as miss");
                None
            }
        }
    }

    async fn store_response(&self, request: &InferenceRequest, key: &CacheKey, response: &InferenceResponse) {
        let hint_missed = request
            .options()
            .model_hint
            .as_deref()
            .is_some_and(|hint| hint != response.model_id);
        let rekeyed;
        let key = if hint_missed {
            rekeyed = CacheKey::for_response(request, self.selector.strategy(), &response.model_id);
            tracing::debug!(model = %response.model_id, key = %rekeyed, "Hinted model did not serve; caching under strategy key");
            &rekeyed
        } else {
            key
        };
        let payload = match serde_json::to_vec(response) {
            Ok(payload) => payload,
            Err(e) => {
                let error = CacheError::SerializationFailed(e.to_string());
                tracing::warn!(key = %key, error = %error, "Response not cached");
                return;
            }
        };
        let quality = self
            .selector
            .descriptor(&response.model_id)
            .map_or(UNKNOWN_MODEL_QUALITY, |d| d.quality_score);
        self.cache.set(key, &payload, response.cost, quality).await;
    }

    async fn refresh_catalog(&self) -> Result<usize, BackendError> {
        let Some(catalog) = &self.catalog else {
            return Ok(self.selector.descriptors().len());
        };
        match catalog.list().await {
            Ok(descriptors) => {
                let count = descriptors.len();
                self.selector.set_descriptors(descriptors);
                tracing::info!(models = count, "Model catalog refreshed");
                Ok(count)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Catalog refresh failed; keeping previous models");
                Err(e)
            }
        }
    }
}

impl RouterStats {
    /// Hits for `tier`
    #[must_use]
    pub fn hits(&self, tier: TierKind) -> u64 {
        match tier {
            TierKind::Hot => self.hot_hits,
            TierKind::Warm => self.warm_hits,
            TierKind::Cold => self.cold_hits,
        }
    }
}

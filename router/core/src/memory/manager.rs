//! Memory Manager
//!
//! Owns the execution budget shared by request allocations, resident local
//! models, parked pool blocks and the in-memory cache tiers:
//!
//! ```text
//! used = charged (allocations + resident models) + pool retained + cache Hot/Warm
//! utilization = used / budget_bytes
//! ```
//!
//! Pressure is recomputed from that sum on every check and mapped onto
//! fixed thresholds. Each state has a cleanup action:
//!
//! | State     | Action                                                        |
//! |-----------|---------------------------------------------------------------|
//! | Warning   | Evict `warning_evict_fraction` of Hot+Warm                    |
//! | Critical  | Evict `critical_evict_fraction` of every tier, unload LRU model |
//! | Emergency | Clear the cache, unload every unpinned model, drop pool blocks |
//!
//! Swappable allocations never fail: idle ones are gzip-compressed to make
//! room, and if that is not enough the new allocation starts out swapped
//! and is materialized on first access.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use super::pool::{Block, PoolStats, ResourcePool};
use crate::backend::ModelLifecycle;
use crate::cache::entry::{compress, decompress};
use crate::cache::{CachePressureTarget, TierKind};
use crate::config::{MemoryConfig, PressureThresholds};
use crate::events::{EventBus, RouterEvent};

// ============================================================================
// Pressure
// ============================================================================

/// Resource utilization tier
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureState {
    /// Below the warning threshold
    #[default]
    Normal,
    /// At or above the warning threshold
    Warning,
    /// At or above the critical threshold
    Critical,
    /// At or above the emergency threshold
    Emergency,
}

impl PressureState {
    /// State for an instantaneous utilization sample
    #[must_use]
    pub fn from_utilization(utilization: f64, thresholds: &PressureThresholds) -> Self {
        if utilization >= thresholds.emergency {
            Self::Emergency
        } else if utilization >= thresholds.critical {
            Self::Critical
        } else if utilization >= thresholds.warning {
            Self::Warning
        } else {
            Self::Normal
        }
    }
}

impl std::fmt::Display for PressureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
            Self::Emergency => write!(f, "emergency"),
        }
    }
}

// ============================================================================
// Allocations
// ============================================================================

/// Compression order for swappable allocations; lower goes first
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPriority {
    /// Background or free-tier work
    Low,
    /// Default
    #[default]
    Normal,
    /// Premium work
    High,
}

/// How an allocation may be treated under pressure
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllocationOptions {
    /// Free-form owner label for diagnostics
    pub owner_tag: String,
    /// Compression order
    pub priority: AllocationPriority,
    /// Whether the manager may compress the allocation while idle
    pub swappable: bool,
}

impl AllocationOptions {
    /// Non-swappable allocation owned by `owner_tag`
    pub fn new(owner_tag: impl Into<String>) -> Self {
        Self {
            owner_tag: owner_tag.into(),
            ..Self::default()
        }
    }

    /// Set the priority
    #[must_use]
    pub fn with_priority(mut self, priority: AllocationPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Allow compression while idle
    #[must_use]
    pub fn swappable(mut self) -> Self {
        self.swappable = true;
        self
    }
}

/// Handle to memory owned by the manager
///
/// Hand it back with [`MemoryManager::release`]. Allocations left idle past
/// `idle_allocation_timeout_secs` are swept and the handle goes stale.
#[derive(Debug)]
pub struct Allocation {
    id: u64,
    size: u64,
    owner_tag: String,
    priority: AllocationPriority,
    swappable: bool,
}

impl Allocation {
    /// Manager-assigned id
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Requested bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Owner label
    #[must_use]
    pub fn owner_tag(&self) -> &str {
        &self.owner_tag
    }

    /// Compression order
    #[must_use]
    pub fn priority(&self) -> AllocationPriority {
        self.priority
    }

    /// Whether the allocation may be compressed
    #[must_use]
    pub fn swappable(&self) -> bool {
        self.swappable
    }
}

/// Live view of an allocation
#[derive(Clone, Debug, PartialEq)]
pub struct AllocationInfo {
    /// Requested bytes
    pub size: u64,
    /// Bytes currently charged against the budget
    pub charged_bytes: u64,
    /// Whether the contents are currently swapped out
    pub compressed: bool,
    /// Last read or write
    pub last_accessed: Instant,
}

/// Memory failures
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    /// Non-swappable request could not be satisfied after cleanup
    #[error("memory exhausted: requested {requested} bytes, {available} available")]
    Exhausted {
        /// Bytes requested
        requested: u64,
        /// Bytes free at the time of failure
        available: u64,
    },

    /// Handle was released or swept
    #[error("allocation {0} is no longer live")]
    UnknownAllocation(u64),

    /// Access outside the allocation
    #[error("access of {len} bytes at offset {offset} exceeds allocation of {size} bytes")]
    OutOfBounds {
        /// Start of the access
        offset: u64,
        /// Length of the access
        len: u64,
        /// Allocation size
        size: u64,
    },

    /// Swapped contents could not be restored
    #[error("allocation {id} could not be restored: {detail}")]
    Corrupt {
        /// Allocation id
        id: u64,
        /// What failed
        detail: String,
    },
}

enum Residency {
    Resident(Block),
    Compressed(Vec<u8>),
    /// Swapped before it was ever written; contents are zero
    Unbacked,
}

struct AllocationRecord {
    size: u64,
    priority: AllocationPriority,
    swappable: bool,
    residency: Residency,
    last_accessed: Instant,
}

impl AllocationRecord {
    fn charged_bytes(&self) -> u64 {
        match &self.residency {
            Residency::Resident(block) => block.capacity_bytes(),
            Residency::Compressed(packed) => packed.len() as u64,
            Residency::Unbacked => 0,
        }
    }

    fn is_idle(&self, now: Instant, min_idle: Duration) -> bool {
        now.saturating_duration_since(self.last_accessed) >= min_idle
    }
}

// ============================================================================
// Resident models
// ============================================================================

/// A local model counted against the budget
#[derive(Clone, Debug, PartialEq)]
pub struct ResidentModel {
    /// Model id
    pub model_id: String,
    /// Bytes charged
    pub memory_bytes: u64,
    /// When it became resident
    pub loaded_at: Instant,
    /// Last request served
    pub last_used: Instant,
    /// Requests served while resident
    pub request_count: u64,
}

/// Memory counters
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MemoryStats {
    /// Managed bytes
    pub budget_bytes: u64,
    /// Bytes charged by allocations and resident models
    pub charged_bytes: u64,
    /// Bytes parked in the pool
    pub retained_bytes: u64,
    /// Bytes held by the in-memory cache tiers
    pub cache_resident_bytes: u64,
    /// `used / budget`
    pub utilization: f64,
    /// State for `utilization`
    pub pressure: PressureState,
    /// Live allocations
    pub allocations: usize,
    /// Allocations currently swapped out
    pub compressed_allocations: usize,
    /// Resident model ids
    pub resident_models: Vec<String>,
    /// Pool usage
    pub pool: PoolStats,
}

// ============================================================================
// MemoryManager
// ============================================================================

/// Tracks allocations and resident models, and drives pressure cleanup
pub struct MemoryManager {
    config: MemoryConfig,
    pool: ResourcePool,
    charged: AtomicU64,
    next_id: AtomicU64,
    allocations: Mutex<HashMap<u64, Arc<Mutex<AllocationRecord>>>>,
    models: Mutex<HashMap<String, ResidentModel>>,
    last_state: Mutex<PressureState>,
    cache: Option<Arc<dyn CachePressureTarget>>,
    lifecycle: Option<Arc<dyn ModelLifecycle>>,
    events: EventBus,
}

impl MemoryManager {
    /// Create a manager with no cache or lifecycle attached
    #[must_use]
    pub fn new(config: MemoryConfig) -> Self {
        let pool = ResourcePool::new(&config.size_classes, config.max_blocks_per_class);
        Self {
            config,
            pool,
            charged: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            allocations: Mutex::new(HashMap::new()),
            models: Mutex::new(HashMap::new()),
            last_state: Mutex::new(PressureState::Normal),
            cache: None,
            lifecycle: None,
            events: EventBus::default(),
        }
    }

    /// Count `cache` against the budget and evict from it under pressure
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn CachePressureTarget>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Unload models through `lifecycle` under pressure
    #[must_use]
    pub fn with_lifecycle(mut self, lifecycle: Arc<dyn ModelLifecycle>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Publish pressure changes on `events`
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Settings in use
    #[must_use]
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Accounting
    // ------------------------------------------------------------------------

    /// Bytes in use across every consumer
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.charged.load(Ordering::Acquire) + self.external_bytes()
    }

    /// Bytes left in the budget
    #[must_use]
    pub fn available_bytes(&self) -> u64 {
        self.config.budget_bytes.saturating_sub(self.used_bytes())
    }

    /// `used / budget`, computed now
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.config.budget_bytes == 0 {
            return 1.0;
        }
        self.used_bytes() as f64 / self.config.budget_bytes as f64
    }

    fn external_bytes(&self) -> u64 {
        self.pool.retained_bytes() + self.cache.as_ref().map_or(0, |c| c.resident_bytes())
    }

    fn try_charge(&self, amount: u64) -> bool {
        let budget = self.config.budget_bytes;
        let mut current = self.charged.load(Ordering::Acquire);
        loop {
            if current + amount + self.external_bytes() > budget {
                return false;
            }
            match self.charged.compare_exchange_weak(
                current,
                current + amount,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn force_charge(&self, amount: u64) {
        self.charged.fetch_add(amount, Ordering::AcqRel);
    }

    fn uncharge(&self, amount: u64) {
        let _ = self
            .charged
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some(c.saturating_sub(amount))
            });
    }

    // ------------------------------------------------------------------------
    // Allocations
    // ------------------------------------------------------------------------

    /// Reserve `size` bytes
    ///
    /// Runs compression (swappable only) and then critical cleanup before
    /// giving up. Only non-swappable requests can fail with
    /// [`MemoryError::Exhausted`].
    pub async fn allocate(&self, size: u64, options: AllocationOptions) -> Result<Allocation, MemoryError> {
        if let Some(allocation) = self.try_allocate(size, &options) {
            return Ok(allocation);
        }

        if options.swappable {
            let reclaimed = self.compress_idle(self.compress_after(), size);
            if reclaimed > 0 {
                if let Some(allocation) = self.try_allocate(size, &options) {
                    return Ok(allocation);
                }
            }
        }

        tracing::debug!(size, owner = %options.owner_tag, "Allocation does not fit, running critical cleanup");
        self.run_actions(PressureState::Critical).await;
        if let Some(allocation) = self.try_allocate(size, &options) {
            return Ok(allocation);
        }

        if options.swappable {
            tracing::warn!(size, owner = %options.owner_tag, "No room for swappable allocation, starting it swapped out");
            return Ok(self.register(size, &options, Residency::Unbacked));
        }

        let available = self.available_bytes();
        tracing::warn!(size, available, owner = %options.owner_tag, "Memory exhausted");
        Err(MemoryError::Exhausted {
            requested: size,
            available,
        })
    }

    fn try_allocate(&self, size: u64, options: &AllocationOptions) -> Option<Allocation> {
        if self.pool.class_for(size).is_none() && size > self.available_bytes() {
            return None;
        }
        let block = self.pool.acquire(size)?;
        if !self.try_charge(block.capacity_bytes()) {
            self.pool.discard(block);
            return None;
        }
        Some(self.register(size, options, Residency::Resident(block)))
    }

    fn register(&self, size: u64, options: &AllocationOptions, residency: Residency) -> Allocation {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = AllocationRecord {
            size,
            priority: options.priority,
            swappable: options.swappable,
            residency,
            last_accessed: Instant::now(),
        };
        self.allocations
            .lock()
            .insert(id, Arc::new(Mutex::new(record)));
        Allocation {
            id,
            size,
            owner_tag: options.owner_tag.clone(),
            priority: options.priority,
            swappable: options.swappable,
        }
    }

    /// Give an allocation back; stale handles are ignored
    pub fn release(&self, allocation: Allocation) {
        let removed = self.allocations.lock().remove(&allocation.id);
        match removed {
            Some(record) => self.free_record(&mut record.lock()),
            None => tracing::debug!(id = allocation.id, "Release of allocation that was already swept"),
        }
    }

    fn free_record(&self, record: &mut AllocationRecord) {
        match std::mem::replace(&mut record.residency, Residency::Unbacked) {
            Residency::Resident(block) => {
                self.uncharge(block.capacity_bytes());
                self.pool.release(block);
            }
            Residency::Compressed(packed) => self.uncharge(packed.len() as u64),
            Residency::Unbacked => {}
        }
    }

    fn record(&self, id: u64) -> Result<Arc<Mutex<AllocationRecord>>, MemoryError> {
        self.allocations
            .lock()
            .get(&id)
            .cloned()
            .ok_or(MemoryError::UnknownAllocation(id))
    }

    /// Current state of an allocation
    pub fn info(&self, allocation: &Allocation) -> Result<AllocationInfo, MemoryError> {
        let record = self.record(allocation.id)?;
        let record = record.lock();
        Ok(AllocationInfo {
            size: record.size,
            charged_bytes: record.charged_bytes(),
            compressed: !matches!(record.residency, Residency::Resident(_)),
            last_accessed: record.last_accessed,
        })
    }

    /// Copy out the allocation's contents, restoring them if swapped
    pub fn read(&self, allocation: &Allocation) -> Result<Vec<u8>, MemoryError> {
        let record = self.record(allocation.id)?;
        let mut record = record.lock();
        let block = self.restore(allocation.id, &mut record)?;
        let len = usize::try_from(allocation.size).unwrap_or(usize::MAX);
        let data = block.as_slice()[..len.min(block.as_slice().len())].to_vec();
        record.last_accessed = Instant::now();
        Ok(data)
    }

    /// Write `bytes` at `offset`, restoring the contents if swapped
    pub fn write(&self, allocation: &Allocation, offset: u64, bytes: &[u8]) -> Result<(), MemoryError> {
        let len = bytes.len() as u64;
        if offset.checked_add(len).map_or(true, |end| end > allocation.size) {
            return Err(MemoryError::OutOfBounds {
                offset,
                len,
                size: allocation.size,
            });
        }
        let record = self.record(allocation.id)?;
        let mut record = record.lock();
        let block = self.restore(allocation.id, &mut record)?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        block.as_mut_slice()[start..start + bytes.len()].copy_from_slice(bytes);
        record.last_accessed = Instant::now();
        Ok(())
    }

    fn restore<'r>(&self, id: u64, record: &'r mut AllocationRecord) -> Result<&'r mut Block, MemoryError> {
        if !matches!(record.residency, Residency::Resident(_)) {
            let contents = match &record.residency {
                Residency::Compressed(packed) => Some(decompress(packed).map_err(|e| MemoryError::Corrupt {
                    id,
                    detail: e.to_string(),
                })?),
                _ => None,
            };
            let mut block = self.pool.acquire(record.size).ok_or(MemoryError::Exhausted {
                requested: record.size,
                available: self.available_bytes(),
            })?;
            if let Some(contents) = contents {
                let n = contents.len().min(block.as_slice().len());
                block.as_mut_slice()[..n].copy_from_slice(&contents[..n]);
            }
            // Restores are charged even past the budget; the next pressure check reacts
            self.uncharge(record.charged_bytes());
            self.force_charge(block.capacity_bytes());
            record.residency = Residency::Resident(block);
            tracing::debug!(id, "Restored swapped allocation");
        }
        match &mut record.residency {
            Residency::Resident(block) => Ok(block),
            _ => Err(MemoryError::UnknownAllocation(id)),
        }
    }

    fn compress_after(&self) -> Duration {
        Duration::from_secs(self.config.compress_after_idle_secs)
    }

    /// Compress idle swappable allocations until `target` bytes are reclaimed
    ///
    /// Lower priority and longer idle allocations go first. Returns bytes reclaimed.
    pub fn compress_idle(&self, min_idle: Duration, target: u64) -> u64 {
        let now = Instant::now();
        let records: Vec<_> = self.allocations.lock().values().cloned().collect();
        let mut candidates: Vec<_> = records
            .into_iter()
            .filter_map(|record| {
                let key = {
                    let r = record.lock();
                    let eligible = r.swappable
                        && matches!(r.residency, Residency::Resident(_))
                        && r.is_idle(now, min_idle);
                    eligible.then_some((r.priority, r.last_accessed))
                };
                key.map(|k| (k, record))
            })
            .collect();
        candidates.sort_by_key(|(key, _)| *key);

        let mut reclaimed = 0;
        for (_, record) in candidates {
            if reclaimed >= target {
                break;
            }
            reclaimed += self.compress_record(&mut record.lock(), now, min_idle);
        }
        if reclaimed > 0 {
            tracing::debug!(bytes = reclaimed, "Compressed idle allocations");
        }
        reclaimed
    }

    fn compress_record(&self, record: &mut AllocationRecord, now: Instant, min_idle: Duration) -> u64 {
        if !record.is_idle(now, min_idle) {
            return 0;
        }
        let Residency::Resident(block) = &record.residency else {
            return 0;
        };
        let len = usize::try_from(record.size).unwrap_or(usize::MAX).min(block.as_slice().len());
        let packed = match compress(&block.as_slice()[..len]) {
            Ok(packed) => packed,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to compress idle allocation");
                return 0;
            }
        };
        let packed_len = packed.len() as u64;
        if packed_len >= block.capacity_bytes() {
            return 0;
        }
        let Residency::Resident(block) = std::mem::replace(&mut record.residency, Residency::Compressed(packed)) else {
            return 0;
        };
        let freed = block.capacity_bytes();
        self.pool.discard(block);
        self.uncharge(freed);
        self.force_charge(packed_len);
        freed - packed_len
    }

    /// Release allocations idle past `idle_allocation_timeout_secs`
    pub fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let timeout = Duration::from_secs(self.config.idle_allocation_timeout_secs);
        let snapshot: Vec<_> = self
            .allocations
            .lock()
            .iter()
            .map(|(&id, record)| (id, Arc::clone(record)))
            .collect();
        let idle: Vec<u64> = snapshot
            .into_iter()
            .filter(|(_, record)| record.lock().is_idle(now, timeout))
            .map(|(id, _)| id)
            .collect();

        let mut swept = 0;
        for id in idle {
            let removed = self.allocations.lock().remove(&id);
            if let Some(record) = removed {
                self.free_record(&mut record.lock());
                swept += 1;
            }
        }
        if swept > 0 {
            tracing::info!(swept, "Swept idle allocations");
        }
        swept
    }

    // ------------------------------------------------------------------------
    // Resident models
    // ------------------------------------------------------------------------

    /// Charge `memory_bytes` for a local model unless it is already resident
    ///
    /// Returns `true` when the model became resident with this call.
    pub async fn ensure_model_resident(&self, model_id: &str, memory_bytes: u64) -> Result<bool, MemoryError> {
        if self.touch_model(model_id) {
            return Ok(false);
        }
        if !self.try_charge(memory_bytes) {
            self.run_actions(PressureState::Critical).await;
            if !self.try_charge(memory_bytes) {
                return Err(MemoryError::Exhausted {
                    requested: memory_bytes,
                    available: self.available_bytes(),
                });
            }
        }

        let raced = {
            let mut models = self.models.lock();
            match models.get_mut(model_id) {
                Some(model) => {
                    model.last_used = Instant::now();
                    model.request_count += 1;
                    true
                }
                None => {
                    let now = Instant::now();
                    models.insert(
                        model_id.to_string(),
                        ResidentModel {
                            model_id: model_id.to_string(),
                            memory_bytes,
                            loaded_at: now,
                            last_used: now,
                            request_count: 1,
                        },
                    );
                    false
                }
            }
        };
        if raced {
            self.uncharge(memory_bytes);
            return Ok(false);
        }
        tracing::info!(model = %model_id, bytes = memory_bytes, "Model resident");
        Ok(true)
    }

    /// Record use of a resident model; `false` if it is not resident
    pub fn touch_model(&self, model_id: &str) -> bool {
        let mut models = self.models.lock();
        match models.get_mut(model_id) {
            Some(model) => {
                model.last_used = Instant::now();
                model.request_count += 1;
                true
            }
            None => false,
        }
    }

    /// Resident models, least recently used first
    #[must_use]
    pub fn resident_models(&self) -> Vec<ResidentModel> {
        let mut models: Vec<_> = self.models.lock().values().cloned().collect();
        models.sort_by(|a, b| a.last_used.cmp(&b.last_used).then_with(|| a.model_id.cmp(&b.model_id)));
        models
    }

    fn is_pinned(&self, model_id: &str) -> bool {
        self.lifecycle
            .as_ref()
            .is_some_and(|lifecycle| lifecycle.is_pinned(model_id))
    }

    async fn unload_model(&self, model_id: &str) -> bool {
        if let Some(lifecycle) = &self.lifecycle {
            if let Err(e) = lifecycle.unload(model_id).await {
                tracing::warn!(model = %model_id, error = %e, "Failed to unload model");
                return false;
            }
        }
        let removed = self.models.lock().remove(model_id);
        match removed {
            Some(model) => {
                self.uncharge(model.memory_bytes);
                tracing::info!(model = %model_id, bytes = model.memory_bytes, "Model unloaded");
                true
            }
            None => false,
        }
    }

    /// Unload the least recently used unpinned model
    pub async fn unload_lru_model(&self) -> Option<String> {
        let victim = self
            .resident_models()
            .into_iter()
            .map(|m| m.model_id)
            .find(|id| !self.is_pinned(id))?;
        self.unload_model(&victim).await.then_some(victim)
    }

    /// Unload unpinned models idle for at least `timeout`
    pub async fn unload_idle_models(&self, timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        let idle: Vec<String> = self
            .resident_models()
            .into_iter()
            .filter(|m| now.saturating_duration_since(m.last_used) >= timeout)
            .map(|m| m.model_id)
            .collect();
        self.unload_all(idle).await
    }

    async fn unload_all(&self, candidates: Vec<String>) -> Vec<String> {
        let mut unloaded = Vec::new();
        for id in candidates {
            if self.is_pinned(&id) {
                continue;
            }
            if self.unload_model(&id).await {
                unloaded.push(id);
            }
        }
        unloaded
    }

    /// Idle-model unloads plus the idle-allocation sweep
    pub async fn run_idle_scan(&self) -> (Vec<String>, usize) {
        let unloaded = self
            .unload_idle_models(Duration::from_secs(self.config.idle_model_timeout_secs))
            .await;
        let swept = self.sweep_idle();
        (unloaded, swept)
    }

    // ------------------------------------------------------------------------
    // Pressure
    // ------------------------------------------------------------------------

    /// State for the utilization right now; publishes a change event
    pub fn check_pressure(&self) -> PressureState {
        let utilization = self.utilization();
        let state = PressureState::from_utilization(utilization, &self.config.pressure_thresholds);
        let previous = std::mem::replace(&mut *self.last_state.lock(), state);
        if previous != state {
            let alert = state == PressureState::Emergency;
            if alert {
                tracing::error!(utilization, from = %previous, "Memory pressure emergency");
            } else {
                tracing::info!(utilization, from = %previous, to = %state, "Memory pressure changed");
            }
            self.events.emit(RouterEvent::PressureChanged {
                from: previous,
                to: state,
                utilization,
                alert,
            });
        }
        state
    }

    /// Check pressure, release idle pool blocks, run the cleanup for what remains, and check again
    pub async fn relieve_pressure(&self) -> PressureState {
        let mut state = self.check_pressure();
        if state == PressureState::Normal {
            return state;
        }
        // Idle pool blocks are released before anything is evicted
        if self.pool.release_retained() > 0 {
            state = self.check_pressure();
            if state == PressureState::Normal {
                return state;
            }
        }
        self.run_actions(state).await;
        self.check_pressure()
    }

    async fn run_actions(&self, state: PressureState) {
        match state {
            PressureState::Normal => {}
            PressureState::Warning => {
                if let Some(cache) = &self.cache {
                    let freed = cache
                        .evict_fraction(&[TierKind::Hot, TierKind::Warm], self.config.warning_evict_fraction)
                        .await;
                    tracing::debug!(bytes = freed, "Warning cleanup evicted cache entries");
                }
            }
            PressureState::Critical => {
                self.pool.release_retained();
                if let Some(cache) = &self.cache {
                    let freed = cache
                        .evict_fraction(&TierKind::ALL, self.config.critical_evict_fraction)
                        .await;
                    tracing::debug!(bytes = freed, "Critical cleanup evicted cache entries");
                }
                if let Some(model) = self.unload_lru_model().await {
                    tracing::info!(model = %model, "Critical cleanup unloaded model");
                }
            }
            PressureState::Emergency => {
                tracing::error!(utilization = self.utilization(), "Emergency cleanup: clearing cache and unloading models");
                if let Some(cache) = &self.cache {
                    cache.clear_all().await;
                }
                let candidates = self.resident_models().into_iter().map(|m| m.model_id).collect();
                self.unload_all(candidates).await;
                self.pool.release_retained();
            }
        }
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        let utilization = self.utilization();
        let (allocations, compressed_allocations) = {
            let records: Vec<_> = self.allocations.lock().values().cloned().collect();
            let compressed = records
                .iter()
                .filter(|r| !matches!(r.lock().residency, Residency::Resident(_)))
                .count();
            (records.len(), compressed)
        };
        MemoryStats {
            budget_bytes: self.config.budget_bytes,
            charged_bytes: self.charged.load(Ordering::Acquire),
            retained_bytes: self.pool.retained_bytes(),
            cache_resident_bytes: self.cache.as_ref().map_or(0, |c| c.resident_bytes()),
            utilization,
            pressure: PressureState::from_utilization(utilization, &self.config.pressure_thresholds),
            allocations,
            compressed_allocations,
            resident_models: self.resident_models().into_iter().map(|m| m.model_id).collect(),
            pool: self.pool.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockLifecycle, MockPressureTarget};
    use pretty_assertions::assert_eq;

    fn config() -> MemoryConfig {
        MemoryConfig {
            budget_bytes: 1000,
            size_classes: vec![64, 256],
            max_blocks_per_class: 8,
            ..MemoryConfig::default()
        }
    }

    #[test]
    fn test_thresholds_map_instantaneously() {
        let t = PressureThresholds::default();
        assert_eq!(PressureState::from_utilization(0.60, &t), PressureState::Normal);
        assert_eq!(PressureState::from_utilization(0.75, &t), PressureState::Warning);
        assert_eq!(PressureState::from_utilization(0.92, &t), PressureState::Critical);
        assert_eq!(PressureState::from_utilization(0.96, &t), PressureState::Emergency);
    }

    #[tokio::test]
    async fn test_allocate_and_release() {
        let manager = MemoryManager::new(config());
        let a = manager.allocate(100, AllocationOptions::new("req")).await.unwrap();
        assert_eq!(a.size(), 100);
        assert_eq!(manager.used_bytes(), 256);

        manager.release(a);
        assert_eq!(manager.stats().charged_bytes, 0);
        // The freed block is parked for reuse
        assert_eq!(manager.used_bytes(), 256);
        let b = manager.allocate(200, AllocationOptions::new("req")).await.unwrap();
        assert_eq!(manager.used_bytes(), 256);
        assert_eq!(manager.stats().pool.reused, 1);
        manager.release(b);
    }

    #[tokio::test]
    async fn test_non_swappable_exhaustion_after_cleanup() {
        let cache = Arc::new(MockPressureTarget::new(200));
        let manager = MemoryManager::new(config()).with_cache(cache.clone());
        let _held: Vec<_> = futures::future::join_all(
            (0..3).map(|_| manager.allocate(256, AllocationOptions::new("req"))),
        )
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

        let err = manager.allocate(256, AllocationOptions::new("req")).await.unwrap_err();
        assert!(matches!(err, MemoryError::Exhausted { requested: 256, .. }));
        assert_eq!(cache.fractions(), vec![0.30]);
    }

    #[tokio::test]
    async fn test_critical_cleanup_can_make_room() {
        let cache = Arc::new(MockPressureTarget::new(500));
        let manager = MemoryManager::new(config()).with_cache(cache.clone());
        let _a = manager.allocate(256, AllocationOptions::new("a")).await.unwrap();

        // 756 used; another block only fits once 30% of the cache is gone
        let b = manager.allocate(256, AllocationOptions::new("b")).await;
        assert!(b.is_ok());
        assert_eq!(cache.resident(), 350);
    }

    #[tokio::test(start_paused = true)]
    async fn test_swappable_allocation_compresses_idle_neighbours() {
        let manager = MemoryManager::new(config());
        let old = manager
            .allocate(200, AllocationOptions::new("old").swappable())
            .await
            .unwrap();
        let contents = b"ab".repeat(100);
        manager.write(&old, 0, &contents).unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        let _b = manager.allocate(256, AllocationOptions::new("b")).await.unwrap();
        let _c = manager.allocate(256, AllocationOptions::new("c")).await.unwrap();
        let _d = manager
            .allocate(256, AllocationOptions::new("d").swappable())
            .await
            .unwrap();

        let info = manager.info(&old).unwrap();
        assert!(info.compressed);
        assert!(info.charged_bytes < 256);
        assert_eq!(manager.stats().compressed_allocations, 1);

        assert_eq!(manager.read(&old).unwrap(), contents);
        assert!(!manager.info(&old).unwrap().compressed);
    }

    #[tokio::test]
    async fn test_swappable_allocation_degrades_instead_of_failing() {
        let manager = MemoryManager::new(config());
        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(manager.allocate(256, AllocationOptions::new("req")).await.unwrap());
        }
        let swapped = manager
            .allocate(256, AllocationOptions::new("bg").swappable())
            .await
            .unwrap();

        let info = manager.info(&swapped).unwrap();
        assert!(info.compressed);
        assert_eq!(info.charged_bytes, 0);
        assert_eq!(manager.read(&swapped).unwrap(), vec![0; 256]);
    }

    #[tokio::test]
    async fn test_out_of_bounds_write_is_rejected() {
        let manager = MemoryManager::new(config());
        let a = manager.allocate(10, AllocationOptions::new("req")).await.unwrap();
        assert_eq!(
            manager.write(&a, 8, b"abc"),
            Err(MemoryError::OutOfBounds {
                offset: 8,
                len: 3,
                size: 10
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_allocations_are_swept() {
        let manager = MemoryManager::new(config());
        let a = manager.allocate(10, AllocationOptions::new("req")).await.unwrap();
        tokio::time::advance(Duration::from_secs(601)).await;

        assert_eq!(manager.sweep_idle(), 1);
        assert_eq!(manager.stats().charged_bytes, 0);
        assert_eq!(manager.read(&a), Err(MemoryError::UnknownAllocation(a.id())));
        manager.release(a);
    }

    #[tokio::test]
    async fn test_pressure_jumps_straight_to_emergency() {
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let manager = MemoryManager::new(config()).with_events(events);

        manager.ensure_model_resident("m1", 600).await.unwrap();
        assert_eq!(manager.check_pressure(), PressureState::Normal);

        manager.ensure_model_resident("m2", 360).await.unwrap();
        assert_eq!(manager.check_pressure(), PressureState::Emergency);

        let RouterEvent::PressureChanged { from, to, alert, .. } = rx.recv().await.unwrap() else {
            panic!("expected pressure event");
        };
        assert_eq!((from, to, alert), (PressureState::Normal, PressureState::Emergency, true));
    }

    #[tokio::test]
    async fn test_unchanged_state_emits_nothing() {
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let manager = MemoryManager::new(config()).with_events(events);
        manager.check_pressure();
        manager.check_pressure();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_relief_evicts_cache_and_unloads_lru_model() {
        let cache = Arc::new(MockPressureTarget::new(500));
        let lifecycle = Arc::new(MockLifecycle::new());
        let manager = MemoryManager::new(config())
            .with_cache(cache.clone())
            .with_lifecycle(lifecycle.clone());

        manager.ensure_model_resident("older", 200).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        manager.ensure_model_resident("newer", 220).await.unwrap();
        assert_eq!(manager.check_pressure(), PressureState::Critical);

        let after = manager.relieve_pressure().await;
        assert_eq!(after, PressureState::Normal);
        assert_eq!(cache.resident(), 350);
        assert_eq!(lifecycle.unloaded(), vec!["older".to_string()]);
        assert_eq!(manager.stats().resident_models, vec!["newer".to_string()]);
    }

    #[tokio::test]
    async fn test_retained_pool_blocks_released_before_cache_eviction() {
        let cache = Arc::new(MockPressureTarget::new(100));
        let manager = MemoryManager::new(config()).with_cache(cache.clone());
        let mut allocations = Vec::new();
        for _ in 0..3 {
            allocations.push(manager.allocate(256, AllocationOptions::new("req")).await.unwrap());
        }
        for allocation in allocations {
            manager.release(allocation);
        }
        assert_eq!(manager.stats().retained_bytes, 768);
        assert_eq!(manager.check_pressure(), PressureState::Warning);

        assert_eq!(manager.relieve_pressure().await, PressureState::Normal);
        let stats = manager.stats();
        assert_eq!(stats.retained_bytes, 0);
        assert_eq!(stats.charged_bytes, 0);
        assert!(cache.fractions().is_empty());
        assert_eq!(cache.resident(), 100);
    }

    #[tokio::test]
    async fn test_emergency_relief_keeps_pinned_models() {
        let cache = Arc::new(MockPressureTarget::new(300));
        let lifecycle = Arc::new(MockLifecycle::new().with_pinned(["base"]));
        let manager = MemoryManager::new(config())
            .with_cache(cache.clone())
            .with_lifecycle(lifecycle.clone());
        manager.ensure_model_resident("base", 300).await.unwrap();
        manager.ensure_model_resident("extra", 360).await.unwrap();

        manager.relieve_pressure().await;
        assert_eq!(cache.resident(), 0);
        assert_eq!(lifecycle.unloaded(), vec!["extra".to_string()]);
        assert_eq!(manager.stats().resident_models, vec!["base".to_string()]);
        assert_eq!(manager.check_pressure(), PressureState::Normal);
    }

    #[tokio::test]
    async fn test_failed_unload_keeps_model_charged() {
        let lifecycle = Arc::new(MockLifecycle::new().failing());
        let manager = MemoryManager::new(config()).with_lifecycle(lifecycle);
        manager.ensure_model_resident("m", 100).await.unwrap();
        assert_eq!(manager.unload_lru_model().await, None);
        assert_eq!(manager.stats().charged_bytes, 100);
    }

    #[tokio::test]
    async fn test_oversized_model_is_exhausted() {
        let manager = MemoryManager::new(config());
        assert!(matches!(
            manager.ensure_model_resident("huge", 2000).await,
            Err(MemoryError::Exhausted { requested: 2000, .. })
        ));
        assert!(manager.ensure_model_resident("small", 100).await.unwrap());
        assert!(!manager.ensure_model_resident("small", 100).await.unwrap());
        assert_eq!(manager.stats().charged_bytes, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_models_unloaded_by_scan() {
        let lifecycle = Arc::new(MockLifecycle::new().with_pinned(["keep"]));
        let manager = MemoryManager::new(config()).with_lifecycle(lifecycle.clone());
        manager.ensure_model_resident("keep", 100).await.unwrap();
        manager.ensure_model_resident("idle", 100).await.unwrap();
        tokio::time::advance(Duration::from_secs(301)).await;
        manager.ensure_model_resident("busy", 100).await.unwrap();

        let (unloaded, swept) = manager.run_idle_scan().await;
        assert_eq!(unloaded, vec!["idle".to_string()]);
        assert_eq!(swept, 0);
        assert_eq!(lifecycle.unloaded(), vec!["idle".to_string()]);
    }
}

//! Multi-tier Response Cache
//!
//! Three tiers with independent budgets and admission floors:
//!
//! ```text
//!   get ──► Hot ──miss──► Warm ──miss──► Cold (PersistentStore)
//!            ▲             │  ▲            │
//!            └──promote────┘  └──promote───┘
//!
//!   set ──► Cold (always attempted) ──► Warm (if admitted) ──► Hot (if admitted)
//! ```
//!
//! - Hot keeps payloads uncompressed; Warm and Cold gzip payloads above
//!   `compression_threshold_bytes`.
//! - Promotion copies an entry upward; the lower tier keeps its copy, and
//!   eviction from an upper tier never touches lower tiers.
//! - Cache failures (corrupt envelopes, store I/O) are logged and reported
//!   as misses.
//!
//! Each tier sits behind its own lock. Locks are never held across store I/O.

pub mod entry;
pub mod envelope;
pub mod inflight;
pub mod key;
pub mod tier;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use crate::backend::PersistentStore;
use crate::config::CacheConfig;
use crate::events::{EventBus, EvictionReason, RouterEvent};

pub use entry::EntryMeta;
pub use inflight::{Claim, InFlightError, InFlightLeader, InFlightMap, InFlightWaiter};
pub use key::CacheKey;
pub use tier::{CacheTier, Evicted, InsertOutcome, TierKind, TierLookup, TierPolicy};

use envelope::ColdMeta;

// ============================================================================
// Errors
// ============================================================================

/// Cache failures; always recovered as a miss
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    /// Stored bytes failed integrity or decompression checks
    #[error("corrupt cache entry: {0}")]
    Corrupt(String),

    /// Entry could not be encoded or decoded
    #[error("cache serialization failed: {0}")]
    SerializationFailed(String),

    /// The persistent store failed
    #[error("cache store error: {0}")]
    Store(String),
}

// ============================================================================
// Public types
// ============================================================================

/// A served cache entry
#[derive(Clone, Debug, PartialEq)]
pub struct CacheHit {
    /// Uncompressed payload
    pub payload: Vec<u8>,
    /// Tier that served it
    pub tier: TierKind,
    /// Hits including this one
    pub hit_count: u64,
    /// Cost of the call the entry saved
    pub original_cost: f64,
}

/// Result of [`MultiTierCache::get_or_await`]
#[derive(Debug)]
pub enum Lookup<O> {
    /// Served from cache
    Hit(CacheHit),
    /// Nothing cached or in flight: the caller must produce the outcome
    Leader(InFlightLeader<O>),
    /// A call for the same key is in flight
    Follower(InFlightWaiter<O>),
}

/// Usage of one tier
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TierStats {
    /// Tier
    pub tier: TierKind,
    /// Entries held
    pub entries: usize,
    /// Bytes held
    pub used_bytes: u64,
    /// Byte budget
    pub budget_bytes: u64,
    /// Hits served
    pub hits: u64,
}

/// Cache-wide counters
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CacheStats {
    /// Per-tier usage, Hot first
    pub tiers: Vec<TierStats>,
    /// Lookups that missed every tier
    pub misses: u64,
    /// Entries evicted for any reason
    pub evictions: u64,
    /// Errors recovered as misses
    pub errors: u64,
    /// Keys with a call in flight
    pub in_flight: usize,
}

/// What the memory manager needs from the cache under pressure
#[async_trait]
pub trait CachePressureTarget: Send + Sync {
    /// Bytes held in memory (Hot + Warm)
    fn resident_bytes(&self) -> u64;

    /// Evict `fraction` of each listed tier's bytes; returns bytes freed
    async fn evict_fraction(&self, tiers: &[TierKind], fraction: f64) -> u64;

    /// Empty every tier; returns bytes freed
    async fn clear_all(&self) -> u64;
}

#[derive(Debug, Default)]
struct Counters {
    hits: [AtomicU64; 3],
    misses: AtomicU64,
    evictions: AtomicU64,
    errors: AtomicU64,
}

fn tier_index(kind: TierKind) -> usize {
    match kind {
        TierKind::Hot => 0,
        TierKind::Warm => 1,
        TierKind::Cold => 2,
    }
}

// ============================================================================
// MultiTierCache
// ============================================================================

/// Hot/Warm/Cold cache with in-flight deduplication
///
/// `O` is the outcome type shared between deduplicated callers.
pub struct MultiTierCache<O> {
    hot: Mutex<CacheTier<Vec<u8>>>,
    warm: Mutex<CacheTier<Vec<u8>>>,
    cold: Mutex<CacheTier<()>>,
    store: Arc<dyn PersistentStore>,
    config: CacheConfig,
    inflight: Arc<InFlightMap<O>>,
    events: EventBus,
    counters: Counters,
}

impl<O: Clone + Send + Sync + 'static> MultiTierCache<O> {
    /// Create a cache whose Cold tier writes to `store`
    pub fn new(config: CacheConfig, store: Arc<dyn PersistentStore>, events: EventBus) -> Self {
        let policy = |kind, budget_bytes, admission_floor| TierPolicy {
            kind,
            budget_bytes,
            admission_floor,
            age_weight: config.age_weight,
        };
        Self {
            hot: Mutex::new(CacheTier::new(policy(
                TierKind::Hot,
                config.hot_budget_bytes,
                config.hot_admission_floor,
            ))),
            warm: Mutex::new(CacheTier::new(policy(
                TierKind::Warm,
                config.warm_budget_bytes,
                config.warm_admission_floor,
            ))),
            cold: Mutex::new(CacheTier::new(policy(
                TierKind::Cold,
                config.cold_budget_bytes,
                config.cold_admission_floor,
            ))),
            store,
            config,
            inflight: Arc::new(InFlightMap::new()),
            events,
            counters: Counters::default(),
        }
    }

    /// Look up `key`, promoting lower-tier hits
    pub async fn get(&self, key: &CacheKey) -> Option<CacheHit> {
        let hit = self.lookup_tiers(key).await;
        if hit.is_none() {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %key, "Cache miss");
        }
        hit
    }

    async fn lookup_tiers(&self, key: &CacheKey) -> Option<CacheHit> {
        let now = Instant::now();

        let hot = self.hot.lock().lookup(key, now);
        match hot {
            TierLookup::Hit(payload, meta) => return Some(self.hit(TierKind::Hot, payload, &meta)),
            TierLookup::Expired(e) => self.report(TierKind::Hot, vec![e], EvictionReason::Expired),
            TierLookup::Miss => {}
        }

        let warm = self.warm.lock().lookup(key, now);
        match warm {
            TierLookup::Hit(stored, meta) => match self.unpack(&stored, meta.compressed) {
                Ok(payload) => {
                    self.promote_to_hot(key, &payload, &meta, now);
                    return Some(self.hit(TierKind::Warm, payload, &meta));
                }
                Err(e) => {
                    self.recovered(key, &e);
                    let removed = self.warm.lock().remove(key);
                    self.report(TierKind::Warm, removed.into_iter().collect(), EvictionReason::Corrupt);
                }
            },
            TierLookup::Expired(e) => self.report(TierKind::Warm, vec![e], EvictionReason::Expired),
            TierLookup::Miss => {}
        }

        if let Some((payload, meta)) = self.read_cold(key, now).await {
            let mut warm_meta = meta.clone();
            warm_meta.compressed = false;
            self.write_warm(key, &payload, warm_meta, now);
            self.promote_to_hot(key, &payload, &meta, now);
            return Some(self.hit(TierKind::Cold, payload, &meta));
        }
        None
    }

    /// Look up `key`; on a miss, join or start the in-flight call for it
    pub async fn get_or_await(&self, key: &CacheKey) -> Lookup<O> {
        if let Some(hit) = self.get(key).await {
            return Lookup::Hit(hit);
        }
        match self.inflight.claim(key) {
            Claim::Follower(waiter) => Lookup::Follower(waiter),
            Claim::Leader(leader) => {
                // A previous leader may have filled any tier between our miss and claim
                if let Some(hit) = self.lookup_tiers(key).await {
                    leader.release();
                    return Lookup::Hit(hit);
                }
                Lookup::Leader(leader)
            }
        }
    }

    /// Store `payload` in every tier that admits it
    pub async fn set(&self, key: &CacheKey, payload: &[u8], cost: f64, quality: f64) {
        let now = Instant::now();
        let ttl = entry::ttl_for_cost(cost, &self.config);
        let meta = EntryMeta::new(cost, quality, ttl, payload.len() as u64, now);

        self.write_cold(key, payload, &meta, ttl, now).await;
        self.write_warm(key, payload, meta.clone(), now);
        self.write_hot(key, payload, meta, now);
    }

    /// Evict at least `amount` bytes from `tier` (or empty it); returns bytes freed
    pub async fn evict(&self, tier: TierKind, amount: u64) -> u64 {
        let now = Instant::now();
        let evicted = match tier {
            TierKind::Hot => self.hot.lock().evict(amount, now),
            TierKind::Warm => self.warm.lock().evict(amount, now),
            TierKind::Cold => self.cold.lock().evict(amount, now),
        };
        self.finish_eviction(tier, evicted, EvictionReason::Pressure).await
    }

    /// Remove expired entries from every tier; returns entries removed
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for tier in TierKind::ALL {
            let evicted = match tier {
                TierKind::Hot => self.hot.lock().evict_expired(now),
                TierKind::Warm => self.warm.lock().evict_expired(now),
                TierKind::Cold => self.cold.lock().evict_expired(now),
            };
            removed += evicted.len();
            self.finish_eviction(tier, evicted, EvictionReason::Expired).await;
        }
        if removed > 0 {
            tracing::debug!(removed, "TTL sweep removed expired entries");
        }
        removed
    }

    /// Bytes held by `tier`
    #[must_use]
    pub fn tier_bytes(&self, tier: TierKind) -> u64 {
        match tier {
            TierKind::Hot => self.hot.lock().used_bytes(),
            TierKind::Warm => self.warm.lock().used_bytes(),
            TierKind::Cold => self.cold.lock().used_bytes(),
        }
    }

    /// Whether `tier` holds `key`
    #[must_use]
    pub fn tier_contains(&self, tier: TierKind, key: &CacheKey) -> bool {
        match tier {
            TierKind::Hot => self.hot.lock().contains(key),
            TierKind::Warm => self.warm.lock().contains(key),
            TierKind::Cold => self.cold.lock().contains(key),
        }
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let tiers = TierKind::ALL
            .into_iter()
            .map(|tier| {
                let (entries, used_bytes, budget_bytes) = match tier {
                    TierKind::Hot => Self::usage(&self.hot.lock()),
                    TierKind::Warm => Self::usage(&self.warm.lock()),
                    TierKind::Cold => Self::usage(&self.cold.lock()),
                };
                TierStats {
                    tier,
                    entries,
                    used_bytes,
                    budget_bytes,
                    hits: self.counters.hits[tier_index(tier)].load(Ordering::Relaxed),
                }
            })
            .collect();
        CacheStats {
            tiers,
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            in_flight: self.inflight.len(),
        }
    }

    fn usage<P: Clone>(tier: &CacheTier<P>) -> (usize, u64, u64) {
        (tier.len(), tier.used_bytes(), tier.policy().budget_bytes)
    }

    // ------------------------------------------------------------------------
    // Tier writes
    // ------------------------------------------------------------------------

    fn write_hot(&self, key: &CacheKey, payload: &[u8], mut meta: EntryMeta, now: Instant) {
        meta.compressed = false;
        meta.size_bytes = payload.len() as u64;
        let outcome = {
            let mut hot = self.hot.lock();
            if !hot.admits(&meta, now) {
                return;
            }
            hot.insert(key.clone(), payload.to_vec(), meta, now)
        };
        if let InsertOutcome::Inserted { evicted } = outcome {
            self.report(TierKind::Hot, evicted, EvictionReason::Capacity);
        }
    }

    fn write_warm(&self, key: &CacheKey, payload: &[u8], mut meta: EntryMeta, now: Instant) {
        if !self.warm.lock().admits(&meta, now) {
            return;
        }
        let stored = match self.pack(payload) {
            Ok(packed) => packed,
            Err(e) => {
                self.recovered(key, &e);
                return;
            }
        };
        meta.compressed = stored.1;
        meta.size_bytes = stored.0.len() as u64;
        let outcome = self.warm.lock().insert(key.clone(), stored.0, meta, now);
        if let InsertOutcome::Inserted { evicted } = outcome {
            self.report(TierKind::Warm, evicted, EvictionReason::Capacity);
        }
    }

    async fn write_cold(&self, key: &CacheKey, payload: &[u8], meta: &EntryMeta, ttl: Duration, now: Instant) {
        if !self.cold.lock().admits(meta, now) {
            return;
        }
        let framed = self.pack(payload).and_then(|(stored, compressed)| {
            let cold_meta = ColdMeta::new(meta.original_cost, meta.quality, meta.hit_count, ttl, compressed);
            envelope::encode(&cold_meta, &stored).map(|bytes| (bytes, compressed))
        });
        let (bytes, compressed) = match framed {
            Ok(framed) => framed,
            Err(e) => {
                self.recovered(key, &e);
                return;
            }
        };

        if let Err(e) = self.store.write(key.as_str(), &bytes, ttl).await {
            self.recovered(key, &CacheError::Store(e.to_string()));
            return;
        }

        let mut index_meta = meta.clone();
        index_meta.compressed = compressed;
        index_meta.size_bytes = bytes.len() as u64;
        let outcome = self.cold.lock().insert(key.clone(), (), index_meta, now);
        match outcome {
            InsertOutcome::Inserted { evicted } => {
                self.finish_eviction(TierKind::Cold, evicted, EvictionReason::Capacity)
                    .await;
            }
            InsertOutcome::TooLarge => {
                let _ = self.store.delete(key.as_str()).await;
            }
        }
    }

    fn promote_to_hot(&self, key: &CacheKey, payload: &[u8], meta: &EntryMeta, now: Instant) {
        self.write_hot(key, payload, meta.clone(), now);
    }

    // ------------------------------------------------------------------------
    // Cold reads
    // ------------------------------------------------------------------------

    async fn read_cold(&self, key: &CacheKey, now: Instant) -> Option<(Vec<u8>, EntryMeta)> {
        let seen = self.cold.lock().generation(key);
        let bytes = match self.store.read(key.as_str()).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.forget_cold(key, seen, false, EvictionReason::Expired).await;
                return None;
            }
            Err(e) => {
                self.recovered(key, &CacheError::Store(e.to_string()));
                return None;
            }
        };

        let decoded = envelope::decode(&bytes).and_then(|(meta, stored)| {
            let payload = self.unpack(&stored, meta.compressed)?;
            Ok((meta, payload))
        });
        let (cold_meta, payload) = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                self.recovered(key, &e);
                self.forget_cold(key, seen, true, EvictionReason::Corrupt).await;
                return None;
            }
        };
        if cold_meta.is_expired() {
            self.forget_cold(key, seen, true, EvictionReason::Expired).await;
            return None;
        }

        let (meta, displaced) = {
            let mut cold = self.cold.lock();
            match cold.lookup(key, now) {
                TierLookup::Hit((), meta) => (meta, Vec::new()),
                _ => {
                    // Written by an earlier process: rebuild the index entry
                    let created_at = now.checked_sub(cold_meta.age()).unwrap_or(now);
                    let mut meta = EntryMeta::new(
                        cold_meta.original_cost,
                        cold_meta.quality,
                        cold_meta.remaining_ttl(),
                        bytes.len() as u64,
                        now,
                    );
                    meta.created_at = created_at;
                    meta.hit_count = cold_meta.hit_count;
                    meta.compressed = cold_meta.compressed;
                    meta.touch(now);
                    let displaced = match cold.insert(key.clone(), (), meta.clone(), now) {
                        InsertOutcome::Inserted { evicted } => evicted,
                        InsertOutcome::TooLarge => Vec::new(),
                    };
                    (meta, displaced)
                }
            }
        };
        self.finish_eviction(TierKind::Cold, displaced, EvictionReason::Capacity)
            .await;
        Some((payload, meta))
    }

    /// Drop a Cold entry found missing or unreadable, unless it was rewritten meanwhile
    async fn forget_cold(&self, key: &CacheKey, seen: Option<u64>, delete_stored: bool, reason: EvictionReason) {
        let removed = {
            let mut cold = self.cold.lock();
            match (cold.generation(key), seen) {
                (Some(current), Some(seen)) if current == seen => cold.remove_if_generation(key, seen),
                (None, _) => None,
                // A concurrent write owns the key now
                _ => return,
            }
        };
        if delete_stored {
            let _ = self.store.delete(key.as_str()).await;
        }
        self.report(TierKind::Cold, removed.into_iter().collect(), reason);
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn pack(&self, payload: &[u8]) -> Result<(Vec<u8>, bool), CacheError> {
        if payload.len() >= self.config.compression_threshold_bytes {
            let packed = entry::compress(payload)?;
            if packed.len() < payload.len() {
                return Ok((packed, true));
            }
        }
        Ok((payload.to_vec(), false))
    }

    fn unpack(&self, stored: &[u8], compressed: bool) -> Result<Vec<u8>, CacheError> {
        if compressed {
            entry::decompress(stored)
        } else {
            Ok(stored.to_vec())
        }
    }

    fn hit(&self, tier: TierKind, payload: Vec<u8>, meta: &EntryMeta) -> CacheHit {
        self.counters.hits[tier_index(tier)].fetch_add(1, Ordering::Relaxed);
        tracing::debug!(tier = %tier, hits = meta.hit_count, "Cache hit");
        CacheHit {
            payload,
            tier,
            hit_count: meta.hit_count,
            original_cost: meta.original_cost,
        }
    }

    fn recovered(&self, key: &CacheKey, error: &CacheError) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(key = %key, error = %error, "Cache error treated as miss");
    }

    async fn finish_eviction(&self, tier: TierKind, evicted: Vec<Evicted>, reason: EvictionReason) -> u64 {
        let freed = evicted.iter().map(|e| e.size_bytes).sum();
        if tier == TierKind::Cold {
            for e in &evicted {
                if let Err(err) = self.store.delete(e.key.as_str()).await {
                    tracing::warn!(key = %e.key, error = %err, "Failed to delete evicted Cold entry");
                }
            }
        }
        self.report(tier, evicted, reason);
        freed
    }

    fn report(&self, tier: TierKind, evicted: Vec<Evicted>, reason: EvictionReason) {
        if evicted.is_empty() {
            return;
        }
        let bytes = evicted.iter().map(|e| e.size_bytes).sum();
        self.counters
            .evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        self.events.emit(RouterEvent::CacheEvicted {
            tier,
            entries: evicted.len(),
            bytes,
            reason,
        });
    }
}

#[async_trait]
impl<O: Clone + Send + Sync + 'static> CachePressureTarget for MultiTierCache<O> {
    fn resident_bytes(&self) -> u64 {
        self.tier_bytes(TierKind::Hot) + self.tier_bytes(TierKind::Warm)
    }

    async fn evict_fraction(&self, tiers: &[TierKind], fraction: f64) -> u64 {
        let mut freed = 0;
        for &tier in tiers {
            let used = self.tier_bytes(tier);
            let amount = (used as f64 * fraction).ceil() as u64;
            if amount > 0 {
                freed += self.evict(tier, amount).await;
            }
        }
        freed
    }

    async fn clear_all(&self) -> u64 {
        let mut freed = 0;
        for tier in TierKind::ALL {
            let evicted = match tier {
                TierKind::Hot => self.hot.lock().clear(),
                TierKind::Warm => self.warm.lock().clear(),
                TierKind::Cold => self.cold.lock().clear(),
            };
            freed += self
                .finish_eviction(tier, evicted, EvictionReason::Pressure)
                .await;
        }
        freed
    }
}

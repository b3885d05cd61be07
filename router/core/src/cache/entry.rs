//! Entry metadata and scoring
//!
//! Three numbers drive the cache:
//!
//! - **TTL** grows linearly with the cost of the response it saves, capped
//!   at `ttl_max_secs`.
//! - **Priority score** decides tier admission. It blends cost, quality,
//!   recency and reuse, so a cheap answer only climbs to Hot once it has
//!   been reused a few times.
//! - **Effectiveness** ranks eviction victims:
//!   `cumulative_savings / (original_cost + age_hours * age_weight)`.

use std::io::{Read, Write};
use std::time::Duration;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::time::Instant;

use super::CacheError;
use crate::config::CacheConfig;

/// Seconds of TTL granted per unit of cost
const TTL_SECONDS_PER_COST_UNIT: f64 = 360_000.0;

/// Cost at which the cost term of the priority score reaches 0.5
const COST_MIDPOINT: f64 = 0.01;

/// Idle hours after which the recency term halves
const RECENCY_HALF_LIFE_HOURS: f64 = 1.0;

const COST_WEIGHT: f64 = 0.6;
const QUALITY_WEIGHT: f64 = 0.1;
const RECENCY_WEIGHT: f64 = 0.1;
const REUSE_WEIGHT: f64 = 0.2;

/// Metadata kept for every cached entry
#[derive(Clone, Debug, PartialEq)]
pub struct EntryMeta {
    /// Cost of the backend call the entry saves
    pub original_cost: f64,
    /// Quality score of the model that produced it
    pub quality: f64,
    /// When the response was produced
    pub created_at: Instant,
    /// When the entry stops being served
    pub expires_at: Instant,
    /// Last read or write
    pub last_accessed: Instant,
    /// Times the entry has been served
    pub hit_count: u64,
    /// Bytes the entry occupies in its tier
    pub size_bytes: u64,
    /// Whether the stored payload is gzip-compressed
    pub compressed: bool,
}

impl EntryMeta {
    /// Fresh metadata for a response of `size_bytes`
    #[must_use]
    pub fn new(original_cost: f64, quality: f64, ttl: Duration, size_bytes: u64, now: Instant) -> Self {
        Self {
            original_cost,
            quality,
            created_at: now,
            expires_at: now + ttl,
            last_accessed: now,
            hit_count: 0,
            size_bytes,
            compressed: false,
        }
    }

    /// Whether the TTL has run out
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// TTL left
    #[must_use]
    pub fn remaining_ttl(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }

    /// Age in hours
    #[must_use]
    pub fn age_hours(&self, now: Instant) -> f64 {
        now.saturating_duration_since(self.created_at).as_secs_f64() / 3600.0
    }

    /// Cost saved by every hit so far
    #[must_use]
    pub fn cumulative_savings(&self) -> f64 {
        self.hit_count as f64 * self.original_cost
    }

    /// Eviction rank; lower goes first
    #[must_use]
    pub fn effectiveness(&self, now: Instant, age_weight: f64) -> f64 {
        let denominator = self.original_cost + self.age_hours(now) * age_weight;
        if denominator <= 0.0 {
            return 0.0;
        }
        self.cumulative_savings() / denominator
    }

    /// Admission score in [0, 1]
    #[must_use]
    pub fn priority_score(&self, now: Instant) -> f64 {
        let cost = self.original_cost.max(0.0);
        let cost_term = cost / (cost + COST_MIDPOINT);
        let idle_hours = now.saturating_duration_since(self.last_accessed).as_secs_f64() / 3600.0;
        let recency_term = 0.5_f64.powf(idle_hours / RECENCY_HALF_LIFE_HOURS);
        let reuse_term = 1.0 - 1.0 / (1.0 + self.hit_count as f64);

        COST_WEIGHT * cost_term
            + QUALITY_WEIGHT * self.quality.clamp(0.0, 1.0)
            + RECENCY_WEIGHT * recency_term
            + REUSE_WEIGHT * reuse_term
    }

    /// Record a hit
    pub fn touch(&mut self, now: Instant) {
        self.last_accessed = now;
        self.hit_count = self.hit_count.saturating_add(1);
    }
}

/// TTL for a response that cost `cost`
#[must_use]
pub fn ttl_for_cost(cost: f64, config: &CacheConfig) -> Duration {
    let secs = config.ttl_base_secs as f64 + cost.max(0.0) * TTL_SECONDS_PER_COST_UNIT;
    Duration::from_secs_f64(secs.min(config.ttl_max_secs as f64))
}

/// Gzip `data`
pub fn compress(data: &[u8]) -> Result<Vec<u8>, CacheError> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| CacheError::SerializationFailed(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| CacheError::SerializationFailed(e.to_string()))
}

/// Reverse [`compress`]
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CacheError> {
    let mut out = Vec::with_capacity(data.len() * 2);
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| CacheError::Corrupt(e.to_string()))?;
    Ok(out)
}

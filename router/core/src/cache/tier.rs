//! A single cache tier
//!
//! Entries live in a flat arena of slots indexed by integer id. A hash index
//! maps keys to slot ids, and recency is an intrusive doubly-linked list of
//! slot ids (`prev`/`next` are indices, never references). Freed slots are
//! recycled through a free list.
//!
//! The tier is a plain data structure; callers wrap it in a lock.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::entry::EntryMeta;
use super::key::CacheKey;

/// Cache tier identity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    /// In-memory, uncompressed, strictest admission
    Hot,
    /// In-memory, large payloads compressed
    Warm,
    /// Persistent store, metadata indexed in memory
    Cold,
}

impl TierKind {
    /// Every tier, fastest first
    pub const ALL: [Self; 3] = [Self::Hot, Self::Warm, Self::Cold];
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hot => write!(f, "hot"),
            Self::Warm => write!(f, "warm"),
            Self::Cold => write!(f, "cold"),
        }
    }
}

/// Limits for one tier
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TierPolicy {
    /// Tier identity
    pub kind: TierKind,
    /// Byte budget
    pub budget_bytes: u64,
    /// Minimum priority score for admission
    pub admission_floor: f64,
    /// Age weight in the effectiveness formula
    pub age_weight: f64,
}

/// An entry removed from the tier
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Evicted {
    /// Removed key
    pub key: CacheKey,
    /// Bytes released
    pub size_bytes: u64,
}

/// Result of a lookup
#[derive(Clone, Debug, PartialEq)]
pub enum TierLookup<P> {
    /// Live entry; metadata reflects this hit
    Hit(P, EntryMeta),
    /// Entry was present but expired and has been removed
    Expired(Evicted),
    /// No entry
    Miss,
}

/// Result of an insert
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Stored; `evicted` were removed to make room
    Inserted {
        /// Entries displaced
        evicted: Vec<Evicted>,
    },
    /// Entry alone exceeds the budget
    TooLarge,
}

#[derive(Debug)]
struct Slot<P> {
    key: CacheKey,
    payload: P,
    meta: EntryMeta,
    generation: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Bounded key to entry store with effectiveness-based eviction
#[derive(Debug)]
pub struct CacheTier<P> {
    policy: TierPolicy,
    slots: Vec<Option<Slot<P>>>,
    free: Vec<usize>,
    index: HashMap<CacheKey, usize>,
    /// Most recently used
    head: Option<usize>,
    /// Least recently used
    tail: Option<usize>,
    used_bytes: u64,
    next_generation: u64,
}

impl<P: Clone> CacheTier<P> {
    /// Create an empty tier
    #[must_use]
    pub fn new(policy: TierPolicy) -> Self {
        Self {
            policy,
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
            used_bytes: 0,
            next_generation: 0,
        }
    }

    /// Tier limits
    #[must_use]
    pub fn policy(&self) -> &TierPolicy {
        &self.policy
    }

    /// Bytes held
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the tier is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Whether `key` is present (expired or not)
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.index.contains_key(key)
    }

    /// Metadata for `key` without touching it
    #[must_use]
    pub fn peek(&self, key: &CacheKey) -> Option<&EntryMeta> {
        let id = *self.index.get(key)?;
        self.slot(id).map(|s| &s.meta)
    }

    /// Insert generation of `key`; changes whenever the key is written again
    #[must_use]
    pub fn generation(&self, key: &CacheKey) -> Option<u64> {
        let id = *self.index.get(key)?;
        self.slot(id).map(|s| s.generation)
    }

    /// Whether an entry with `meta` clears this tier's admission floor
    #[must_use]
    pub fn admits(&self, meta: &EntryMeta, now: Instant) -> bool {
        meta.priority_score(now) >= self.policy.admission_floor
    }

    /// Look up `key`, recording a hit and refreshing recency
    pub fn lookup(&mut self, key: &CacheKey, now: Instant) -> TierLookup<P> {
        let Some(&id) = self.index.get(key) else {
            return TierLookup::Miss;
        };
        let expired = self.slot(id).is_some_and(|s| s.meta.is_expired(now));
        if expired {
            return match self.remove_slot(id) {
                Some(evicted) => TierLookup::Expired(evicted),
                None => TierLookup::Miss,
            };
        }

        self.move_to_front(id);
        match self.slots.get_mut(id).and_then(Option::as_mut) {
            Some(slot) => {
                slot.meta.touch(now);
                TierLookup::Hit(slot.payload.clone(), slot.meta.clone())
            }
            None => TierLookup::Miss,
        }
    }

    /// Insert or replace `key`, evicting the least effective entries if needed
    pub fn insert(&mut self, key: CacheKey, payload: P, meta: EntryMeta, now: Instant) -> InsertOutcome {
        if meta.size_bytes > self.policy.budget_bytes {
            return InsertOutcome::TooLarge;
        }

        if let Some(&id) = self.index.get(&key) {
            // Replacement, not eviction
            self.remove_slot(id);
        }
        let overflow = (self.used_bytes + meta.size_bytes).saturating_sub(self.policy.budget_bytes);
        let evicted = self.evict(overflow, now);

        self.used_bytes += meta.size_bytes;
        self.next_generation += 1;
        let slot = Slot {
            key: key.clone(),
            payload,
            meta,
            generation: self.next_generation,
            prev: None,
            next: None,
        };
        let id = match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(slot);
                id
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, id);
        self.link_front(id);

        InsertOutcome::Inserted { evicted }
    }

    /// Remove `key`
    pub fn remove(&mut self, key: &CacheKey) -> Option<Evicted> {
        let id = *self.index.get(key)?;
        self.remove_slot(id)
    }

    /// Remove `key` only if it still holds the entry written at `generation`
    pub fn remove_if_generation(&mut self, key: &CacheKey, generation: u64) -> Option<Evicted> {
        let id = *self.index.get(key)?;
        if self.slot(id)?.generation != generation {
            return None;
        }
        self.remove_slot(id)
    }

    /// Evict lowest-effectiveness entries until `amount` bytes are freed or the tier is empty
    pub fn evict(&mut self, amount: u64, now: Instant) -> Vec<Evicted> {
        if amount == 0 {
            return Vec::new();
        }
        let mut freed = 0;
        let mut evicted = Vec::new();
        for id in self.victims(now) {
            if freed >= amount {
                break;
            }
            if let Some(e) = self.remove_slot(id) {
                freed += e.size_bytes;
                evicted.push(e);
            }
        }
        evicted
    }

    /// Remove every expired entry
    pub fn evict_expired(&mut self, now: Instant) -> Vec<Evicted> {
        let expired: Vec<usize> = self
            .index
            .values()
            .copied()
            .filter(|&id| self.slot(id).is_some_and(|s| s.meta.is_expired(now)))
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.remove_slot(id))
            .collect()
    }

    /// Remove everything
    pub fn clear(&mut self) -> Vec<Evicted> {
        let evicted = self
            .slots
            .iter()
            .flatten()
            .map(|s| Evicted {
                key: s.key.clone(),
                size_bytes: s.meta.size_bytes,
            })
            .collect();
        self.slots.clear();
        self.free.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
        self.used_bytes = 0;
        evicted
    }

    /// Keys from most to least recently used
    #[must_use]
    pub fn keys_by_recency(&self) -> Vec<CacheKey> {
        let mut keys = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let Some(slot) = self.slot(id) else { break };
            keys.push(slot.key.clone());
            cursor = slot.next;
        }
        keys
    }

    /// Every entry in eviction order: lowest effectiveness, then lowest priority, then least recent
    fn victims(&self, now: Instant) -> Vec<usize> {
        let mut ranked = Vec::with_capacity(self.len());
        let mut cursor = self.tail;
        while let Some(id) = cursor {
            let Some(slot) = self.slot(id) else { break };
            ranked.push((
                id,
                slot.meta.effectiveness(now, self.policy.age_weight),
                slot.meta.priority_score(now),
            ));
            cursor = slot.prev;
        }
        // Stable: equal scores stay least recent first
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.2.total_cmp(&b.2)));
        ranked.into_iter().map(|(id, _, _)| id).collect()
    }

    fn slot(&self, id: usize) -> Option<&Slot<P>> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    fn remove_slot(&mut self, id: usize) -> Option<Evicted> {
        self.unlink(id);
        let slot = self.slots.get_mut(id)?.take()?;
        self.index.remove(&slot.key);
        self.free.push(id);
        self.used_bytes = self.used_bytes.saturating_sub(slot.meta.size_bytes);
        Some(Evicted {
            key: slot.key,
            size_bytes: slot.meta.size_bytes,
        })
    }

    fn move_to_front(&mut self, id: usize) {
        if self.head == Some(id) {
            return;
        }
        self.unlink(id);
        self.link_front(id);
    }

    fn link_front(&mut self, id: usize) {
        let old_head = self.head;
        if let Some(slot) = self.slots.get_mut(id).and_then(Option::as_mut) {
            slot.prev = None;
            slot.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(head) = self.slots.get_mut(h).and_then(Option::as_mut) {
                head.prev = Some(id);
            }
        }
        self.head = Some(id);
        if self.tail.is_none() {
            self.tail = Some(id);
        }
    }

    fn unlink(&mut self, id: usize) {
        let Some((prev, next)) = self.slot(id).map(|s| (s.prev, s.next)) else {
            return;
        };
        match prev {
            Some(p) => {
                if let Some(slot) = self.slots.get_mut(p).and_then(Option::as_mut) {
                    slot.next = next;
                }
            }
            None => {
                if self.head == Some(id) {
                    self.head = next;
                }
            }
        }
        match next {
            Some(n) => {
                if let Some(slot) = self.slots.get_mut(n).and_then(Option::as_mut) {
                    slot.prev = prev;
                }
            }
            None => {
                if self.tail == Some(id) {
                    self.tail = prev;
                }
            }
        }
        if let Some(slot) = self.slots.get_mut(id).and_then(Option::as_mut) {
            slot.prev = None;
            slot.next = None;
        }
    }
}

//! Size-class Block Pool
//!
//! Requests are rounded up to the smallest size class that fits and served
//! from that class's free list before fresh memory is allocated. Each class
//! bounds the number of blocks it hands out; a full class spills into the
//! next larger one. Requests above the largest class get an exact-size block
//! that is never pooled.
//!
//! Freed blocks stay on their free list (up to the class bound) and are
//! reported as retained bytes until [`ResourcePool::release_retained`] drops
//! them.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

/// One block size served by the pool
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SizeClass {
    /// Position in the pool's class list
    pub index: usize,
    /// Bytes per block
    pub block_bytes: u64,
}

/// A block handed out by the pool
#[derive(Debug)]
pub struct Block {
    class: Option<usize>,
    data: Vec<u8>,
    dirty: bool,
}

impl Block {
    /// Bytes backing the block
    #[must_use]
    pub fn capacity_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    /// Class the block belongs to; `None` for oversize blocks
    #[must_use]
    pub fn class(&self) -> Option<usize> {
        self.class
    }

    /// Block contents
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Mutable block contents
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.dirty = true;
        &mut self.data
    }
}

struct ClassPool {
    class: SizeClass,
    free: Mutex<Vec<Block>>,
    live: AtomicUsize,
}

/// Usage of one size class
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClassStats {
    /// The class
    pub class: SizeClass,
    /// Blocks handed out
    pub live_blocks: usize,
    /// Blocks waiting for reuse
    pub free_blocks: usize,
}

/// Pool-wide counters
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PoolStats {
    /// Per-class usage, smallest first
    pub classes: Vec<ClassStats>,
    /// Bytes parked on free lists
    pub retained_bytes: u64,
    /// Requests served from a free list
    pub reused: u64,
    /// Requests that allocated fresh memory
    pub fresh: u64,
}

/// Fixed size-class block allocator with reuse
pub struct ResourcePool {
    classes: Vec<ClassPool>,
    max_blocks_per_class: usize,
    retained: AtomicU64,
    reused: AtomicU64,
    fresh: AtomicU64,
}

impl ResourcePool {
    /// Create a pool; `size_classes` must be ascending
    #[must_use]
    pub fn new(size_classes: &[u64], max_blocks_per_class: usize) -> Self {
        let classes = size_classes
            .iter()
            .enumerate()
            .map(|(index, &block_bytes)| ClassPool {
                class: SizeClass { index, block_bytes },
                free: Mutex::new(Vec::new()),
                live: AtomicUsize::new(0),
            })
            .collect();
        Self {
            classes,
            max_blocks_per_class,
            retained: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            fresh: AtomicU64::new(0),
        }
    }

    /// Smallest class that fits `size`
    #[must_use]
    pub fn class_for(&self, size: u64) -> Option<SizeClass> {
        self.classes
            .iter()
            .map(|c| c.class)
            .find(|c| c.block_bytes >= size)
    }

    /// Bytes parked on free lists
    #[must_use]
    pub fn retained_bytes(&self) -> u64 {
        self.retained.load(Ordering::Acquire)
    }

    /// Get a block of at least `size` bytes
    ///
    /// Returns `None` when every class that fits is at its block limit.
    pub fn acquire(&self, size: u64) -> Option<Block> {
        let first = self.classes.iter().position(|c| c.class.block_bytes >= size);
        let Some(first) = first else {
            self.fresh.fetch_add(1, Ordering::Relaxed);
            return Some(Block {
                class: None,
                data: vec![0; usize::try_from(size).ok()?],
                dirty: false,
            });
        };

        for pool in &self.classes[first..] {
            if let Some(block) = self.take_from(pool) {
                return Some(block);
            }
        }
        None
    }

    fn take_from(&self, pool: &ClassPool) -> Option<Block> {
        let limit = self.max_blocks_per_class;
        let reserved = pool
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < limit).then_some(live + 1)
            });
        if reserved.is_err() {
            return None;
        }

        let recycled = pool.free.lock().pop();
        match recycled {
            Some(mut block) => {
                self.retained
                    .fetch_sub(pool.class.block_bytes, Ordering::AcqRel);
                self.reused.fetch_add(1, Ordering::Relaxed);
                if block.dirty {
                    block.data.fill(0);
                    block.dirty = false;
                }
                Some(block)
            }
            None => {
                let Ok(len) = usize::try_from(pool.class.block_bytes) else {
                    pool.live.fetch_sub(1, Ordering::AcqRel);
                    return None;
                };
                self.fresh.fetch_add(1, Ordering::Relaxed);
                Some(Block {
                    class: Some(pool.class.index),
                    data: vec![0; len],
                    dirty: false,
                })
            }
        }
    }

    /// Return a block for reuse
    pub fn release(&self, block: Block) {
        let Some(pool) = block.class.and_then(|i| self.classes.get(i)) else {
            return;
        };
        pool.live.fetch_sub(1, Ordering::AcqRel);

        let mut free = pool.free.lock();
        if free.len() + pool.live.load(Ordering::Acquire) < self.max_blocks_per_class {
            free.push(block);
            self.retained
                .fetch_add(pool.class.block_bytes, Ordering::AcqRel);
        }
    }

    /// Give up a block without parking it for reuse
    pub fn discard(&self, block: Block) {
        if let Some(pool) = block.class.and_then(|i| self.classes.get(i)) {
            pool.live.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Drop every parked block; returns bytes released
    pub fn release_retained(&self) -> u64 {
        let mut released = 0;
        for pool in &self.classes {
            let drained = std::mem::take(&mut *pool.free.lock());
            let bytes = drained.len() as u64 * pool.class.block_bytes;
            self.retained.fetch_sub(bytes, Ordering::AcqRel);
            released += bytes;
        }
        if released > 0 {
            tracing::debug!(bytes = released, "Released retained pool blocks");
        }
        released
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            classes: self
                .classes
                .iter()
                .map(|pool| ClassStats {
                    class: pool.class,
                    live_blocks: pool.live.load(Ordering::Acquire),
                    free_blocks: pool.free.lock().len(),
                })
                .collect(),
            retained_bytes: self.retained_bytes(),
            reused: self.reused.load(Ordering::Relaxed),
            fresh: self.fresh.load(Ordering::Relaxed),
        }
    }
}

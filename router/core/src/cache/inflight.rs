//! In-flight call deduplication
//!
//! The first caller to [`InFlightMap::claim`] a key becomes the leader and is
//! responsible for producing the outcome; later callers for the same key get
//! a waiter on the leader's result. The map entry is removed when the leader
//! completes, so callers arriving afterwards start fresh (and normally hit
//! the cache the leader just filled).
//!
//! A waiter that is dropped simply detaches. If the leader is dropped without
//! completing, every waiter sees [`InFlightError::Abandoned`]. A leader that
//! finds the outcome already cached hands the key back with
//! [`InFlightLeader::release`], and its waiters see [`InFlightError::Released`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::watch;

use super::key::CacheKey;

/// Waiting on an in-flight call failed
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum InFlightError {
    /// The leader went away without publishing an outcome
    #[error("in-flight call abandoned before completing")]
    Abandoned,

    /// The leader found the outcome cached and made no call
    #[error("in-flight call released; outcome is cached")]
    Released,
}

#[derive(Debug)]
struct Flight<O> {
    tx: watch::Sender<Option<O>>,
    waiters: Arc<AtomicUsize>,
    released: Arc<AtomicBool>,
}

/// Outcome of claiming a key
#[derive(Debug)]
pub enum Claim<O> {
    /// Caller must perform the call and complete the leader
    Leader(InFlightLeader<O>),
    /// A call is already running; await it
    Follower(InFlightWaiter<O>),
}

/// Map of keys with a call in flight
#[derive(Debug)]
pub struct InFlightMap<O> {
    flights: DashMap<CacheKey, Arc<Flight<O>>>,
}

impl<O> Default for InFlightMap<O> {
    fn default() -> Self {
        Self {
            flights: DashMap::new(),
        }
    }
}

impl<O: Clone + Send + Sync + 'static> InFlightMap<O> {
    /// Create an empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Become the leader for `key`, or a follower of the current leader
    pub fn claim(self: &Arc<Self>, key: &CacheKey) -> Claim<O> {
        match self.flights.entry(key.clone()) {
            Entry::Occupied(occupied) => Claim::Follower(InFlightWaiter::attach(occupied.get())),
            Entry::Vacant(vacant) => {
                let (tx, _) = watch::channel(None);
                let flight = Arc::new(Flight {
                    tx,
                    waiters: Arc::new(AtomicUsize::new(0)),
                    released: Arc::new(AtomicBool::new(false)),
                });
                vacant.insert(Arc::clone(&flight));
                Claim::Leader(InFlightLeader {
                    map: Arc::clone(self),
                    key: key.clone(),
                    flight,
                    completed: false,
                })
            }
        }
    }

    /// Number of keys with a call in flight
    #[must_use]
    pub fn len(&self) -> usize {
        self.flights.len()
    }

    /// Whether nothing is in flight
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flights.is_empty()
    }

    /// Whether `key` has a call in flight
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.flights.contains_key(key)
    }
}

impl<O> InFlightMap<O> {
    fn finish(&self, key: &CacheKey, flight: &Arc<Flight<O>>) {
        self.flights
            .remove_if(key, |_, current| Arc::ptr_eq(current, flight));
    }
}

/// Token held by the caller performing the shared call
#[derive(Debug)]
pub struct InFlightLeader<O> {
    map: Arc<InFlightMap<O>>,
    key: CacheKey,
    flight: Arc<Flight<O>>,
    completed: bool,
}

impl<O: Clone + Send + Sync + 'static> InFlightLeader<O> {
    /// Key this call is for
    #[must_use]
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Attach a waiter to this call
    #[must_use]
    pub fn subscribe(&self) -> InFlightWaiter<O> {
        InFlightWaiter::attach(&self.flight)
    }

    /// Waiters currently attached
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.flight.waiters.load(Ordering::Acquire)
    }

    /// Publish the outcome to every waiter and clear the token
    ///
    /// Returns the number of waiters the outcome was delivered to.
    pub fn complete(mut self, outcome: O) -> usize {
        self.completed = true;
        self.map.finish(&self.key, &self.flight);
        self.flight.tx.send_replace(Some(outcome));
        self.waiter_count()
    }

    /// Give the key up without an outcome because it is already cached
    ///
    /// Waiters see [`InFlightError::Released`] and should look the key up again.
    pub fn release(self) {
        self.flight.released.store(true, Ordering::Release);
    }
}

impl<O> Drop for InFlightLeader<O> {
    fn drop(&mut self) {
        if !self.completed {
            // Waiters observe the closed channel
            self.map.finish(&self.key, &self.flight);
        }
    }
}

/// Handle awaiting a shared call
#[derive(Debug)]
pub struct InFlightWaiter<O> {
    rx: watch::Receiver<Option<O>>,
    waiters: Arc<AtomicUsize>,
    released: Arc<AtomicBool>,
}

impl<O: Clone> InFlightWaiter<O> {
    fn attach(flight: &Flight<O>) -> Self {
        flight.waiters.fetch_add(1, Ordering::AcqRel);
        Self {
            rx: flight.tx.subscribe(),
            waiters: Arc::clone(&flight.waiters),
            released: Arc::clone(&flight.released),
        }
    }

    /// Wait for the leader's outcome
    pub async fn wait(mut self) -> Result<O, InFlightError> {
        loop {
            if let Some(outcome) = self.rx.borrow_and_update().clone() {
                return Ok(outcome);
            }
            if self.rx.changed().await.is_err() {
                if let Some(outcome) = self.rx.borrow().clone() {
                    return Ok(outcome);
                }
                if self.released.load(Ordering::Acquire) {
                    return Err(InFlightError::Released);
                }
                return Err(InFlightError::Abandoned);
            }
        }
    }
}

impl<O> Drop for InFlightWaiter<O> {
    fn drop(&mut self) {
        self.waiters.fetch_sub(1, Ordering::AcqRel);
    }
}

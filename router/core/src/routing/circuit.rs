//! Per-model Circuit Breakers
//!
//! ```text
//! +--------+  failure_threshold   +------+   open_timeout elapsed   +----------+
//! | Closed | -------------------> | Open | -----------------------> | HalfOpen |
//! +--------+     failures         +------+                          +----------+
//!     ^                               ^                                  |
//!     |                               |          any failure             |
//!     |                               +----------------------------------+
//!     |              success_threshold successes                         |
//!     +------------------------------------------------------------------+
//! ```
//!
//! - **Closed**: normal operation; consecutive failures are counted
//! - **Open**: model excluded from selection
//! - **HalfOpen**: model selectable again, on probation
//!
//! The Open to HalfOpen move is evaluated lazily whenever the state is read,
//! so an idle model recovers without a timer. Breakers never perform I/O;
//! only outcomes reported by the router move them.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use dashmap::DashMap;

use crate::config::CircuitConfig;
use crate::events::{EventBus, RouterEvent};

// ============================================================================
// Circuit State
// ============================================================================

/// Circuit breaker state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CircuitState {
    /// Circuit is closed (normal operation)
    #[default]
    Closed,

    /// Circuit is open (model excluded)
    Open,

    /// Circuit is half-open (testing recovery)
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// A state change produced by a breaker
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    /// State before
    pub from: CircuitState,
    /// State after
    pub to: CircuitState,
}

/// Raised internally when a model's circuit is open
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("circuit open for model {model_id}")]
pub struct CircuitOpenError {
    /// Model whose circuit is open
    pub model_id: String,
}

// ============================================================================
// Circuit Breaker
// ============================================================================

/// Health state machine for one model
#[derive(Clone, Debug, Default)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    total_successes: u64,
    total_failures: u64,
    times_opened: u64,
}

impl CircuitBreaker {
    /// Create a closed breaker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state at `now`, applying the Open to HalfOpen timeout
    pub fn state(&mut self, now: Instant, config: &CircuitConfig) -> (CircuitState, Option<Transition>) {
        let transition = self.refresh(now, config);
        (self.state, transition)
    }

    /// Record a successful call
    pub fn record_success(&mut self, now: Instant, config: &CircuitConfig) -> Option<Transition> {
        let timed = self.refresh(now, config);
        self.total_successes += 1;

        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
                timed
            }
            CircuitState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= config.success_threshold {
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    self.success_count = 0;
                    Some(Transition {
                        from: timed.map_or(CircuitState::HalfOpen, |t| t.from),
                        to: CircuitState::Closed,
                    })
                } else {
                    timed
                }
            }
            // Late outcome of a call started before the circuit opened
            CircuitState::Open => timed,
        }
    }

    /// Record a failed call
    pub fn record_failure(&mut self, now: Instant, config: &CircuitConfig) -> Option<Transition> {
        let timed = self.refresh(now, config);
        self.total_failures += 1;

        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                self.last_failure = Some(now);
                if self.failure_count >= config.failure_threshold {
                    self.open(now);
                    Some(Transition {
                        from: CircuitState::Closed,
                        to: CircuitState::Open,
                    })
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                self.open(now);
                Some(Transition {
                    from: timed.map_or(CircuitState::HalfOpen, |t| t.from),
                    to: CircuitState::Open,
                })
            }
            CircuitState::Open => None,
        }
    }

    /// Consecutive failures counted while closed
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Successes counted while half-open
    #[must_use]
    pub fn success_count(&self) -> u32 {
        self.success_count
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.last_failure = Some(now);
        self.success_count = 0;
        self.times_opened += 1;
    }

    fn refresh(&mut self, now: Instant, config: &CircuitConfig) -> Option<Transition> {
        if self.state != CircuitState::Open {
            return None;
        }
        let elapsed = self
            .last_failure
            .map_or(config.open_timeout(), |at| now.saturating_duration_since(at));
        if elapsed >= config.open_timeout() {
            self.state = CircuitState::HalfOpen;
            self.success_count = 0;
            Some(Transition {
                from: CircuitState::Open,
                to: CircuitState::HalfOpen,
            })
        } else {
            None
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Point-in-time view of one breaker
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    /// Model id
    pub model_id: String,
    /// State at snapshot time
    pub state: CircuitState,
    /// Consecutive failures while closed
    pub failure_count: u32,
    /// Successes while half-open
    pub success_count: u32,
    /// Lifetime successes
    pub total_successes: u64,
    /// Lifetime failures
    pub total_failures: u64,
    /// How many times the circuit has opened
    pub times_opened: u64,
}

/// The set of breakers, one per model id
#[derive(Debug)]
pub struct CircuitRegistry {
    breakers: DashMap<String, CircuitBreaker>,
    config: CircuitConfig,
    events: EventBus,
}

impl CircuitRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(config: CircuitConfig, events: EventBus) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
            events,
        }
    }

    /// Current state of `model_id`; unknown models are closed
    pub fn state(&self, model_id: &str) -> CircuitState {
        let Some(mut breaker) = self.breakers.get_mut(model_id) else {
            return CircuitState::Closed;
        };
        let (state, transition) = breaker.state(Instant::now(), &self.config);
        drop(breaker);
        self.publish(model_id, transition);
        state
    }

    /// Gate a call to `model_id`
    pub fn check(&self, model_id: &str) -> Result<(), CircuitOpenError> {
        if self.state(model_id) == CircuitState::Open {
            Err(CircuitOpenError {
                model_id: model_id.to_string(),
            })
        } else {
            Ok(())
        }
    }

    /// Report a successful backend call
    pub fn record_success(&self, model_id: &str) {
        let transition = self
            .breakers
            .entry(model_id.to_string())
            .or_default()
            .record_success(Instant::now(), &self.config);
        self.publish(model_id, transition);
    }

    /// Report a failed backend call
    pub fn record_failure(&self, model_id: &str) {
        let transition = self
            .breakers
            .entry(model_id.to_string())
            .or_default()
            .record_failure(Instant::now(), &self.config);
        self.publish(model_id, transition);
    }

    /// Snapshot every known breaker, sorted by model id
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let now = Instant::now();
        let mut transitions = Vec::new();
        let mut snapshots: Vec<CircuitSnapshot> = self
            .breakers
            .iter_mut()
            .map(|mut entry| {
                let model_id = entry.key().clone();
                let (state, transition) = entry.value_mut().state(now, &self.config);
                if let Some(t) = transition {
                    transitions.push((model_id.clone(), t));
                }
                let b = entry.value();
                CircuitSnapshot {
                    model_id,
                    state,
                    failure_count: b.failure_count,
                    success_count: b.success_count,
                    total_successes: b.total_successes,
                    total_failures: b.total_failures,
                    times_opened: b.times_opened,
                }
            })
            .collect();
        for (model_id, t) in transitions {
            self.publish(&model_id, Some(t));
        }
        snapshots.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        snapshots
    }

    fn publish(&self, model_id: &str, transition: Option<Transition>) {
        let Some(t) = transition else { return };
        match t.to {
            CircuitState::Open => tracing::warn!(
                model = %model_id,
                from = %t.from,
                "Circuit breaker opened - model excluded from routing"
            ),
            CircuitState::HalfOpen => tracing::info!(
                model = %model_id,
                "Circuit breaker half-open - model on probation"
            ),
            CircuitState::Closed => tracing::info!(
                model = %model_id,
                "Circuit breaker closed - model recovered"
            ),
        }
        self.events.emit(RouterEvent::CircuitStateChanged {
            model_id: model_id.to_string(),
            from: t.from,
            to: t.to,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> CircuitConfig {
        CircuitConfig::default()
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let cfg = config();
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new();

        for _ in 0..4 {
            assert_eq!(breaker.record_failure(now, &cfg), None);
        }
        assert_eq!(breaker.failure_count(), 4);
        assert_eq!(
            breaker.record_failure(now, &cfg),
            Some(Transition {
                from: CircuitState::Closed,
                to: CircuitState::Open
            })
        );
        assert_eq!(breaker.state(now, &cfg).0, CircuitState::Open);
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let cfg = config();
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new();

        for _ in 0..4 {
            breaker.record_failure(now, &cfg);
        }
        breaker.record_success(now, &cfg);
        for _ in 0..4 {
            breaker.record_failure(now, &cfg);
        }
        assert_eq!(breaker.state(now, &cfg).0, CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_timeout_then_closes() {
        let cfg = config();
        let start = Instant::now();
        let mut breaker = CircuitBreaker::new();
        for _ in 0..5 {
            breaker.record_failure(start, &cfg);
        }

        let (state, _) = breaker.state(start + Duration::from_secs(59), &cfg);
        assert_eq!(state, CircuitState::Open);

        let later = start + Duration::from_secs(61);
        let (state, transition) = breaker.state(later, &cfg);
        assert_eq!(state, CircuitState::HalfOpen);
        assert_eq!(transition.map(|t| t.to), Some(CircuitState::HalfOpen));

        assert_eq!(breaker.record_success(later, &cfg), None);
        assert_eq!(breaker.record_success(later, &cfg), None);
        let closed = breaker.record_success(later, &cfg);
        assert_eq!(closed.map(|t| t.to), Some(CircuitState::Closed));
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_half_open_failure_reopens_and_restarts_timer() {
        let cfg = config();
        let start = Instant::now();
        let mut breaker = CircuitBreaker::new();
        for _ in 0..5 {
            breaker.record_failure(start, &cfg);
        }

        let probe = start + Duration::from_secs(60);
        breaker.record_success(probe, &cfg);
        let reopened = breaker.record_failure(probe, &cfg);
        assert_eq!(
            reopened,
            Some(Transition {
                from: CircuitState::HalfOpen,
                to: CircuitState::Open
            })
        );
        assert_eq!(breaker.success_count(), 0);

        let (state, _) = breaker.state(probe + Duration::from_secs(30), &cfg);
        assert_eq!(state, CircuitState::Open);
        let (state, _) = breaker.state(probe + Duration::from_secs(60), &cfg);
        assert_eq!(state, CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_emits_transitions() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let registry = CircuitRegistry::new(config(), bus);

        assert_eq!(registry.state("m1"), CircuitState::Closed);
        for _ in 0..5 {
            registry.record_failure("m1");
        }
        assert!(registry.check("m1").is_err());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(registry.check("m1").is_ok());

        let first = rx.recv().await.unwrap();
        assert_eq!(
            first,
            RouterEvent::CircuitStateChanged {
                model_id: "m1".into(),
                from: CircuitState::Closed,
                to: CircuitState::Open,
            }
        );
        let second = rx.recv().await.unwrap();
        assert!(matches!(
            second,
            RouterEvent::CircuitStateChanged {
                to: CircuitState::HalfOpen,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_reports_counts() {
        let registry = CircuitRegistry::new(config(), EventBus::default());
        registry.record_success("b");
        registry.record_failure("a");
        registry.record_failure("a");

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].model_id, "a");
        assert_eq!(snapshot[0].failure_count, 2);
        assert_eq!(snapshot[1].total_successes, 1);
    }
}

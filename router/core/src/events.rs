//! Router Events
//!
//! Observability events published by the router core. The set of event tags
//! is fixed; subscribers receive them over a tokio broadcast channel.
//!
//! Publishing is fire-and-forget: a bus with no subscribers, or a subscriber
//! that lags behind, never slows down or fails the request path.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::cache::TierKind;
use crate::memory::PressureState;
use crate::routing::circuit::CircuitState;
use crate::routing::selector::SelectionStrategy;

/// Why entries left a cache tier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// Tier exceeded its byte budget on insert
    Capacity,
    /// Entry outlived its TTL
    Expired,
    /// Memory manager asked for space back
    Pressure,
    /// Entry failed integrity checks on read
    Corrupt,
}

/// Events emitted by the router core
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum RouterEvent {
    /// A routing decision was made for a request
    RoutingDecided {
        /// Request the decision belongs to
        request_id: String,
        /// Chosen primary model
        primary: String,
        /// Ordered fallback models
        fallbacks: Vec<String>,
        /// Strategy used for scoring
        strategy: SelectionStrategy,
    },

    /// A model's circuit breaker changed state
    CircuitStateChanged {
        /// Model whose breaker moved
        model_id: String,
        /// Previous state
        from: CircuitState,
        /// New state
        to: CircuitState,
    },

    /// Entries were removed from a cache tier
    CacheEvicted {
        /// Tier the entries were removed from
        tier: TierKind,
        /// Number of entries removed
        entries: usize,
        /// Bytes released
        bytes: u64,
        /// Why they were removed
        reason: EvictionReason,
    },

    /// Memory pressure state changed between two checks
    PressureChanged {
        /// State observed at the previous check
        from: PressureState,
        /// State observed now
        to: PressureState,
        /// Utilization that produced `to`
        utilization: f64,
        /// Set when operators must be alerted (Emergency)
        alert: bool,
    },
}

/// Broadcast bus for [`RouterEvent`]s
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<RouterEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    /// Create a bus that buffers up to `capacity` events per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all future events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.tx.subscribe()
    }

    /// Publish an event
    pub fn emit(&self, event: RouterEvent) {
        tracing::debug!(?event, "router event");
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    /// Number of live subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.emit(RouterEvent::CacheEvicted {
            tier: TierKind::Hot,
            entries: 1,
            bytes: 10,
            reason: EvictionReason::Capacity,
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();

        bus.emit(RouterEvent::CircuitStateChanged {
            model_id: "m1".into(),
            from: CircuitState::Closed,
            to: CircuitState::Open,
        });
        bus.emit(RouterEvent::PressureChanged {
            from: PressureState::Normal,
            to: PressureState::Warning,
            utilization: 0.8,
            alert: false,
        });

        assert!(matches!(
            rx.recv().await,
            Ok(RouterEvent::CircuitStateChanged { .. })
        ));
        assert!(matches!(
            rx.recv().await,
            Ok(RouterEvent::PressureChanged { to: PressureState::Warning, .. })
        ));
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = RouterEvent::RoutingDecided {
            request_id: "r1".into(),
            primary: "m1".into(),
            fallbacks: vec!["m2".into()],
            strategy: SelectionStrategy::Balanced,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "routingDecided");
        assert_eq!(json["strategy"], "balanced");
    }
}

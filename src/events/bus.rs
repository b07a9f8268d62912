//! Topic-partitioned event bus.
//!
//! Each [`EventTopic`] owns a bounded `tokio::sync::broadcast` channel.
//! Emission never blocks: a subscriber that falls more than `capacity`
//! events behind observes `RecvError::Lagged` on its next receive instead
//! of slowing the emitter down. Emitting on a topic with no subscribers is
//! a no-op.
//!
//! The bus is an ordinary value. Build one per engine and hand an `Arc` to
//! every component that publishes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;

use super::engine_events::{EngineEvent, EventPayload, EventTopic};

/// Default per-topic channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

pub struct EventBus {
    channels: HashMap<EventTopic, broadcast::Sender<EngineEvent>>,
    capacity: usize,
    sequence: AtomicU64,
    delivered: AtomicU64,
}

impl EventBus {
    /// Create a bus with `capacity` buffered events per topic.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let channels = EventTopic::ALL
            .iter()
            .map(|topic| (*topic, broadcast::channel(capacity).0))
            .collect();
        Self {
            channels,
            capacity,
            sequence: AtomicU64::new(1),
            delivered: AtomicU64::new(0),
        }
    }

    /// Publish a payload on its topic. Returns the emitted event.
    pub fn emit(&self, payload: EventPayload) -> EngineEvent {
        let event = EngineEvent::new(self.sequence.fetch_add(1, Ordering::Relaxed), payload);
        let topic = event.topic();

        if let Some(sender) = self.channels.get(&topic) {
            match sender.send(event.clone()) {
                Ok(receivers) => {
                    self.delivered.fetch_add(receivers as u64, Ordering::Relaxed);
                }
                Err(_) => {
                    log::trace!("[EventBus] No subscribers for {}", topic);
                }
            }
        }
        event
    }

    /// Subscribe to a single topic.
    pub fn subscribe(&self, topic: EventTopic) -> broadcast::Receiver<EngineEvent> {
        match self.channels.get(&topic) {
            Some(sender) => sender.subscribe(),
            // Every topic is populated in `new`.
            None => broadcast::channel(1).1,
        }
    }

    /// Subscribe to several topics at once.
    pub fn subscribe_many(
        &self,
        topics: &[EventTopic],
    ) -> Vec<(EventTopic, broadcast::Receiver<EngineEvent>)> {
        topics
            .iter()
            .map(|topic| (*topic, self.subscribe(*topic)))
            .collect()
    }

    /// Current number of subscribers on a topic.
    pub fn subscriber_count(&self, topic: EventTopic) -> usize {
        self.channels
            .get(&topic)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    /// Total events emitted since creation.
    pub fn emitted(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed) - 1
    }

    /// Total deliveries (events × receivers) since creation.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("emitted", &self.emitted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    fn point(value: f64) -> EventPayload {
        EventPayload::MetricPoint {
            metric: "latency".to_string(),
            value,
        }
    }

    #[tokio::test]
    async fn test_events_routed_by_topic() {
        let bus = EventBus::new(8);
        let mut metrics = bus.subscribe(EventTopic::MetricRecorded);
        let mut approvals = bus.subscribe(EventTopic::ApprovalApproved);

        bus.emit(point(1.0));

        let event = metrics.recv().await.unwrap();
        assert_eq!(event.topic(), EventTopic::MetricRecorded);
        assert_eq!(event.sequence, 1);
        assert!(matches!(approvals.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let bus = EventBus::default();
        bus.emit(point(1.0));
        bus.emit(point(2.0));
        assert_eq!(bus.emitted(), 2);
        assert_eq!(bus.delivered(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe(EventTopic::MetricRecorded);

        for i in 0..5 {
            bus.emit(point(i as f64));
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
        let next = rx.recv().await.unwrap();
        assert_eq!(next.payload, point(3.0));
    }

    #[test]
    fn test_topic_names() {
        assert_eq!(EventTopic::CircuitStateChange.as_str(), "circuit:state-change");
        let json = serde_json::to_string(&EventTopic::ApprovalTimeout).unwrap();
        assert_eq!(json, "\"approval:timeout\"");
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Events
//!
//! This module provides the typed observer surface of the transport.
//! Lifecycle transitions, publish/consume milestones, and recoverable
//! errors are broadcast to every subscriber; a slow or absent subscriber
//! never blocks the transport.

use serde_json::Value;
use tokio::sync::broadcast;

/// Everything the transport announces to observers.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The connection is open and declarations may proceed
    Ready,
    /// The connection closed, with the broker error when there was one
    Close { error: Option<String> },
    /// A message left through the publish pipeline
    Publish { routing_key: String, message: Value },
    /// A delivery entered the routing adapter
    Pre { routing_key: String },
    /// A delivery finished the routing adapter, whether or not a reply
    /// was sent
    After {
        routing_key: String,
        correlation_id: Option<String>,
    },
    /// The private reply queue exists under the given name
    PrivateQueueReady { queue: String },
    /// A consumed queue finished (re-)establishment
    ConsumedQueueReconnected {
        queue: String,
        consumer_tag: String,
    },
    /// A consumer stream terminated
    ConsumerClose { consumer_tag: String },
    /// An unexpected error observers may want to treat as fatal
    Error { message: String },
}

/// Broadcast fan-out of transport events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TransportEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> EventBus {
        let (sender, _) = broadcast::channel(capacity);
        EventBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.sender.subscribe()
    }

    /// Emits an event. Having no subscribers is not an error.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_observe_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(TransportEvent::Ready);
        bus.emit(TransportEvent::Publish {
            routing_key: "math.sum".to_owned(),
            message: json!({"x": 1}),
        });

        assert!(matches!(rx.recv().await.unwrap(), TransportEvent::Ready));
        match rx.recv().await.unwrap() {
            TransportEvent::Publish { routing_key, .. } => {
                assert_eq!(routing_key, "math.sum")
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn emitting_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit(TransportEvent::Ready);
    }
}

//! Outbound message fan-out.
//!
//! The gateway never speaks the bus wire protocol itself — it hands shaped
//! payloads to an injected [`Publisher`]. The process root wires a
//! [`ChannelPublisher`] whose receiving end feeds whatever bridge is attached
//! (MQTT sidecar, WebSocket broadcaster, a test harness).

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

/// One shaped payload on its way out of the core.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Value,
}

/// Injected publishing seam. Implementations must not block the caller:
/// tracking and DMX ticks call this on their hot path.
pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, payload: Value);
}

/// Publisher backed by a bounded channel. When the bridge on the other end
/// falls behind, messages are dropped with a warning rather than stalling a
/// tick.
pub struct ChannelPublisher {
    tx: mpsc::Sender<OutboundMessage>,
}

impl ChannelPublisher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl Publisher for ChannelPublisher {
    fn publish(&self, topic: &str, payload: Value) {
        let msg = OutboundMessage {
            topic: topic.to_string(),
            payload,
        };
        if let Err(e) = self.tx.try_send(msg) {
            warn!("publisher: dropped message for {topic}: {e}");
        }
    }
}

/// Discards everything. Useful when running headless.
pub struct NoopPublisher;

impl Publisher for NoopPublisher {
    fn publish(&self, _topic: &str, _payload: Value) {}
}

/// Captures everything, for assertions in tests.
#[derive(Default)]
pub struct RecordingPublisher {
    messages: std::sync::Mutex<Vec<OutboundMessage>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut self.messages.lock().unwrap())
    }

    pub fn topics(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.topic.clone())
            .collect()
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&self, topic: &str, payload: Value) {
        self.messages.lock().unwrap().push(OutboundMessage {
            topic: topic.to_string(),
            payload,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn channel_publisher_delivers_in_order() {
        let (publisher, mut rx) = ChannelPublisher::new(8);
        publisher.publish("a", json!({"n": 1}));
        publisher.publish("b", json!({"n": 2}));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.topic, "a");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.payload["n"], 2);
    }

    #[test]
    fn full_channel_drops_instead_of_blocking() {
        let (publisher, rx) = ChannelPublisher::new(1);
        publisher.publish("a", json!(1));
        publisher.publish("b", json!(2)); // dropped, channel full
        drop(rx);
        publisher.publish("c", json!(3)); // dropped, receiver gone
    }
}

use crate::types::StreamEvent;

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<StreamEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: StreamEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StreamEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StreamEventType;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(StreamEvent::new(
            StreamEventType::Status,
            "exec-1",
            Some("wf".into()),
            serde_json::json!({"status": "running"}),
        ));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.execution_id, "exec-1");
        assert_eq!(event.event_type, StreamEventType::Status);
    }

    #[test]
    fn publish_without_receivers_is_silent() {
        let bus = EventBus::default();
        assert_eq!(bus.receiver_count(), 0);
        bus.publish(StreamEvent::new(
            StreamEventType::Heartbeat,
            "exec-1",
            None,
            serde_json::Value::Null,
        ));
    }
}

//! Event bus: a tokio broadcast channel carrying status notices.
//!
//! The Supervisor, Bridge and Auth Recovery publish here; the Gateway
//! entrypoint subscribes and delivers notices to the channel.

use tokio::sync::broadcast;

use duet_types::health::WorkerHealth;

const BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// A notice for one conversation.
    Notify { conversation_id: String, text: String },
    /// A worker-level notice for whoever has been active recently.
    Broadcast { text: String },
    HealthChanged(WorkerHealth),
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Subscribe to receive future events.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers. Returns `false` when
    /// nobody is listening.
    pub fn send(&self, event: GatewayEvent) -> bool {
        self.sender.send(event).is_ok()
    }

    pub fn notify(&self, conversation_id: &str, text: impl Into<String>) -> bool {
        self.send(GatewayEvent::Notify {
            conversation_id: conversation_id.to_string(),
            text: text.into(),
        })
    }

    pub fn broadcast(&self, text: impl Into<String>) -> bool {
        self.send(GatewayEvent::Broadcast { text: text.into() })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_listener_is_reported() {
        let bus = EventBus::new();
        assert!(!bus.broadcast("nobody hears this"));

        let mut rx = bus.subscribe();
        assert!(bus.notify("42", "hello"));
        assert_eq!(
            rx.recv().await.unwrap(),
            GatewayEvent::Notify {
                conversation_id: "42".into(),
                text: "hello".into()
            }
        );
    }
}

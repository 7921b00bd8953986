use crate::events::{OutcomeEvent, OutcomeSink};
use tokio::sync::broadcast;

/// Event bus for broadcasting outcomes to live subscribers
pub struct EventBus {
    sender: broadcast::Sender<OutcomeEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to outcomes
    pub fn subscribe(&self) -> broadcast::Receiver<OutcomeEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl OutcomeSink for EventBus {
    fn publish(&self, event: &OutcomeEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event.clone());
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

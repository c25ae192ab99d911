// In-process trigger bus

use crate::errors::QueueError;
use crate::models::TriggerEvent;
use crate::queue::publisher::TriggerPublisher;
use tokio::sync::broadcast;
use tracing::debug;

/// Publishes trigger notifications onto a tokio broadcast channel.
///
/// Having no subscribers is not a failure.
#[derive(Debug, Clone)]
pub struct BroadcastTriggerPublisher {
    sender: broadcast::Sender<TriggerEvent>,
}

impl BroadcastTriggerPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TriggerEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastTriggerPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait::async_trait]
impl TriggerPublisher for BroadcastTriggerPublisher {
    async fn publish(&self, event: &TriggerEvent) -> Result<(), QueueError> {
        match self.sender.send(event.clone()) {
            Ok(receivers) => debug!(task_id = %event.task_id, receivers, "Trigger broadcast"),
            Err(_) => debug!(task_id = %event.task_id, "Trigger broadcast with no subscribers"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn event() -> TriggerEvent {
        TriggerEvent {
            task_id: Uuid::new_v4(),
            task_name: "stretch".to_string(),
            fired_at: Utc::now(),
            source_module: None,
            source_entity_id: None,
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let publisher = BroadcastTriggerPublisher::new(8);
        let mut rx = publisher.subscribe();
        let event = event();
        publisher.publish(&event).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let publisher = BroadcastTriggerPublisher::default();
        assert_eq!(publisher.subscriber_count(), 0);
        assert!(publisher.publish(&event()).await.is_ok());
    }
}

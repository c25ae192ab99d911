// Trigger publisher port and its NATS JetStream implementation

use crate::errors::QueueError;
use crate::models::TriggerEvent;
use crate::queue::nats::NatsClient;
use async_nats::jetstream::context::PublishAckFuture;
use std::time::Duration;
use tracing::{debug, instrument};

/// Outbound port for trigger notifications.
///
/// The scheduler publishes once per fire and does not know who listens.
#[async_trait::async_trait]
pub trait TriggerPublisher: Send + Sync {
    async fn publish(&self, event: &TriggerEvent) -> Result<(), QueueError>;
}

/// NATS-based trigger publisher
pub struct NatsTriggerPublisher {
    client: NatsClient,
    publish_timeout: Duration,
}

impl NatsTriggerPublisher {
    pub fn new(client: NatsClient) -> Self {
        Self {
            client,
            publish_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    fn subject_for(&self, event: &TriggerEvent) -> String {
        subject_for(&self.client.config().subject_prefix, event)
    }
}

/// `<prefix>.<source_module>.<task_id>`, with `unsourced` for tasks without an owner
fn subject_for(prefix: &str, event: &TriggerEvent) -> String {
    let module = event
        .source_module
        .as_deref()
        .filter(|m| !m.is_empty())
        .map(|m| m.replace(['.', '*', '>', ' '], "_"))
        .unwrap_or_else(|| "unsourced".to_string());
    format!("{}.{}.{}", prefix, module, event.task_id)
}

#[async_trait::async_trait]
impl TriggerPublisher for NatsTriggerPublisher {
    #[instrument(skip(self, event), fields(
        task_id = %event.task_id,
        fired_at = %event.fired_at
    ))]
    async fn publish(&self, event: &TriggerEvent) -> Result<(), QueueError> {
        let payload = serde_json::to_vec(event)?;
        let subject = self.subject_for(event);

        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Msg-Id", event.idempotency_key().as_str());
        headers.insert("Task-Id", event.task_id.to_string().as_str());

        let publish_future: PublishAckFuture = self
            .client
            .jetstream()
            .publish_with_headers(subject.clone(), headers, payload.into())
            .await
            .map_err(|e| QueueError::PublishFailed(format!("Failed to publish message: {}", e)))?;

        // Wait for acknowledgment with timeout
        match tokio::time::timeout(self.publish_timeout, publish_future).await {
            Ok(Ok(_ack)) => {
                debug!(subject = %subject, "Trigger notification published");
                Ok(())
            }
            Ok(Err(e)) => Err(QueueError::PublishFailed(format!(
                "Failed to get publish acknowledgment: {}",
                e
            ))),
            Err(_) => Err(QueueError::Timeout(format!(
                "Publish acknowledgment timeout after {:?}",
                self.publish_timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn event(source_module: Option<&str>) -> TriggerEvent {
        TriggerEvent {
            task_id: Uuid::new_v4(),
            task_name: "water plants".to_string(),
            fired_at: Utc::now(),
            source_module: source_module.map(str::to_string),
            source_entity_id: Some("42".to_string()),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_subject_includes_module_and_task() {
        let event = event(Some("reminder"));
        assert_eq!(
            subject_for("schedule.triggered", &event),
            format!("schedule.triggered.reminder.{}", event.task_id)
        );
    }

    #[test]
    fn test_subject_sanitizes_module_tokens() {
        let event = event(Some("goal.recurring"));
        assert_eq!(
            subject_for("schedule.triggered", &event),
            format!("schedule.triggered.goal_recurring.{}", event.task_id)
        );
    }

    #[test]
    fn test_subject_without_source() {
        let event = event(None);
        assert!(subject_for("p", &event).starts_with("p.unsourced."));
    }

    #[test]
    fn test_trigger_event_serialization() {
        let event = event(Some("reminder"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["task_name"], "water plants");
        assert_eq!(json["source_module"], "reminder");
        assert_eq!(json["source_entity_id"], "42");
    }
}

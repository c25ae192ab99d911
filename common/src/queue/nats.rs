// NATS JetStream client for trigger notifications

use crate::config::NatsSettings;
use crate::errors::QueueError;
use async_nats::jetstream::{
    stream::{Config as StreamConfig, RetentionPolicy, Stream},
    Context as JetStreamContext,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, instrument};

/// NATS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    /// NATS server URL (e.g., "nats://localhost:4222")
    pub url: String,
    /// Stream capturing trigger notifications
    pub stream_name: String,
    /// Subject prefix; events go to `<prefix>.<source_module>.<task_id>`
    pub subject_prefix: String,
    /// Maximum age for messages in the stream (in seconds)
    pub max_age_seconds: u64,
    /// Maximum number of messages to retain
    pub max_messages: i64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            stream_name: "SCHEDULE_TRIGGERS".to_string(),
            subject_prefix: "schedule.triggered".to_string(),
            max_age_seconds: 86400, // 24 hours
            max_messages: 1_000_000,
        }
    }
}

impl From<&NatsSettings> for NatsConfig {
    fn from(settings: &NatsSettings) -> Self {
        Self {
            url: settings.url.clone(),
            stream_name: settings.stream_name.clone(),
            subject_prefix: settings.subject_prefix.clone(),
            ..Default::default()
        }
    }
}

/// NATS JetStream client
pub struct NatsClient {
    jetstream: JetStreamContext,
    config: NatsConfig,
}

impl NatsClient {
    /// Connect to the NATS server
    #[instrument(skip(config), fields(url = %config.url))]
    pub async fn new(config: NatsConfig) -> Result<Self, QueueError> {
        info!("Connecting to NATS server");

        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to connect to NATS: {}", e)))?;

        info!("Connected to NATS server successfully");

        Ok(Self {
            jetstream: async_nats::jetstream::new(client),
            config,
        })
    }

    /// Create the trigger stream if it does not exist.
    ///
    /// Limits retention: any number of consumers may read the same trigger.
    #[instrument(skip(self))]
    pub async fn initialize_stream(&self) -> Result<Stream, QueueError> {
        let stream_config = StreamConfig {
            name: self.config.stream_name.clone(),
            subjects: vec![format!("{}.>", self.config.subject_prefix)],
            retention: RetentionPolicy::Limits,
            max_age: Duration::from_secs(self.config.max_age_seconds),
            max_messages: self.config.max_messages,
            ..Default::default()
        };

        let stream = self
            .jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| QueueError::StreamCreation(format!("Failed to create stream: {}", e)))?;

        info!(
            stream_name = %self.config.stream_name,
            "Trigger stream initialized"
        );

        Ok(stream)
    }

    pub fn jetstream(&self) -> &JetStreamContext {
        &self.jetstream
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }

    /// Health check - verify the stream is reachable
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), QueueError> {
        self.jetstream
            .get_stream(&self.config.stream_name)
            .await
            .map_err(|e| QueueError::HealthCheck(format!("Health check failed: {}", e)))?;

        Ok(())
    }
}

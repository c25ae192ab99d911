// Configuration management with layered configuration (file, env)

use crate::schedule::parse_timezone;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub nats: NatsSettings,
    pub scheduler: SchedulerSettings,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsSettings {
    pub url: String,
    pub stream_name: String,
    pub subject_prefix: String,
    pub publish_timeout_seconds: u64,
}

/// Where trigger notifications go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublisherKind {
    Nats,
    Broadcast,
}

/// What happens to completed and cancelled tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// Keep finished tasks as rows
    Retain,
    /// Periodically hard-delete finished tasks
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// IANA timezone used to evaluate recurrence expressions
    pub timezone: String,
    pub publisher: PublisherKind,
    pub retention: RetentionPolicy,
    pub retention_sweep_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: Option<u16>,
    pub tracing_endpoint: Option<String>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let defaults = Config::try_from(&Settings::default())?;

        let builder = Config::builder()
            // Start with built-in defaults
            .add_source(defaults)
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.database.url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }
        if self.database.max_connections == 0 {
            return Err("Database max_connections must be greater than 0".to_string());
        }
        if self.database.min_connections > self.database.max_connections {
            return Err("Database min_connections cannot exceed max_connections".to_string());
        }

        if self.scheduler.publisher == PublisherKind::Nats {
            if self.nats.url.is_empty() {
                return Err("NATS URL cannot be empty".to_string());
            }
            if self.nats.stream_name.is_empty() {
                return Err("NATS stream_name cannot be empty".to_string());
            }
        }

        parse_timezone(&self.scheduler.timezone).map_err(|e| e.to_string())?;

        if self.scheduler.retention == RetentionPolicy::Delete
            && self.scheduler.retention_sweep_seconds == 0
        {
            return Err("Scheduler retention_sweep_seconds must be greater than 0".to_string());
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgresql://localhost/productivity".to_string(),
                max_connections: 10,
                min_connections: 2,
                connect_timeout_seconds: 30,
            },
            nats: NatsSettings {
                url: "nats://localhost:4222".to_string(),
                stream_name: "SCHEDULE_TRIGGERS".to_string(),
                subject_prefix: "schedule.triggered".to_string(),
                publish_timeout_seconds: 5,
            },
            scheduler: SchedulerSettings {
                timezone: "UTC".to_string(),
                publisher: PublisherKind::Nats,
                retention: RetentionPolicy::Retain,
                retention_sweep_seconds: 3600,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: Some(9090),
                tracing_endpoint: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_catches_empty_database_url() {
        let mut settings = Settings::default();
        settings.database.url = String::new();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_unknown_timezone() {
        let mut settings = Settings::default();
        settings.scheduler.timezone = "Mars/Olympus".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_nats_settings_ignored_for_broadcast_publisher() {
        let mut settings = Settings::default();
        settings.scheduler.publisher = PublisherKind::Broadcast;
        settings.nats.url = String::new();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_delete_retention_requires_sweep_interval() {
        let mut settings = Settings::default();
        settings.scheduler.retention = RetentionPolicy::Delete;
        settings.scheduler.retention_sweep_seconds = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_without_files_uses_defaults() {
        let settings = Settings::load_from_path("/nonexistent-config-dir").unwrap();
        assert_eq!(settings.scheduler.timezone, "UTC");
        assert_eq!(settings.scheduler.retention, RetentionPolicy::Retain);
    }
}

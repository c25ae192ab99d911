use crate::errors::{TaskError, ValidationError};
use crate::schedule::validate_expression;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque key/value payload forwarded verbatim into trigger notifications
pub type TaskMetadata = HashMap<String, serde_json::Value>;

// ============================================================================
// Task Models
// ============================================================================

/// ScheduleTask is the unit the scheduler arms and fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleTask {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub recurrence_expression: String,
    pub source_module: Option<String>,
    pub source_entity_id: Option<String>,
    #[serde(default)]
    pub metadata: TaskMetadata,
    pub enabled: bool,
    pub status: TaskStatus,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub execution_count: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// TaskStatus is the lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Paused,
    Cancelled,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Paused => "paused",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Completed => "completed",
        }
    }

    /// Terminal states accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Cancelled | TaskStatus::Completed)
    }

    /// Whether `self -> to` is a legal transition.
    ///
    /// active <-> paused, active|paused -> cancelled, active -> completed.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Active, Paused) | (Paused, Active) | (Active, Cancelled) | (Paused, Cancelled) | (Active, Completed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(TaskStatus::Active),
            "paused" => Ok(TaskStatus::Paused),
            "cancelled" => Ok(TaskStatus::Cancelled),
            "completed" => Ok(TaskStatus::Completed),
            other => Err(ValidationError::InvalidFieldValue {
                field: "status".to_string(),
                reason: format!("unknown status '{}'", other),
            }),
        }
    }
}

impl ScheduleTask {
    /// Build a new active task from a validated create request
    pub fn new(request: NewScheduleTask, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: request.name,
            description: request.description,
            recurrence_expression: request.recurrence_expression,
            source_module: request.source_module,
            source_entity_id: request.source_entity_id,
            metadata: request.metadata,
            enabled: request.enabled,
            status: TaskStatus::Active,
            next_run_at: None,
            last_run_at: None,
            execution_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Enabled and active: the only combination that may hold a live timer
    pub fn is_schedulable(&self) -> bool {
        self.enabled && self.status == TaskStatus::Active
    }

    pub fn belongs_to(&self, source_module: &str, source_entity_id: &str) -> bool {
        self.source_module.as_deref() == Some(source_module)
            && self.source_entity_id.as_deref() == Some(source_entity_id)
    }

    pub fn pause(&mut self) -> Result<(), TaskError> {
        self.transition_to(TaskStatus::Paused)
    }

    pub fn resume(&mut self) -> Result<(), TaskError> {
        self.transition_to(TaskStatus::Active)
    }

    pub fn cancel(&mut self) -> Result<(), TaskError> {
        self.transition_to(TaskStatus::Cancelled)
    }

    pub fn complete(&mut self) -> Result<(), TaskError> {
        self.transition_to(TaskStatus::Completed)
    }

    /// Move to `to`, rejecting illegal transitions.
    ///
    /// Re-entering the current state of a non-terminal task is a no-op.
    pub fn transition_to(&mut self, to: TaskStatus) -> Result<(), TaskError> {
        if self.status == to && !to.is_terminal() {
            return Ok(());
        }
        if !self.status.can_transition_to(to) {
            return Err(TaskError::InvalidStateTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        if to != TaskStatus::Active {
            self.next_run_at = None;
        }
        Ok(())
    }

    /// Record one fire attempt. Failures count as fired too.
    pub fn record_fire(&mut self, fired_at: DateTime<Utc>, outcome: Result<(), String>) {
        self.execution_count += 1;
        self.last_run_at = Some(fired_at);
        self.last_error = outcome.err();
        self.updated_at = fired_at;
    }

    /// Apply the plain fields of a patch. Status changes go through
    /// [`ScheduleTask::transition_to`] and are handled by the caller.
    pub fn apply_patch(&mut self, patch: &TaskPatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(description) = &patch.description {
            self.description = description.clone();
        }
        if let Some(metadata) = &patch.metadata {
            self.metadata = metadata.clone();
        }
        if let Some(expression) = &patch.recurrence_expression {
            self.recurrence_expression = expression.clone();
        }
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
    }
}

/// Create request issued by a feature module
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewScheduleTask {
    pub name: String,
    pub description: Option<String>,
    pub recurrence_expression: String,
    pub source_module: Option<String>,
    pub source_entity_id: Option<String>,
    #[serde(default)]
    pub metadata: TaskMetadata,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl NewScheduleTask {
    pub fn new(name: impl Into<String>, recurrence_expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            recurrence_expression: recurrence_expression.into(),
            enabled: true,
            ..Default::default()
        }
    }

    pub fn with_source(
        mut self,
        source_module: impl Into<String>,
        source_entity_id: impl Into<String>,
    ) -> Self {
        self.source_module = Some(source_module.into());
        self.source_entity_id = Some(source_entity_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Name must be non-empty and the expression must parse
    pub fn validate(&self) -> Result<(), TaskError> {
        validate_name(&self.name)?;
        validate_expression(&self.recurrence_expression)?;
        Ok(())
    }
}

/// Partial update; absent fields are left untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub metadata: Option<TaskMetadata>,
    pub recurrence_expression: Option<String>,
    pub enabled: Option<bool>,
    pub status: Option<TaskStatus>,
}

impl TaskPatch {
    pub fn validate(&self) -> Result<(), TaskError> {
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        if let Some(expression) = &self.recurrence_expression {
            validate_expression(expression)?;
        }
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::MissingField("name".to_string()));
    }
    Ok(())
}

// ============================================================================
// Trigger Notification
// ============================================================================

/// Published on every fire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub task_id: Uuid,
    pub task_name: String,
    pub fired_at: DateTime<Utc>,
    pub source_module: Option<String>,
    pub source_entity_id: Option<String>,
    pub metadata: TaskMetadata,
}

impl TriggerEvent {
    pub fn from_task(task: &ScheduleTask, fired_at: DateTime<Utc>) -> Self {
        Self {
            task_id: task.id,
            task_name: task.name.clone(),
            fired_at,
            source_module: task.source_module.clone(),
            source_entity_id: task.source_entity_id.clone(),
            metadata: task.metadata.clone(),
        }
    }

    /// Deduplication key for at-most-once downstream handling of one fire
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.task_id, self.fired_at.timestamp_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task() -> ScheduleTask {
        ScheduleTask::new(NewScheduleTask::new("standup", "0 9 * * Mon"), Utc::now())
    }

    #[test]
    fn test_new_task_is_active_and_unfired() {
        let task = task();
        assert_eq!(task.status, TaskStatus::Active);
        assert!(task.enabled);
        assert!(task.is_schedulable());
        assert_eq!(task.execution_count, 0);
        assert!(task.last_run_at.is_none());
        assert!(task.next_run_at.is_none());
    }

    #[test]
    fn test_pause_resume_cycle() {
        let mut task = task();
        task.next_run_at = Some(Utc::now());
        task.pause().unwrap();
        assert_eq!(task.status, TaskStatus::Paused);
        assert!(task.next_run_at.is_none());
        assert!(!task.is_schedulable());
        task.resume().unwrap();
        assert_eq!(task.status, TaskStatus::Active);
        // Idempotent re-entry
        task.resume().unwrap();
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        let mut cancelled = task();
        cancelled.cancel().unwrap();
        for to in [
            TaskStatus::Active,
            TaskStatus::Paused,
            TaskStatus::Completed,
            TaskStatus::Cancelled,
        ] {
            let err = cancelled.clone().transition_to(to).unwrap_err();
            assert!(matches!(err, TaskError::InvalidStateTransition { .. }));
        }

        let mut completed = task();
        completed.complete().unwrap();
        assert!(completed.resume().is_err());
        assert!(completed.cancel().is_err());
    }

    #[test]
    fn test_paused_cannot_complete() {
        let mut task = task();
        task.pause().unwrap();
        let err = task.complete().unwrap_err();
        match err {
            TaskError::InvalidStateTransition { from, to } => {
                assert_eq!(from, TaskStatus::Paused);
                assert_eq!(to, TaskStatus::Completed);
            }
            other => panic!("unexpected error: {other}"),
        }
        task.cancel().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_record_fire_success_and_failure() {
        let mut task = task();
        let first = Utc::now();
        task.record_fire(first, Err("bus down".to_string()));
        assert_eq!(task.execution_count, 1);
        assert_eq!(task.last_run_at, Some(first));
        assert_eq!(task.last_error.as_deref(), Some("bus down"));

        let second = first + chrono::Duration::minutes(1);
        task.record_fire(second, Ok(()));
        assert_eq!(task.execution_count, 2);
        assert_eq!(task.last_run_at, Some(second));
        assert!(task.last_error.is_none());
    }

    #[test]
    fn test_create_request_validation() {
        assert!(NewScheduleTask::new("ok", "*/5 * * * *").validate().is_ok());
        assert!(matches!(
            NewScheduleTask::new("  ", "*/5 * * * *").validate(),
            Err(TaskError::Validation(_))
        ));
        assert!(matches!(
            NewScheduleTask::new("bad", "every tuesday").validate(),
            Err(TaskError::Schedule(_))
        ));
    }

    #[test]
    fn test_apply_patch_only_touches_present_fields() {
        let mut task = task();
        let original_expression = task.recurrence_expression.clone();
        let patch = TaskPatch {
            name: Some("retro".to_string()),
            description: Some(Some("weekly retro".to_string())),
            ..Default::default()
        };
        task.apply_patch(&patch);
        assert_eq!(task.name, "retro");
        assert_eq!(task.description.as_deref(), Some("weekly retro"));
        assert_eq!(task.recurrence_expression, original_expression);
        assert!(task.enabled);
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            TaskStatus::Active,
            TaskStatus::Paused,
            TaskStatus::Cancelled,
            TaskStatus::Completed,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("archived".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_trigger_event_carries_source_and_metadata() {
        let request = NewScheduleTask::new("pay rent", "0 8 1 * *")
            .with_source("reminder", "tmpl-1")
            .with_metadata("channel", json!("email"));
        let task = ScheduleTask::new(request, Utc::now());
        let fired_at = Utc::now();
        let event = TriggerEvent::from_task(&task, fired_at);

        assert_eq!(event.task_id, task.id);
        assert_eq!(event.task_name, "pay rent");
        assert_eq!(event.source_module.as_deref(), Some("reminder"));
        assert_eq!(event.source_entity_id.as_deref(), Some("tmpl-1"));
        assert_eq!(event.metadata.get("channel"), Some(&json!("email")));
        assert!(event.idempotency_key().starts_with(&task.id.to_string()));
    }
}

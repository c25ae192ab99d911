// Task lifecycle service: the CRUD surface feature modules call

use crate::db::TaskRepository;
use crate::errors::{EngineError, TaskError};
use crate::models::{NewScheduleTask, ScheduleTask, TaskPatch, TaskStatus};
use crate::scheduler::engine::SchedulerEngine;
use crate::scheduler::locks::TaskLocks;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Validates requests, persists tasks and keeps the engine in step.
///
/// Every id-scoped operation holds that id's lock, so a concurrent update
/// and delete of the same task cannot interleave. Writes follow one order:
/// persist the intent, then apply it to the engine, which stores the armed
/// snapshot while it still excludes fires of that task.
pub struct TaskService {
    engine: Arc<SchedulerEngine>,
    repository: Arc<dyn TaskRepository>,
    locks: TaskLocks,
}

impl TaskService {
    pub fn new(engine: Arc<SchedulerEngine>, repository: Arc<dyn TaskRepository>) -> Self {
        Self {
            engine,
            repository,
            locks: TaskLocks::new(),
        }
    }

    pub fn engine(&self) -> &Arc<SchedulerEngine> {
        &self.engine
    }

    /// Validate, persist and register a new task.
    ///
    /// An unparsable expression is rejected before anything is written.
    #[instrument(skip(self, request), fields(task_name = %request.name))]
    pub async fn create_task(&self, request: NewScheduleTask) -> Result<ScheduleTask, TaskError> {
        request.validate()?;

        let task = ScheduleTask::new(request, self.engine.now());
        let _guard = self.locks.acquire(task.id).await;

        self.repository.save(&task).await?;

        let armed = match self.engine.register(task.clone()).await {
            Ok(armed) => armed,
            Err(e) => {
                if let Err(cleanup) = self.repository.delete(task.id).await {
                    warn!(task_id = %task.id, error = %cleanup, "Failed to remove task after registration failure");
                }
                return Err(e.into());
            }
        };

        info!(
            task_id = %armed.id,
            next_run_at = ?armed.next_run_at,
            "Task created"
        );
        Ok(armed)
    }

    pub async fn get_task(&self, id: Uuid) -> Result<ScheduleTask, TaskError> {
        self.repository
            .find_by_uuid(id)
            .await?
            .ok_or(TaskError::NotFound(id))
    }

    pub async fn get_all_tasks(&self) -> Result<Vec<ScheduleTask>, TaskError> {
        Ok(self.repository.find_all().await?)
    }

    /// Apply a partial update.
    ///
    /// A status change goes through the state machine, so an illegal
    /// transition fails before persistence.
    #[instrument(skip(self, patch))]
    pub async fn update_task(&self, id: Uuid, patch: TaskPatch) -> Result<ScheduleTask, TaskError> {
        patch.validate()?;

        let _guard = self.locks.acquire(id).await;
        let mut task = self.get_task(id).await?;

        task.apply_patch(&patch);
        if let Some(status) = patch.status {
            task.transition_to(status)?;
        }
        task.updated_at = self.engine.now();
        if self.engine.is_shut_down() {
            return Err(EngineError::ShutDown.into());
        }

        self.repository.update(&task).await?;
        let armed = self.engine.update(task).await?;

        debug!(status = %armed.status, next_run_at = ?armed.next_run_at, "Task updated");
        Ok(armed)
    }

    /// Disarm, then delete the row
    #[instrument(skip(self))]
    pub async fn delete_task(&self, id: Uuid) -> Result<(), TaskError> {
        let _guard = self.locks.acquire(id).await;
        if self.repository.find_by_uuid(id).await?.is_none() {
            return Err(TaskError::NotFound(id));
        }

        self.engine.unregister(id).await;
        self.repository.delete(id).await?;

        info!("Task deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn enable_task(&self, id: Uuid) -> Result<ScheduleTask, TaskError> {
        self.set_enabled(id, true).await
    }

    #[instrument(skip(self))]
    pub async fn disable_task(&self, id: Uuid) -> Result<ScheduleTask, TaskError> {
        self.set_enabled(id, false).await
    }

    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<ScheduleTask, TaskError> {
        let _guard = self.locks.acquire(id).await;
        let mut task = self.get_task(id).await?;

        task.enabled = enabled;
        if !enabled {
            task.next_run_at = None;
        }
        task.updated_at = self.engine.now();
        if enabled && self.engine.is_shut_down() {
            return Err(EngineError::ShutDown.into());
        }
        self.repository.update(&task).await?;

        let toggled = if enabled {
            self.engine.enable(id).await
        } else {
            self.engine.disable(id).await
        };
        let snapshot = match toggled {
            Some(snapshot) => snapshot,
            // Not in the registry, e.g. persisted while the process was down
            None if enabled => self.engine.update(task).await?,
            None => task,
        };

        debug!(enabled, next_run_at = ?snapshot.next_run_at, "Task enabled flag changed");
        Ok(snapshot)
    }

    pub async fn pause_task(&self, id: Uuid) -> Result<ScheduleTask, TaskError> {
        self.set_status(id, TaskStatus::Paused).await
    }

    /// Resume a paused task; its next fire is computed from now
    pub async fn resume_task(&self, id: Uuid) -> Result<ScheduleTask, TaskError> {
        self.set_status(id, TaskStatus::Active).await
    }

    pub async fn cancel_task(&self, id: Uuid) -> Result<ScheduleTask, TaskError> {
        self.set_status(id, TaskStatus::Cancelled).await
    }

    pub async fn complete_task(&self, id: Uuid) -> Result<ScheduleTask, TaskError> {
        self.set_status(id, TaskStatus::Completed).await
    }

    async fn set_status(&self, id: Uuid, status: TaskStatus) -> Result<ScheduleTask, TaskError> {
        self.update_task(
            id,
            TaskPatch {
                status: Some(status),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn find_by_source(
        &self,
        source_module: &str,
        source_entity_id: &str,
    ) -> Result<Vec<ScheduleTask>, TaskError> {
        Ok(self
            .repository
            .find_by_source(source_module, source_entity_id)
            .await?)
    }

    /// Delete every task owned by one source entity, one at a time through
    /// [`TaskService::delete_task`]. Returns how many were deleted.
    #[instrument(skip(self))]
    pub async fn delete_by_source(
        &self,
        source_module: &str,
        source_entity_id: &str,
    ) -> Result<usize, TaskError> {
        let tasks = self.find_by_source(source_module, source_entity_id).await?;

        let mut deleted = 0;
        for task in tasks {
            match self.delete_task(task.id).await {
                Ok(()) => deleted += 1,
                // Removed concurrently
                Err(TaskError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        info!(deleted, "Tasks deleted by source");
        Ok(deleted)
    }

    /// Register every persisted enabled task. Run once at startup.
    ///
    /// Tasks that fail to register are logged and skipped. Returns the number
    /// registered.
    #[instrument(skip(self))]
    pub async fn load_and_start_enabled_tasks(&self) -> Result<usize, TaskError> {
        let tasks = self.repository.find_all_enabled().await?;
        let total = tasks.len();

        let mut registered = 0;
        for task in tasks {
            let id = task.id;
            match self.engine.register(task).await {
                Ok(_) => registered += 1,
                Err(EngineError::AlreadyRegistered(_)) => {
                    debug!(task_id = %id, "Task already registered");
                }
                Err(e) => {
                    warn!(task_id = %id, error = %e, "Failed to register task at startup");
                }
            }
        }

        info!(
            total,
            registered,
            armed = self.engine.armed_count(),
            "Enabled tasks loaded"
        );
        Ok(registered)
    }

    /// Hard-delete completed and cancelled tasks. Returns how many went.
    #[instrument(skip(self))]
    pub async fn prune_finished_tasks(&self) -> Result<usize, TaskError> {
        let finished: Vec<Uuid> = self
            .repository
            .find_all()
            .await?
            .into_iter()
            .filter(|task| task.status.is_terminal())
            .map(|task| task.id)
            .collect();

        let mut pruned = 0;
        for id in finished {
            match self.delete_task(id).await {
                Ok(()) => pruned += 1,
                Err(TaskError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if pruned > 0 {
            info!(pruned, "Finished tasks pruned");
        }
        Ok(pruned)
    }
}

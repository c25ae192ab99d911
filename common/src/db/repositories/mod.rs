// Repository layer for schedule task persistence

pub mod memory;
pub mod task;

pub use memory::InMemoryTaskRepository;
pub use task::PostgresTaskRepository;

use crate::errors::DatabaseError;
use crate::models::ScheduleTask;
use async_trait::async_trait;
use uuid::Uuid;

/// Persistence contract required by the scheduler.
///
/// Every method reads or writes the task wholesale.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn save(&self, task: &ScheduleTask) -> Result<(), DatabaseError>;

    /// Overwrite an existing task. Fails with `NotFound` if the row is gone.
    async fn update(&self, task: &ScheduleTask) -> Result<(), DatabaseError>;

    /// Delete a task. Returns whether a row was removed.
    async fn delete(&self, id: Uuid) -> Result<bool, DatabaseError>;

    async fn find_by_uuid(&self, id: Uuid) -> Result<Option<ScheduleTask>, DatabaseError>;

    async fn find_by_source(
        &self,
        source_module: &str,
        source_entity_id: &str,
    ) -> Result<Vec<ScheduleTask>, DatabaseError>;

    async fn find_all_enabled(&self) -> Result<Vec<ScheduleTask>, DatabaseError>;

    async fn find_all(&self) -> Result<Vec<ScheduleTask>, DatabaseError>;
}

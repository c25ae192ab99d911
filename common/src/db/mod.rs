// Persistence layer for schedule tasks

pub mod pool;
pub mod repositories;

pub use pool::DbPool;
pub use repositories::{InMemoryTaskRepository, PostgresTaskRepository, TaskRepository};

// Scheduler engine and the task lifecycle service built on it

pub mod engine;
pub mod locks;
pub mod service;

pub use engine::{SchedulerConfig, SchedulerEngine};
pub use locks::{TaskLockGuard, TaskLocks};
pub use service::TaskService;

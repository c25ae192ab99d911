// Shared library for the task scheduler: recurrence parsing, the engine,
// the lifecycle service and their storage and messaging adapters

pub mod clock;
pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod queue;
pub mod schedule;
pub mod scheduler;
pub mod telemetry;

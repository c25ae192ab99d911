// Scheduler engine: in-memory registry of live tasks, one timer per armed task

use crate::clock::{Clock, TimerHandle};
use crate::config::SchedulerSettings;
use crate::db::TaskRepository;
use crate::errors::{DatabaseError, EngineError, ScheduleError};
use crate::models::{ScheduleTask, TaskStatus, TriggerEvent};
use crate::queue::TriggerPublisher;
use crate::schedule::{default_timezone, parse_timezone, Recurrence};
use crate::telemetry;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

/// Configuration for the scheduler engine
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Timezone recurrence expressions are evaluated in
    pub timezone: Tz,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_settings(settings: &SchedulerSettings) -> Result<Self, ScheduleError> {
        Ok(Self {
            timezone: parse_timezone(&settings.timezone)?,
        })
    }
}

/// Registry entry for one task id. Its mutex serializes every operation on
/// that id, fires included.
struct TaskSlot {
    task: ScheduleTask,
    timer: Option<TimerHandle>,
    /// Bumped on every arm; a timer carrying an older value is stale
    generation: u64,
    /// Set once the slot has left the registry
    removed: bool,
}

type SlotRef = Arc<Mutex<TaskSlot>>;

struct EngineInner {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    repository: Arc<dyn TaskRepository>,
    publisher: Arc<dyn TriggerPublisher>,
    slots: Mutex<HashMap<Uuid, SlotRef>>,
    armed: AtomicUsize,
    shut_down: AtomicBool,
}

/// Turns recurrence expressions into timed trigger notifications.
///
/// The engine holds no durable state; the task service re-registers
/// persisted tasks at startup.
pub struct SchedulerEngine {
    inner: Arc<EngineInner>,
}

impl SchedulerEngine {
    pub fn new(
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
        repository: Arc<dyn TaskRepository>,
        publisher: Arc<dyn TriggerPublisher>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                clock,
                repository,
                publisher,
                slots: Mutex::new(HashMap::new()),
                armed: AtomicUsize::new(0),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }

    /// Add a task to the registry, arming it if enabled and active.
    ///
    /// The armed snapshot is written to the repository before the task's
    /// lock is released, and returned.
    #[instrument(skip(self, task), fields(task_id = %task.id, task_name = %task.name))]
    pub async fn register(&self, task: ScheduleTask) -> Result<ScheduleTask, EngineError> {
        if self.inner.is_shut_down() {
            return Err(EngineError::ShutDown);
        }

        let id = task.id;
        let slot = {
            let mut slots = self.inner.slots.lock().await;
            if slots.contains_key(&id) {
                return Err(EngineError::AlreadyRegistered(id));
            }
            let slot = Arc::new(Mutex::new(TaskSlot {
                task,
                timer: None,
                generation: 0,
                removed: false,
            }));
            slots.insert(id, slot.clone());
            slot
        };

        let mut slot = slot.lock().await;
        if !slot.removed {
            self.inner.arm(&mut slot);
            self.inner.persist(&slot.task).await;
        }
        debug!(next_run_at = ?slot.task.next_run_at, "Task registered");
        Ok(slot.task.clone())
    }

    /// Replace a task's snapshot and re-arm it; registers unknown ids.
    ///
    /// Any existing timer is disarmed first, so repeated calls leave a single
    /// timer. Runtime bookkeeping never moves backwards: when the incoming
    /// snapshot has fewer executions than the live one, the live counters win.
    #[instrument(skip(self, task), fields(task_id = %task.id, task_name = %task.name))]
    pub async fn update(&self, mut task: ScheduleTask) -> Result<ScheduleTask, EngineError> {
        if self.inner.is_shut_down() {
            return Err(EngineError::ShutDown);
        }

        loop {
            let slot = {
                let mut slots = self.inner.slots.lock().await;
                slots
                    .entry(task.id)
                    .or_insert_with(|| {
                        Arc::new(Mutex::new(TaskSlot {
                            task: task.clone(),
                            timer: None,
                            generation: 0,
                            removed: false,
                        }))
                    })
                    .clone()
            };

            let mut slot = slot.lock().await;
            if slot.removed {
                // Unregistered while we waited; insert a fresh slot
                continue;
            }

            if task.execution_count < slot.task.execution_count {
                task.execution_count = slot.task.execution_count;
                task.last_run_at = slot.task.last_run_at;
                task.last_error = slot.task.last_error.clone();
            }
            slot.task = task;
            self.inner.arm(&mut slot);
            self.inner.persist(&slot.task).await;
            debug!(next_run_at = ?slot.task.next_run_at, "Task updated");
            return Ok(slot.task.clone());
        }
    }

    /// Disarm and forget a task. Returns the last snapshot, `None` if unknown.
    ///
    /// A fire already in progress completes before this returns; no later
    /// fire can observe the task.
    #[instrument(skip(self))]
    pub async fn unregister(&self, id: Uuid) -> Option<ScheduleTask> {
        let slot = self.inner.slots.lock().await.remove(&id)?;
        let mut slot = slot.lock().await;
        self.inner.disarm(&mut slot);
        slot.removed = true;
        debug!("Task unregistered");
        Some(slot.task.clone())
    }

    /// Set the enabled gate and arm accordingly. `None` if the id is unknown.
    #[instrument(skip(self))]
    pub async fn enable(&self, id: Uuid) -> Option<ScheduleTask> {
        self.set_enabled(id, true).await
    }

    /// Clear the enabled gate and disarm. `None` if the id is unknown.
    #[instrument(skip(self))]
    pub async fn disable(&self, id: Uuid) -> Option<ScheduleTask> {
        self.set_enabled(id, false).await
    }

    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Option<ScheduleTask> {
        let slot = self.inner.slot(id).await?;
        let mut slot = slot.lock().await;
        if slot.removed {
            return None;
        }
        slot.task.enabled = enabled;
        self.inner.arm(&mut slot);
        self.inner.persist(&slot.task).await;
        Some(slot.task.clone())
    }

    /// Current snapshot of a registered task
    pub async fn get(&self, id: Uuid) -> Option<ScheduleTask> {
        let slot = self.inner.slot(id).await?;
        let slot = slot.lock().await;
        if slot.removed {
            None
        } else {
            Some(slot.task.clone())
        }
    }

    pub async fn is_registered(&self, id: Uuid) -> bool {
        self.inner.slots.lock().await.contains_key(&id)
    }

    pub async fn is_armed(&self, id: Uuid) -> bool {
        let Some(slot) = self.inner.slot(id).await else {
            return false;
        };
        let slot = slot.lock().await;
        slot.timer.is_some()
    }

    pub async fn registered_count(&self) -> usize {
        self.inner.slots.lock().await.len()
    }

    /// Number of live timers across all tasks
    pub fn armed_count(&self) -> usize {
        self.inner.armed.load(Ordering::SeqCst)
    }

    /// Disarm every timer without firing and refuse further arming
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);

        let slots: Vec<SlotRef> = self.inner.slots.lock().await.values().cloned().collect();
        let registered = slots.len();
        for slot in slots {
            let mut slot = slot.lock().await;
            self.inner.disarm(&mut slot);
        }

        info!(registered, "Scheduler engine stopped, all timers disarmed");
    }
}

impl EngineInner {
    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    async fn slot(&self, id: Uuid) -> Option<SlotRef> {
        self.slots.lock().await.get(&id).cloned()
    }

    /// Write a snapshot through to the repository. Callers hold the slot lock,
    /// so a fire cannot persist in between.
    async fn persist(&self, task: &ScheduleTask) {
        match self.repository.update(task).await {
            Ok(()) => {}
            Err(DatabaseError::NotFound(_)) => {
                debug!(task_id = %task.id, "Task has no stored row, snapshot kept in memory only");
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Failed to persist task snapshot");
            }
        }
    }

    fn disarm(&self, slot: &mut TaskSlot) {
        if let Some(timer) = slot.timer.take() {
            timer.cancel();
            self.armed.fetch_sub(1, Ordering::SeqCst);
            telemetry::update_armed_tasks(self.armed.load(Ordering::SeqCst));
        }
        slot.task.next_run_at = None;
    }

    /// Next instant strictly after `now`; `Ok(None)` when nothing is left
    fn next_fire_time(
        &self,
        task: &ScheduleTask,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        Ok(Recurrence::parse(&task.recurrence_expression)?.next_after(now, self.config.timezone))
    }

    /// Disarm, then arm from the current instant if the task is schedulable.
    ///
    /// Parse errors and exhausted recurrences leave the task un-armed.
    fn arm(self: &Arc<Self>, slot: &mut TaskSlot) {
        self.disarm(slot);
        if !slot.task.is_schedulable() || self.is_shut_down() {
            return;
        }

        let now = self.clock.now();
        match self.next_fire_time(&slot.task, now) {
            Ok(Some(at)) => self.arm_at(slot, at, now),
            Ok(None) => {
                info!(task_id = %slot.task.id, "Recurrence has no next occurrence, task left un-armed");
            }
            Err(e) => {
                warn!(task_id = %slot.task.id, error = %e, "Cannot compute next fire time, task left un-armed");
            }
        }
    }

    fn arm_at(self: &Arc<Self>, slot: &mut TaskSlot, at: DateTime<Utc>, now: DateTime<Utc>) {
        if self.is_shut_down() {
            slot.task.next_run_at = None;
            return;
        }

        slot.generation += 1;
        let generation = slot.generation;
        let id = slot.task.id;
        let delay = (at - now).to_std().unwrap_or_default();
        let engine: Weak<Self> = Arc::downgrade(self);

        let timer = self.clock.schedule(
            delay,
            async move {
                if let Some(engine) = engine.upgrade() {
                    engine.fire(id, generation).await;
                }
            }
            .boxed(),
        );

        slot.timer = Some(timer);
        slot.task.next_run_at = Some(at);
        self.armed.fetch_add(1, Ordering::SeqCst);
        telemetry::update_armed_tasks(self.armed.load(Ordering::SeqCst));
        debug!(task_id = %id, next_run_at = %at, "Task armed");
    }

    /// Timer expiry entry point. Stale or disarmed timers are ignored.
    fn fire(self: Arc<Self>, id: Uuid, generation: u64) -> BoxFuture<'static, ()> {
        async move {
            let Some(slot) = self.slot(id).await else {
                return;
            };
            let mut slot = slot.lock().await;
            if slot.removed || slot.generation != generation || slot.timer.is_none() {
                debug!("Stale timer ignored");
                return;
            }

            // This timer is spent
            slot.timer = None;
            self.armed.fetch_sub(1, Ordering::SeqCst);
            telemetry::update_armed_tasks(self.armed.load(Ordering::SeqCst));

            self.execute(&mut slot).await;
        }
        .instrument(info_span!("fire", task_id = %id))
        .boxed()
    }

    /// Publish, record the outcome, persist, and re-arm recurring tasks.
    async fn execute(self: &Arc<Self>, slot: &mut TaskSlot) {
        let scheduled = slot.task.next_run_at;
        let fired_at = self.clock.now();
        let event = TriggerEvent::from_task(&slot.task, fired_at);

        let started = std::time::Instant::now();
        let outcome = match AssertUnwindSafe(self.publisher.publish(&event))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("trigger publisher panicked".to_string()),
        };
        telemetry::record_publish_duration(started.elapsed().as_secs_f64());

        let task_id = slot.task.id;
        match &outcome {
            Ok(()) => {
                telemetry::record_task_fired(&task_id, &slot.task.name);
                info!(fired_at = %fired_at, "Task fired");
            }
            Err(reason) => {
                telemetry::record_task_failure(&task_id, &slot.task.name);
                warn!(fired_at = %fired_at, error = %reason, "Trigger notification failed");
            }
        }
        let published = outcome.is_ok();
        slot.task.record_fire(fired_at, outcome);

        // Computed from the current instant, not the missed next_run_at: a
        // late wake fires once and then resumes the normal cadence.
        let now = self.clock.now();
        // Not before the occurrence just fired
        let base = scheduled.map_or(now, |at| at.max(now));
        let next = if slot.task.is_schedulable() && !self.is_shut_down() {
            match Recurrence::parse(&slot.task.recurrence_expression) {
                Ok(recurrence) => {
                    let next = if recurrence.is_one_shot() {
                        None
                    } else {
                        recurrence.next_after(base, self.config.timezone)
                    };
                    if next.is_none() && published && slot.task.status == TaskStatus::Active {
                        if let Err(e) = slot.task.complete() {
                            warn!(error = %e, "Failed to complete exhausted task");
                        } else {
                            info!("Recurrence exhausted, task completed");
                        }
                    }
                    next
                }
                Err(e) => {
                    warn!(error = %e, "Cannot compute next fire time, task left un-armed");
                    None
                }
            }
        } else {
            None
        };
        slot.task.next_run_at = next;

        self.persist(&slot.task).await;

        if let Some(at) = next {
            self.arm_at(slot, at, now);
        }
    }
}

// Clock capability: current time plus cancellable deferred execution

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Future run when a timer expires
pub type TimerFuture = BoxFuture<'static, ()>;

/// Source of time and timers for the scheduler engine
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> DateTime<Utc>;

    /// Run `task` once `delay` has elapsed. The returned handle disarms it.
    fn schedule(&self, delay: Duration, task: TimerFuture) -> TimerHandle;
}

/// Handle to a pending timer. Dropping it leaves the timer armed.
pub struct TimerHandle {
    canceller: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl TimerHandle {
    pub fn new(canceller: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            canceller: Some(Box::new(canceller)),
        }
    }

    /// Disarm the timer. A callback that already started keeps running.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.canceller.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle").finish_non_exhaustive()
    }
}

/// Wall clock backed by tokio timers, one spawned task per armed timer
#[derive(Debug, Clone, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn schedule(&self, delay: Duration, task: TimerFuture) -> TimerHandle {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        TimerHandle::new(move || handle.abort())
    }
}

#[derive(Default)]
struct ManualState {
    now: DateTime<Utc>,
    next_seq: u64,
    timers: BTreeMap<(DateTime<Utc>, u64), TimerFuture>,
}

/// Virtual clock for tests.
///
/// Time only moves through [`ManualClock::advance`] / [`ManualClock::advance_to`],
/// which run every due timer inline in deadline order, and through
/// [`ManualClock::suspend_until`], which runs none.
#[derive(Clone)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                now: start,
                ..Default::default()
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of armed timers
    pub fn pending_timers(&self) -> usize {
        self.state().timers.len()
    }

    /// Deadline of the earliest armed timer
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.state().timers.keys().next().map(|(deadline, _)| *deadline)
    }

    pub async fn advance(&self, by: chrono::Duration) {
        let target = self.now() + by;
        self.advance_to(target).await;
    }

    /// Move time forward to `target`, firing due timers along the way.
    ///
    /// Timers armed by a callback fire in the same call if they fall due
    /// before `target`.
    pub async fn advance_to(&self, target: DateTime<Utc>) {
        loop {
            let due = {
                let mut state = self.state();
                match state.timers.keys().next().copied() {
                    Some(key) if key.0 <= target => {
                        if key.0 > state.now {
                            state.now = key.0;
                        }
                        state.timers.remove(&key)
                    }
                    _ => None,
                }
            };
            match due {
                Some(task) => task.await,
                None => break,
            }
        }

        let mut state = self.state();
        if target > state.now {
            state.now = target;
        }
    }
}

impl ManualClock {
    /// Move time forward to `target` without running any timer, as a
    /// process that was suspended would see it. Overdue timers run late on
    /// the next advance.
    pub fn suspend_until(&self, target: DateTime<Utc>) {
        let mut state = self.state();
        if target > state.now {
            state.now = target;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.state().now
    }

    fn schedule(&self, delay: Duration, task: TimerFuture) -> TimerHandle {
        let key = {
            let mut state = self.state();
            let deadline = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|delay| state.now.checked_add_signed(delay))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            let seq = state.next_seq;
            state.next_seq += 1;
            state.timers.insert((deadline, seq), task);
            (deadline, seq)
        };

        let state = Arc::downgrade(&self.state);
        TimerHandle::new(move || {
            if let Some(state) = state.upgrade() {
                let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                state.timers.remove(&key);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn counting_task(counter: &Arc<AtomicUsize>) -> TimerFuture {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        .boxed()
    }

    #[tokio::test]
    async fn test_manual_clock_fires_due_timers_only() {
        let clock = ManualClock::new(start());
        let fired = Arc::new(AtomicUsize::new(0));
        let _early = clock.schedule(Duration::from_secs(60), counting_task(&fired));
        let _late = clock.schedule(Duration::from_secs(3600), counting_task(&fired));
        assert_eq!(clock.pending_timers(), 2);

        clock.advance(chrono::Duration::minutes(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(clock.now(), start() + chrono::Duration::minutes(5));
        assert_eq!(clock.pending_timers(), 1);
    }

    #[tokio::test]
    async fn test_manual_clock_cancel() {
        let clock = ManualClock::new(start());
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = clock.schedule(Duration::from_secs(60), counting_task(&fired));
        handle.cancel();
        assert_eq!(clock.pending_timers(), 0);

        clock.advance(chrono::Duration::hours(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_manual_clock_sets_now_to_deadline_while_firing() {
        let clock = ManualClock::new(start());
        let seen = Arc::new(Mutex::new(None));
        let task = {
            let clock = clock.clone();
            let seen = seen.clone();
            async move {
                *seen.lock().unwrap() = Some(clock.now());
            }
            .boxed()
        };
        let _handle = clock.schedule(Duration::from_secs(90), task);
        clock.advance(chrono::Duration::hours(1)).await;
        assert_eq!(
            *seen.lock().unwrap(),
            Some(start() + chrono::Duration::seconds(90))
        );
    }

    #[tokio::test]
    async fn test_manual_clock_runs_overdue_timer_late_after_suspend() {
        let clock = ManualClock::new(start());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let task = {
            let clock = clock.clone();
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(clock.now());
            }
            .boxed()
        };
        let _handle = clock.schedule(Duration::from_secs(60), task);

        let woke = start() + chrono::Duration::hours(2);
        clock.suspend_until(woke);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(clock.pending_timers(), 1);

        clock.advance(chrono::Duration::zero()).await;
        assert_eq!(*seen.lock().unwrap(), vec![woke]);
        assert_eq!(clock.pending_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_fires_after_delay() {
        let clock = TokioClock;
        let fired = Arc::new(AtomicUsize::new(0));
        let _handle = clock.schedule(Duration::from_secs(10), counting_task(&fired));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_cancel_prevents_fire() {
        let clock = TokioClock;
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = clock.schedule(Duration::from_secs(10), counting_task(&fired));
        handle.cancel();

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}

//! Timer and scheduling capabilities backed by the tokio runtime.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::error::{ExtensionError, Result};

/// Handle of a running timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// Handle of a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleId(pub u64);

/// One-shot and repeating timers.
pub trait TimerService: Send + Sync {
    /// Run `callback` once after `delay`.
    fn set_timeout(&self, delay: Duration, callback: Box<dyn FnOnce() + Send>) -> TimerId;

    /// Run `callback` every `period`, first tick after one period.
    ///
    /// A zero `period` is rejected.
    fn set_interval(
        &self,
        period: Duration,
        callback: Box<dyn Fn() + Send + Sync>,
    ) -> Result<TimerId>;

    /// Cancel a timer. Returns `false` if it already fired or never existed.
    fn clear(&self, id: TimerId) -> bool;

    /// Number of timers that have not fired or been cleared.
    fn active_count(&self) -> usize;
}

/// Wall-clock job scheduling.
pub trait TaskScheduler: Send + Sync {
    /// Run `job` at `at`. Times in the past run immediately.
    fn schedule_at(&self, at: DateTime<Utc>, job: BoxFuture<'static, ()>) -> ScheduleId;

    fn cancel(&self, id: ScheduleId) -> bool;

    /// Pending jobs, soonest first.
    fn pending(&self) -> Vec<(ScheduleId, DateTime<Utc>)>;
}

// ============================================================================
// Tokio Timers
// ============================================================================

#[derive(Default)]
struct TimerTable {
    next_id: AtomicU64,
    handles: Mutex<HashMap<TimerId, JoinHandle<()>>>,
}

impl TimerTable {
    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// [`TimerService`] spawning one tokio task per timer.
///
/// Must be used from within a tokio runtime.
#[derive(Default)]
pub struct TokioTimers {
    table: Arc<TimerTable>,
}

impl TokioTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel every outstanding timer.
    pub fn clear_all(&self) -> usize {
        let handles: Vec<_> = self.table.handles.lock().drain().collect();
        for (_, handle) in &handles {
            handle.abort();
        }
        handles.len()
    }
}

impl TimerService for TokioTimers {
    fn set_timeout(&self, delay: Duration, callback: Box<dyn FnOnce() + Send>) -> TimerId {
        let id = TimerId(self.table.next());
        let table = self.table.clone();
        // Holding the lock across spawn keeps the task from removing its entry
        // before it has been inserted.
        let mut handles = self.table.handles.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            table.handles.lock().remove(&id);
            callback();
        });
        handles.insert(id, handle);
        id
    }

    fn set_interval(
        &self,
        period: Duration,
        callback: Box<dyn Fn() + Send + Sync>,
    ) -> Result<TimerId> {
        if period.is_zero() {
            return Err(ExtensionError::Other(
                "interval period must be greater than zero".to_string(),
            ));
        }
        let id = TimerId(self.table.next());
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                callback();
            }
        });
        self.table.handles.lock().insert(id, handle);
        Ok(id)
    }

    fn clear(&self, id: TimerId) -> bool {
        match self.table.handles.lock().remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    fn active_count(&self) -> usize {
        self.table.handles.lock().len()
    }
}

// ============================================================================
// Tokio Scheduler
// ============================================================================

struct ScheduledJob {
    at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct ScheduleTable {
    next_id: AtomicU64,
    jobs: Mutex<HashMap<ScheduleId, ScheduledJob>>,
}

/// [`TaskScheduler`] that sleeps until the target time on the tokio runtime.
#[derive(Default)]
pub struct TokioScheduler {
    table: Arc<ScheduleTable>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskScheduler for TokioScheduler {
    fn schedule_at(&self, at: DateTime<Utc>, job: BoxFuture<'static, ()>) -> ScheduleId {
        let id = ScheduleId(self.table.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let table = self.table.clone();
        let mut jobs = self.table.jobs.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            table.jobs.lock().remove(&id);
            job.await;
        });
        jobs.insert(id, ScheduledJob { at, handle });
        id
    }

    fn cancel(&self, id: ScheduleId) -> bool {
        match self.table.jobs.lock().remove(&id) {
            Some(job) => {
                job.handle.abort();
                true
            }
            None => false,
        }
    }

    fn pending(&self) -> Vec<(ScheduleId, DateTime<Utc>)> {
        let mut pending: Vec<_> = self
            .table
            .jobs
            .lock()
            .iter()
            .map(|(id, job)| (*id, job.at))
            .collect();
        pending.sort_by_key(|(_, at)| *at);
        pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_once() {
        let timers = TokioTimers::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        timers.set_timeout(
            Duration::from_secs(5),
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(timers.active_count(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(timers.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_prevents_firing() {
        let timers = TokioTimers::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let id = timers.set_timeout(
            Duration::from_secs(5),
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(timers.clear(id));
        assert!(!timers.clear(id));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_ticks_until_cleared() {
        let timers = TokioTimers::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = ticks.clone();
        let id = timers
            .set_interval(
                Duration::from_secs(1),
                Box::new(move || {
                    t.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert!(timers.clear(id));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_interval_is_rejected() {
        let timers = TokioTimers::new();
        let err = timers.set_interval(Duration::ZERO, Box::new(|| {})).unwrap_err();
        assert!(err.to_string().contains("greater than zero"));
        assert_eq!(timers.active_count(), 0);
        assert_eq!(timers.clear_all(), 0);
    }

    #[tokio::test]
    async fn test_scheduler_pending_and_cancel() {
        let scheduler = TokioScheduler::new();
        let later = Utc::now() + chrono::Duration::hours(2);
        let sooner = Utc::now() + chrono::Duration::hours(1);
        let a = scheduler.schedule_at(later, Box::pin(async {}));
        let b = scheduler.schedule_at(sooner, Box::pin(async {}));

        let pending = scheduler.pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].0, b);

        assert!(scheduler.cancel(a));
        assert_eq!(scheduler.pending().len(), 1);
    }

    #[tokio::test]
    async fn test_scheduler_runs_past_jobs_immediately() {
        let scheduler = TokioScheduler::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        scheduler.schedule_at(
            Utc::now() - chrono::Duration::seconds(1),
            Box::pin(async move {
                let _ = tx.send(());
            }),
        );
        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
    }
}

//! Recurring background tasks.
//!
//! A single governing loop keeps the task list sorted by next execution time,
//! sleeps until the earliest one is due, then hands it to the worker pool and
//! asks its schedule for the following time. A task whose schedule runs dry is
//! dropped; one whose schedule fails is retried a little later.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures_util::future::BoxFuture;
use steward_core::CronExpr;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::error::DispatchError;
use crate::pool::{JobKind, guarded};

/// A schedule could not compute its next time.
#[derive(Debug, Error)]
#[error("schedule failed: {0}")]
pub struct ScheduleError(pub String);

impl ScheduleError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// When a task should next run.
pub trait Schedule: Send + 'static {
    /// The first run time strictly after `now`, or `None` to stop.
    ///
    /// Called once when the task is added and once after every run.
    fn next_after(&mut self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError>;
}

impl Schedule for CronExpr {
    fn next_after(&mut self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        Ok(CronExpr::next_after(self, now))
    }
}

/// Runs every `every`, measured from the previous run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval(pub Duration);

impl Schedule for Interval {
    fn next_after(&mut self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        let step = TimeDelta::from_std(self.0).map_err(|e| ScheduleError::new(e.to_string()))?;
        Ok(now.checked_add_signed(step))
    }
}

/// Schedule backed by a closure.
pub struct FnSchedule<F>(F);

impl<F> Schedule for FnSchedule<F>
where
    F: FnMut(DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError> + Send + 'static,
{
    fn next_after(&mut self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        (self.0)(now)
    }
}

/// Wraps an infallible closure as a schedule.
pub fn from_fn<F>(mut f: F) -> FnSchedule<impl FnMut(DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError>>
where
    F: FnMut(DateTime<Utc>) -> Option<DateTime<Utc>> + Send + 'static,
{
    FnSchedule(move |now| Ok(f(now)))
}

/// Wraps a fallible closure as a schedule.
pub fn try_from_fn<F>(f: F) -> FnSchedule<F>
where
    F: FnMut(DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError> + Send + 'static,
{
    FnSchedule(f)
}

/// Stops `inner` after `runs` executions.
pub struct Limited<S> {
    inner: S,
    remaining: usize,
}

impl<S: Schedule> Limited<S> {
    pub fn new(inner: S, runs: usize) -> Self {
        Self {
            inner,
            remaining: runs,
        }
    }
}

impl<S: Schedule> Schedule for Limited<S> {
    fn next_after(&mut self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        self.inner.next_after(now)
    }
}

/// Boxed task body.
pub type TaskFn = Arc<dyn Fn(Context) -> BoxFuture<'static, Result<(), DispatchError>> + Send + Sync>;

/// A named body plus its schedule.
pub struct Task {
    name: String,
    schedule: Box<dyn Schedule>,
    body: TaskFn,
}

impl Task {
    pub fn new<S, F, Fut>(name: impl Into<String>, schedule: S, body: F) -> Self
    where
        S: Schedule,
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DispatchError>> + Send + 'static,
    {
        let body: TaskFn =
            Arc::new(move |ctx| -> BoxFuture<'static, Result<(), DispatchError>> { Box::pin(body(ctx)) });
        Self {
            name: name.into(),
            schedule: Box::new(schedule),
            body,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

struct Scheduled {
    next_exec: DateTime<Utc>,
    task: Task,
}

/// A task taken off the list because it is due.
pub struct Fired {
    name: String,
    body: TaskFn,
}

impl Fired {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the body, logging failures instead of returning them.
    pub async fn run(self, ctx: Context) {
        debug!(task = %self.name, "Running task");
        if let Err(e) = guarded((self.body)(ctx)).await {
            error!(task = %self.name, error = ?e, "Task failed");
        }
    }
}

/// What the governing loop should do next.
pub enum Due {
    /// Nothing scheduled.
    Idle,
    /// The earliest task is this far away.
    Sleep(Duration),
    /// This task is due now.
    Fire(Fired),
}

/// Tasks sorted by next execution time.
pub struct TaskList {
    tasks: Mutex<Vec<Scheduled>>,
    wake: Notify,
    stopped: AtomicBool,
    retry: Duration,
}

impl TaskList {
    /// `retry` is how long to wait after a schedule fails.
    pub fn new(retry: Duration) -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            wake: Notify::new(),
            stopped: AtomicBool::new(false),
            retry,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Scheduled>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn retry_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        TimeDelta::from_std(self.retry)
            .ok()
            .and_then(|retry| now.checked_add_signed(retry))
            .unwrap_or(now)
    }

    fn insert(tasks: &mut Vec<Scheduled>, scheduled: Scheduled) {
        let position = tasks.partition_point(|s| s.next_exec <= scheduled.next_exec);
        tasks.insert(position, scheduled);
    }

    /// Schedules `task`. Returns `false` if its schedule never fires.
    pub fn add(&self, mut task: Task) -> bool {
        let now = Utc::now();
        let next_exec = match task.schedule.next_after(now) {
            Ok(Some(next)) => next,
            Ok(None) => {
                info!(task = %task.name, "Task has no run time, not scheduling it");
                return false;
            }
            Err(e) => {
                warn!(task = %task.name, error = %e, "Task schedule failed, retrying later");
                self.retry_at(now)
            }
        };
        info!(task = %task.name, next = %next_exec, "Scheduling task");
        Self::insert(&mut self.lock(), Scheduled { next_exec, task });
        self.wake.notify_one();
        true
    }

    /// Decides what is due at `now`.
    ///
    /// A due task is taken off the list and put back under its next run time,
    /// so a task that is late by several periods still fires once.
    pub fn check(&self, now: DateTime<Utc>) -> Due {
        let mut tasks = self.lock();
        let Some(first) = tasks.first() else {
            return Due::Idle;
        };
        if first.next_exec > now {
            let delta = (first.next_exec - now).to_std().unwrap_or_default();
            return Due::Sleep(delta);
        }

        let mut scheduled = tasks.remove(0);
        let fired = Fired {
            name: scheduled.task.name.clone(),
            body: scheduled.task.body.clone(),
        };
        match scheduled.task.schedule.next_after(now) {
            Ok(Some(next)) => {
                scheduled.next_exec = next;
                Self::insert(&mut tasks, scheduled);
            }
            Ok(None) => {
                info!(task = %fired.name, "Task schedule finished, removing task");
            }
            Err(e) => {
                warn!(task = %fired.name, error = %e, "Task schedule failed, retrying later");
                scheduled.next_exec = self.retry_at(now);
                Self::insert(&mut tasks, scheduled);
            }
        }
        Due::Fire(fired)
    }

    /// `(name, next_exec)` for every scheduled task, soonest first.
    pub fn schedule(&self) -> Vec<(String, DateTime<Utc>)> {
        self.lock()
            .iter()
            .map(|s| (s.task.name.clone(), s.next_exec))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// The governing loop. Returns after [`stop`](Self::stop).
    ///
    /// Due tasks run on the worker pool; tasks already running are left
    /// alone when the loop exits.
    pub async fn run(&self, ctx: &Context, idle: Duration, max_sleep: Duration) {
        info!(tasks = self.len(), "Scheduler started");
        while !self.stopped.load(Ordering::SeqCst) {
            match self.check(Utc::now()) {
                Due::Idle => self.pause(idle).await,
                Due::Sleep(delta) => self.pause(delta.min(max_sleep)).await,
                Due::Fire(fired) => {
                    let label = fired.name.clone();
                    ctx.pool().spawn(JobKind::Task, label, fired.run(ctx.clone()));
                }
            }
        }
        info!("Scheduler stopped");
    }

    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.wake.notified() => {}
        }
    }

    /// Asks the governing loop to exit.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::context;
    use crate::registry::Registry;
    use std::sync::atomic::AtomicUsize;

    fn counting_task(name: &str, schedule: impl Schedule, runs: &Arc<AtomicUsize>) -> Task {
        let runs = runs.clone();
        Task::new(name, schedule, move |_ctx| {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    fn fire(list: &TaskList, at: DateTime<Utc>) -> Option<Fired> {
        match list.check(at) {
            Due::Fire(fired) => Some(fired),
            Due::Idle | Due::Sleep(_) => None,
        }
    }

    #[tokio::test]
    async fn task_runs_twice_then_disappears() {
        let ctx = context(Registry::builder(), Arc::default());
        let list = TaskList::new(Duration::from_secs(5));
        let runs = Arc::new(AtomicUsize::new(0));

        let mut calls = 0;
        let schedule = from_fn(move |now| {
            calls += 1;
            (calls <= 2).then(|| now + TimeDelta::milliseconds(10))
        });
        assert!(list.add(counting_task("twice", schedule, &runs)));

        let later = Utc::now() + TimeDelta::seconds(1);
        for _ in 0..3 {
            if let Some(fired) = fire(&list, later) {
                fired.run(ctx.clone()).await;
            }
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(list.is_empty());
        assert!(matches!(list.check(later), Due::Idle));
    }

    #[tokio::test]
    async fn late_task_fires_once() {
        let list = TaskList::new(Duration::from_secs(5));
        let runs = Arc::new(AtomicUsize::new(0));

        let mut first = true;
        let schedule = from_fn(move |now| {
            let next = if first {
                now - TimeDelta::minutes(3)
            } else {
                now + TimeDelta::minutes(1)
            };
            first = false;
            Some(next)
        });
        list.add(counting_task("late", schedule, &runs));

        let now = Utc::now();
        assert!(fire(&list, now).is_some());
        assert!(matches!(list.check(now), Due::Sleep(_)));
        assert!(matches!(list.check(now), Due::Sleep(_)));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn list_stays_sorted() {
        let list = TaskList::new(Duration::from_secs(5));
        let runs = Arc::new(AtomicUsize::new(0));
        list.add(counting_task("hourly", Interval(Duration::from_secs(3600)), &runs));
        list.add(counting_task("minutely", Interval(Duration::from_secs(60)), &runs));
        list.add(counting_task("daily", Interval(Duration::from_secs(86_400)), &runs));

        let names: Vec<_> = list.schedule().into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["minutely", "hourly", "daily"]);

        // two hours on, the minutely task is rescheduled after the hourly one
        let fired = fire(&list, Utc::now() + TimeDelta::hours(2)).unwrap();
        assert_eq!(fired.name(), "minutely");
        let names: Vec<_> = list.schedule().into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["hourly", "minutely", "daily"]);
    }

    #[test]
    fn failing_schedule_is_retried() {
        let list = TaskList::new(Duration::from_secs(5));
        let runs = Arc::new(AtomicUsize::new(0));
        let schedule = try_from_fn(|_now| Err(ScheduleError::new("backend down")));
        assert!(list.add(counting_task("flaky", schedule, &runs)));

        let (_, next) = list.schedule()[0].clone();
        let wait = next - Utc::now();
        assert!(wait > TimeDelta::seconds(3) && wait <= TimeDelta::seconds(5));

        let fired = fire(&list, next).unwrap();
        assert_eq!(fired.name(), "flaky");
        let (_, again) = list.schedule()[0].clone();
        assert_eq!(again, next + TimeDelta::seconds(5));
    }

    #[test]
    fn task_without_run_time_is_not_added() {
        let list = TaskList::new(Duration::from_secs(5));
        let runs = Arc::new(AtomicUsize::new(0));
        assert!(!list.add(counting_task("never", Limited::new(Interval(Duration::from_secs(1)), 0), &runs)));
        assert!(list.is_empty());
    }

    #[test]
    fn limited_counts_runs() {
        let mut schedule = Limited::new(Interval(Duration::from_secs(1)), 2);
        let now = Utc::now();
        assert!(schedule.next_after(now).unwrap().is_some());
        assert!(schedule.next_after(now).unwrap().is_some());
        assert!(schedule.next_after(now).unwrap().is_none());
    }

    #[test]
    fn cron_schedule() {
        let mut cron: CronExpr = "0 * * * *".parse().unwrap();
        let now = "2026-03-01T10:15:00Z".parse::<DateTime<Utc>>().unwrap();
        let next = Schedule::next_after(&mut cron, now).unwrap().unwrap();
        assert_eq!(next.to_rfc3339(), "2026-03-01T11:00:00+00:00");
    }

    #[tokio::test]
    async fn failing_task_body_is_contained() {
        let ctx = context(Registry::builder(), Arc::default());
        async fn broken(_ctx: Context) -> Result<(), DispatchError> {
            panic!("task bug")
        }
        let task = Task::new("broken", Interval(Duration::from_secs(60)), broken);
        let fired = Fired {
            name: task.name().to_string(),
            body: task.body.clone(),
        };
        fired.run(ctx).await;
    }

    #[tokio::test]
    async fn governing_loop_runs_tasks_until_stopped() {
        let ctx = context(Registry::builder(), Arc::default());
        let runs = Arc::new(AtomicUsize::new(0));
        ctx.tasks().add(counting_task(
            "fast",
            Limited::new(Interval(Duration::from_millis(5)), 3),
            &runs,
        ));

        let loop_ctx = ctx.clone();
        let handle = tokio::spawn(async move {
            loop_ctx
                .tasks()
                .run(&loop_ctx, Duration::from_millis(10), Duration::from_millis(10))
                .await;
        });

        for _ in 0..100 {
            if runs.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert!(ctx.tasks().is_empty());

        ctx.tasks().stop();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(ctx.tasks().is_stopped());
    }
}

//! Bounded worker pool shared by commands, background calls and tasks.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::DispatchError;

/// What a pool job is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Command,
    Background,
    Task,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Command => "command",
            Self::Background => "background",
            Self::Task => "task",
        })
    }
}

/// A job submitted to the pool and not yet finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: u64,
    pub kind: JobKind,
    /// Call signature or task name.
    pub label: String,
    pub submitted: DateTime<Utc>,
}

struct PoolInner {
    permits: Arc<Semaphore>,
    size: usize,
    jobs: Mutex<BTreeMap<u64, Job>>,
    next_id: AtomicU64,
}

impl PoolInner {
    fn jobs(&self) -> MutexGuard<'_, BTreeMap<u64, Job>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Runs at most `size` jobs at once and remembers which are pending.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

// removes the job entry even when the task is aborted or panics
struct JobGuard {
    inner: Arc<PoolInner>,
    id: u64,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.inner.jobs().remove(&self.id);
    }
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(size)),
                size,
                jobs: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Queues `job`. It starts once a worker slot is free.
    pub fn spawn<F>(&self, kind: JobKind, label: impl Into<String>, job: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let label = label.into();
        trace!(id, %kind, job = %label, "Queueing job");
        self.inner.jobs().insert(
            id,
            Job {
                id,
                kind,
                label,
                submitted: Utc::now(),
            },
        );

        let guard = JobGuard {
            inner: self.inner.clone(),
            id,
        };
        let permits = self.inner.permits.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            job.await;
        })
    }

    /// Pending and running jobs, oldest first.
    pub fn jobs(&self) -> Vec<Job> {
        self.inner.jobs().values().cloned().collect()
    }

    /// Jobs of one kind, oldest first.
    pub fn jobs_of(&self, kind: JobKind) -> Vec<Job> {
        self.inner
            .jobs()
            .values()
            .filter(|job| job.kind == kind)
            .cloned()
            .collect()
    }

    pub fn active(&self) -> usize {
        self.inner.jobs().len()
    }

    /// Number of jobs currently holding a worker slot.
    pub fn busy(&self) -> usize {
        self.inner.size - self.inner.permits.available_permits()
    }
}

/// Awaits `body`, turning a panic into [`DispatchError::Panic`].
pub(crate) async fn guarded<T, F>(body: F) -> Result<T, DispatchError>
where
    F: Future<Output = Result<T, DispatchError>>,
{
    AssertUnwindSafe(body)
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(DispatchError::from_panic(payload)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let running = running.clone();
                let peak = peak.clone();
                pool.spawn(JobKind::Command, format!("job{i}"), async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(pool.active(), 0);
    }

    #[tokio::test]
    async fn tracks_pending_jobs() {
        let pool = WorkerPool::new(1);
        let (release, wait) = oneshot::channel::<()>();
        let first = pool.spawn(JobKind::Task, "backup", async move {
            let _ = wait.await;
        });
        let second = pool.spawn(JobKind::Command, "ping()", async {});

        let jobs = pool.jobs();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].label, "backup");
        assert_eq!(pool.jobs_of(JobKind::Command).len(), 1);

        release.send(()).unwrap();
        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.busy(), 0);
    }

    #[tokio::test]
    async fn panicking_job_is_forgotten() {
        let pool = WorkerPool::new(1);
        let handle = pool.spawn(JobKind::Background, "boom", async {
            panic!("boom");
        });
        assert!(handle.await.is_err());
        assert_eq!(pool.active(), 0);
    }

    #[tokio::test]
    async fn guarded_catches_panics() {
        let ok: Result<u8, DispatchError> = guarded(async { Ok(1) }).await;
        assert_eq!(ok.unwrap(), 1);

        async fn kaput() -> Result<u8, DispatchError> {
            panic!("kaput")
        }
        let err = guarded(kaput()).await;
        assert!(matches!(err, Err(DispatchError::Panic(m)) if m == "kaput"));
    }
}

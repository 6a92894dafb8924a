//! Long-lived worker coroutine
//!
//! A worker owns an unbounded job channel and a local compio task that
//! drains it. After each job it records when it was last active and, if it
//! belongs to a pool, hands itself back through [`WorkerPool::recycle`].

use super::task::{Job, Task};
use super::{PoolInner, WorkerPool};
use crate::error::{Error, Result};
use futures::channel::mpsc;
use futures::StreamExt;
use std::cell::Cell;
use std::rc::{Rc, Weak};
use std::time::Instant;
use tracing::{debug, trace};

/// Pool-unique worker identifier
pub type WorkerId = u64;

struct WorkerShared {
    running: Cell<bool>,
    active_at: Cell<Instant>,
}

/// Handle to a worker coroutine
#[derive(Clone)]
pub struct Worker {
    id: WorkerId,
    shared: Rc<WorkerShared>,
    jobs: mpsc::UnboundedSender<Job>,
}

impl Worker {
    /// Start a worker that belongs to no pool
    #[must_use]
    pub fn new() -> Self {
        Self::spawn(0, None)
    }

    /// Start the worker loop; `pool` receives the worker after every job
    pub(crate) fn spawn(id: WorkerId, pool: Option<Weak<PoolInner>>) -> Self {
        let (jobs, mut inbox) = mpsc::unbounded::<Job>();
        let shared = Rc::new(WorkerShared {
            running: Cell::new(true),
            active_at: Cell::new(Instant::now()),
        });

        let state = shared.clone();
        compio::runtime::spawn(async move {
            while let Some(job) = inbox.next().await {
                job().await;
                state.active_at.set(Instant::now());
                trace!(worker = id, "job finished");

                if let Some(pool) = &pool {
                    match pool.upgrade() {
                        Some(inner) => WorkerPool { inner }.recycle(id),
                        None => break,
                    }
                }
            }
            state.running.set(false);
            debug!(worker = id, "worker exited");
        })
        .detach();

        Self { id, shared, jobs }
    }

    /// Identifier within the owning pool
    #[must_use]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Whether the worker still accepts jobs
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.get() && !self.jobs.is_closed()
    }

    /// When the worker last finished a job (or started)
    #[must_use]
    pub fn active_at(&self) -> Instant {
        self.shared.active_at.get()
    }

    /// Override the last-active timestamp
    pub fn touch(&self, at: Instant) {
        self.shared.active_at.set(at);
    }

    /// Queue `task`; waits for and returns its result when it is sync
    ///
    /// # Errors
    ///
    /// - [`Error::WorkerStopped`] if the worker was stopped
    /// - [`Error::TaskFailed`] if a sync task failed
    pub async fn submit<T: 'static>(&self, task: &Task<T>) -> Result<Option<T>> {
        self.send(task.job())?;
        if task.is_sync() {
            return task.wait_result().await.map(Some);
        }
        Ok(None)
    }

    /// Close the job channel; queued jobs still run, the loop then exits
    pub fn stop(&self) {
        self.shared.running.set(false);
        self.jobs.close_channel();
    }

    /// Whether both handles drive the same coroutine
    pub(crate) fn same_as(&self, other: &Worker) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
    }

    fn send(&self, job: Job) -> Result<()> {
        if !self.is_running() {
            return Err(Error::WorkerStopped);
        }
        self.jobs
            .unbounded_send(job)
            .map_err(|_| Error::WorkerStopped)
    }
}

impl Default for Worker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::time::Duration;

    #[compio::test]
    async fn test_worker_run() {
        let worker = Worker::new();
        assert!(worker.is_running());
        worker.stop();
        assert!(!worker.is_running());
    }

    #[compio::test]
    async fn test_worker_submit_sync() {
        let worker = Worker::new();
        let result = worker
            .submit(&Task::new(|| async { Ok("test") }, true))
            .await
            .unwrap();
        assert_eq!(result, Some("test"));
        worker.stop();
    }

    #[compio::test]
    async fn test_worker_submit_async_returns_none() {
        let worker = Worker::new();
        let task = Task::new(|| async { Ok(3) }, false);
        assert_eq!(worker.submit(&task).await.unwrap(), None);
        assert_eq!(task.wait_result().await.unwrap(), 3);
        worker.stop();
    }

    #[compio::test]
    async fn test_worker_active_at() {
        let worker = Worker::new();
        let at = Instant::now() - Duration::from_millis(50);
        worker.touch(at);
        assert_eq!(worker.active_at(), at);

        worker
            .submit(&Task::new(|| async { Ok(()) }, true))
            .await
            .unwrap();
        compio::time::sleep(Duration::from_millis(1)).await;
        assert!(worker.active_at() > at);
        worker.stop();
    }

    #[compio::test]
    async fn test_worker_survives_failed_task() {
        let worker = Worker::new();
        let err = worker
            .submit(&Task::<()>::new(|| async { Err(anyhow::anyhow!("bad")) }, true))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TaskFailed { .. }));

        let ok = worker
            .submit(&Task::new(|| async { Ok(1) }, true))
            .await
            .unwrap();
        assert_eq!(ok, Some(1));
        worker.stop();
    }

    #[compio::test]
    async fn test_worker_stop() {
        let worker = Worker::new();
        worker.stop();
        let err = worker
            .submit(&Task::new(|| async { Ok("test") }, false))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WorkerStopped));
        assert_eq!(err.to_string(), "Worker already stopped");
    }
}

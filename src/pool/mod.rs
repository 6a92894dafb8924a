//! Bounded pool of long-lived worker coroutines
//!
//! Workers are spawned on demand up to `capacity` (or all at once with
//! `pre_spawn`) and reused in stack or queue order. When every worker is
//! busy, callers may block in [`WorkerPool::get`] up to `max_blocked` deep;
//! a released worker is handed straight to the longest waiting caller.
//! Free workers are also kept in a min-heap keyed by last activity so that
//! the idle collector can evict the stalest ones first.
//!
//! The pool is single-threaded: workers are `!Send` compio tasks and the
//! pool state lives behind `Rc<RefCell<_>>`. Create one pool per runtime
//! thread.
//!
//! # Example
//!
//! ```rust,no_run
//! use cosync::pool::{PoolConfig, WorkerPool};
//!
//! # async fn example() -> cosync::Result<()> {
//! let pool = WorkerPool::new(PoolConfig::new().with_capacity(4).with_max_blocked(16))?;
//!
//! let answer = pool.submit(|| async { Ok(6 * 7) }, None, true).await?;
//! assert_eq!(answer, Some(42));
//!
//! pool.stop();
//! # Ok(())
//! # }
//! ```

mod config;
mod manager;
mod task;
mod worker;

pub use config::{PoolConfig, PoolType, MAX_BLOCKED, MAX_CAPACITY, MIN_GC_INTERVAL_MS};
pub use manager::WorkerPoolManager;
pub use task::Task;
pub use worker::{Worker, WorkerId};

use crate::error::{Error, Result};
use compio_sync::{wait_for, MinHeap, NodeHandle, Signal, WaitQueue};
use futures::channel::oneshot;
use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Maximum live workers
    pub capacity: usize,
    /// Workers spawned and not yet evicted
    pub live: usize,
    /// Workers waiting for a job
    pub free: usize,
    /// Callers blocked in `get`
    pub blocked: usize,
}

struct Slot {
    worker: Worker,
    /// Position in the free list while the worker is free
    node: Option<NodeHandle>,
}

struct PoolState {
    running: bool,
    next_id: WorkerId,
    live: HashMap<WorkerId, Slot>,
    free: WaitQueue<WorkerId>,
    idle: MinHeap<WorkerId, Instant>,
    requests: WaitQueue<oneshot::Sender<Worker>>,
}

pub(crate) struct PoolInner {
    config: PoolConfig,
    state: RefCell<PoolState>,
    gc_stop: Signal,
}

/// Fixed-capacity pool of worker coroutines
///
/// Cloning is cheap and every clone drives the same workers.
#[derive(Clone)]
pub struct WorkerPool {
    pub(crate) inner: Rc<PoolInner>,
}

impl WorkerPool {
    /// Validate `config` and start the pool
    ///
    /// Must be called inside a compio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` is invalid; nothing is
    /// spawned in that case.
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let pool = Self {
            inner: Rc::new(PoolInner {
                config,
                state: RefCell::new(PoolState {
                    running: true,
                    next_id: 1,
                    live: HashMap::new(),
                    free: WaitQueue::new(),
                    idle: MinHeap::new(),
                    requests: WaitQueue::new(),
                }),
                gc_stop: Signal::new(),
            }),
        };

        if pool.inner.config.pre_spawn {
            let mut state = pool.state_mut();
            for _ in 0..pool.inner.config.capacity {
                let worker = pool.spawn_worker(&mut state);
                pool.insert_free(&mut state, &worker);
            }
        }
        pool.start_collector();

        debug!(
            capacity = pool.inner.config.capacity,
            pool_type = %pool.inner.config.pool_type,
            "worker pool started"
        );
        Ok(pool)
    }

    /// Pool configuration
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Whether [`stop`](Self::stop) has not been called yet
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state().running
    }

    /// Take a worker out of the pool
    ///
    /// Reuses a free worker, else spawns one while below capacity, else
    /// blocks behind earlier callers until a worker is released. The worker
    /// returns to the pool by itself after running a job; call
    /// [`release`](Self::release) to return it unused.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolClosed`] if the pool is or gets stopped
    /// - [`Error::PoolExhausted`] if blocking is disabled or `max_blocked`
    ///   callers are already waiting
    /// - [`Error::WorkerTimeout`] if `timeout` elapsed first
    pub async fn get(&self, timeout: Option<Duration>) -> Result<Worker> {
        let (handle, rx) = {
            let mut state = self.state_mut();
            if !state.running {
                return Err(Error::PoolClosed);
            }
            if let Some(worker) = self.detach(&mut state) {
                return Ok(worker);
            }
            if state.live.len() < self.inner.config.capacity {
                return Ok(self.spawn_worker(&mut state));
            }

            let blocked = state.requests.len();
            match self.inner.config.blocking_limit() {
                Some(limit) if blocked < limit => {}
                _ => {
                    return Err(Error::PoolExhausted {
                        capacity: self.inner.config.capacity,
                        live: state.live.len(),
                        blocked,
                    })
                }
            }

            let (tx, rx) = oneshot::channel();
            let handle = state.requests.push_back(tx);
            trace!(blocked = blocked + 1, "waiting for a worker");
            (handle, rx)
        };

        let mut pending = PendingRequest {
            pool: self,
            handle,
            rx,
            settled: false,
        };
        let start = Instant::now();
        match wait_for(timeout, &mut pending.rx).await {
            Some(Ok(worker)) => {
                pending.settled = true;
                Ok(worker)
            }
            Some(Err(oneshot::Canceled)) => {
                pending.settled = true;
                Err(Error::PoolClosed)
            }
            None => match pending.withdraw() {
                Some(worker) => Ok(worker),
                None => Err(Error::WorkerTimeout {
                    waited: start.elapsed(),
                }),
            },
        }
    }

    /// Return a worker obtained from [`get`](Self::get) without using it
    ///
    /// Workers that no longer belong to the pool are stopped instead. A
    /// stopped worker of this pool gives its slot back.
    pub fn release(&self, worker: Worker) {
        let owned = self
            .state()
            .live
            .get(&worker.id())
            .is_some_and(|slot| slot.worker.same_as(&worker));
        if owned {
            self.recycle(worker.id());
        } else {
            worker.stop();
        }
    }

    /// Run `task` on a pool worker
    ///
    /// Returns the task's result for a sync task and `None` otherwise.
    ///
    /// # Errors
    ///
    /// Errors from [`get`](Self::get), [`Error::WorkerStopped`] if the
    /// worker was stopped underneath us, and [`Error::TaskFailed`] for a
    /// failed sync task.
    pub async fn submit_task<T: 'static>(
        &self,
        task: &Task<T>,
        timeout: Option<Duration>,
    ) -> Result<Option<T>> {
        if !self.is_running() {
            return Err(Error::PoolClosed);
        }
        let worker = self.get(timeout).await?;
        worker.submit(task).await
    }

    /// Wrap `f` in a [`Task`] and run it on a pool worker
    ///
    /// # Errors
    ///
    /// Same as [`submit_task`](Self::submit_task).
    pub async fn submit<F, Fut, T>(
        &self,
        f: F,
        timeout: Option<Duration>,
        sync: bool,
    ) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<T>> + 'static,
        T: 'static,
    {
        self.submit_task(&Task::new(f, sync), timeout).await
    }

    /// Evict free workers idle since before `cutoff`
    ///
    /// Walks the idle heap from the stalest worker and stops at the first
    /// one active at or after `cutoff`. Returns the number evicted.
    pub fn collect(&self, cutoff: Instant) -> usize {
        let mut state = self.state_mut();
        let mut evicted = 0;
        while let Some((id, at)) = state.idle.peek().map(|(id, at)| (id, *at)) {
            if at >= cutoff {
                break;
            }
            state.idle.pop();
            if let Some(slot) = state.live.remove(&id) {
                if let Some(node) = slot.node {
                    state.free.remove(node);
                }
                slot.worker.stop();
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted, live = state.live.len(), "idle workers collected");
        }
        debug_assert!(Self::consistent(&state, &self.inner.config));
        evicted
    }

    /// Stop every worker and fail all blocked callers
    ///
    /// Idempotent.
    pub fn stop(&self) {
        let workers: Vec<Worker> = {
            let mut state = self.state_mut();
            if !state.running {
                return;
            }
            state.running = false;
            state.free.clear();
            state.idle.clear();
            // Dropping the senders wakes blocked callers with `PoolClosed`
            state.requests.clear();
            state.live.drain().map(|(_, slot)| slot.worker).collect()
        };
        for worker in &workers {
            worker.stop();
        }
        self.inner.gc_stop.fire();
        debug!(workers = workers.len(), "worker pool stopped");
    }

    /// Handles to every live worker, busy or free, in spawn order
    #[must_use]
    pub fn workers(&self) -> Vec<Worker> {
        let state = self.state();
        let mut workers: Vec<Worker> = state
            .live
            .values()
            .map(|slot| slot.worker.clone())
            .collect();
        workers.sort_by_key(Worker::id);
        workers
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.state();
        PoolStats {
            capacity: self.inner.config.capacity,
            live: state.live.len(),
            free: state.free.len(),
            blocked: state.requests.len(),
        }
    }

    /// Check the bookkeeping invariants
    ///
    /// The free list and idle heap hold exactly the same workers, every
    /// free worker is live, the live set is within capacity, and nobody is
    /// blocked while a worker is free.
    #[must_use]
    pub fn check_invariants(&self) -> bool {
        Self::consistent(&self.state(), &self.inner.config)
    }

    fn consistent(state: &PoolState, config: &PoolConfig) -> bool {
        let mirrored = state.free.len() == state.idle.len()
            && state.free.iter().all(|id| {
                state.idle.contains(id)
                    && state.live.get(id).is_some_and(|slot| slot.node.is_some())
            });
        let bounded = state.live.len() <= config.capacity;
        let no_idle_while_blocked = state.requests.is_empty() || state.free.is_empty();
        mirrored && bounded && no_idle_while_blocked
    }

    /// Put a live worker back into service
    ///
    /// Called by the worker loop after every job.
    ///
    /// A worker that stopped while out of the pool gives up its slot; a
    /// blocked caller then gets a fresh worker in its place.
    pub(crate) fn recycle(&self, id: WorkerId) {
        let mut state = self.state_mut();
        let Some(worker) = state.live.get(&id).map(|slot| slot.worker.clone()) else {
            return;
        };
        if !state.running {
            return;
        }
        let mut handoff = if worker.is_running() {
            worker
        } else {
            self.retire(&mut state, id);
            if state.requests.is_empty() {
                debug_assert!(Self::consistent(&state, &self.inner.config));
                return;
            }
            self.spawn_worker(&mut state)
        };
        let handoff_id = handoff.id();

        while let Some(tx) = state.requests.pop_front() {
            match tx.send(handoff) {
                Ok(()) => {
                    trace!(worker = handoff_id, "worker handed to blocked caller");
                    return;
                }
                Err(returned) => handoff = returned,
            }
        }

        self.insert_free(&mut state, &handoff);
        debug_assert!(Self::consistent(&state, &self.inner.config));
    }

    /// Forget a stopped worker, wherever the pool still tracks it
    fn retire(&self, state: &mut PoolState, id: WorkerId) {
        if let Some(slot) = state.live.remove(&id) {
            if let Some(node) = slot.node {
                state.free.remove(node);
                state.idle.remove(&id);
            }
            debug!(worker = id, live = state.live.len(), "stopped worker retired");
        }
    }

    fn insert_free(&self, state: &mut PoolState, worker: &Worker) {
        let id = worker.id();
        if state.live.get(&id).is_some_and(|slot| slot.node.is_some()) {
            return;
        }
        if state.free.len() >= self.inner.config.capacity {
            warn!(
                worker = id,
                capacity = self.inner.config.capacity,
                "Pool capacity exceeded, stopping worker"
            );
            state.live.remove(&id);
            worker.stop();
            return;
        }
        let node = state.free.push_back(id);
        state.idle.insert(id, worker.active_at());
        if let Some(slot) = state.live.get_mut(&id) {
            slot.node = Some(node);
        }
    }

    fn detach(&self, state: &mut PoolState) -> Option<Worker> {
        loop {
            let id = match self.inner.config.pool_type {
                PoolType::Stack => state.free.pop_back(),
                PoolType::Queue => state.free.pop_front(),
            }?;
            state.idle.remove(&id);
            let Some(slot) = state.live.get_mut(&id) else {
                continue;
            };
            slot.node = None;
            if slot.worker.is_running() {
                return Some(slot.worker.clone());
            }
            state.live.remove(&id);
        }
    }

    fn spawn_worker(&self, state: &mut PoolState) -> Worker {
        let id = state.next_id;
        state.next_id += 1;
        let worker = Worker::spawn(id, Some(Rc::downgrade(&self.inner)));
        state.live.insert(
            id,
            Slot {
                worker: worker.clone(),
                node: None,
            },
        );
        trace!(worker = id, live = state.live.len(), "worker spawned");
        worker
    }

    fn start_collector(&self) {
        let Some(interval) = self.inner.config.gc_interval() else {
            return;
        };
        let pool = Rc::downgrade(&self.inner);
        let stopped = self.inner.gc_stop.listen();
        compio::runtime::spawn(async move {
            loop {
                if compio::time::timeout(interval, stopped.clone()).await.is_ok() {
                    break;
                }
                let Some(inner) = pool.upgrade() else {
                    break;
                };
                if let Some(cutoff) = Instant::now().checked_sub(interval) {
                    WorkerPool { inner }.collect(cutoff);
                }
            }
            trace!("idle collector exited");
        })
        .detach();
    }

    fn state(&self) -> Ref<'_, PoolState> {
        self.inner.state.borrow()
    }

    fn state_mut(&self) -> RefMut<'_, PoolState> {
        self.inner.state.borrow_mut()
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A blocked `get` that withdraws itself when abandoned
struct PendingRequest<'a> {
    pool: &'a WorkerPool,
    handle: NodeHandle,
    rx: oneshot::Receiver<Worker>,
    settled: bool,
}

impl PendingRequest<'_> {
    /// Leave the request queue; returns a worker handed over meanwhile
    fn withdraw(&mut self) -> Option<Worker> {
        self.settled = true;
        let removed = self
            .pool
            .state_mut()
            .requests
            .remove(self.handle)
            .is_some();
        if removed {
            return None;
        }
        self.rx.try_recv().ok().flatten()
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(worker) = self.withdraw() {
            self.pool.release(worker);
        }
    }
}

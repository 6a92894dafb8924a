//! Unit of work executed by a pool worker

use crate::error::{share_error, Error, Result};
use compio_sync::Signal;
use futures::future::{FutureExt, LocalBoxFuture};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use tracing::warn;

/// Type-erased job consumed by a worker loop
pub(crate) type Job = Box<dyn FnOnce() -> LocalBoxFuture<'static, ()>>;

type Work<T> = Box<dyn FnOnce() -> LocalBoxFuture<'static, anyhow::Result<T>>>;

struct TaskInner<T> {
    work: RefCell<Option<Work<T>>>,
    sync: bool,
    result: RefCell<Option<Result<T>>>,
    done: Cell<bool>,
    taken: Cell<bool>,
    finished: Signal,
}

/// A closure plus the slot its outcome lands in
///
/// Cloning shares the same task; the result can be taken once.
pub struct Task<T> {
    inner: Rc<TaskInner<T>>,
}

impl<T: 'static> Task<T> {
    /// Wrap `f`; a `sync` task makes the submitter wait for its result
    pub fn new<F, Fut>(f: F, sync: bool) -> Self
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<T>> + 'static,
    {
        let work: Work<T> = Box::new(move || f().boxed_local());
        Self {
            inner: Rc::new(TaskInner {
                work: RefCell::new(Some(work)),
                sync,
                result: RefCell::new(None),
                done: Cell::new(false),
                taken: Cell::new(false),
                finished: Signal::new(),
            }),
        }
    }

    /// Whether the submitter waits for the result
    #[must_use]
    pub fn is_sync(&self) -> bool {
        self.inner.sync
    }

    /// Whether a result has been recorded
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner.done.get()
    }

    /// Record the outcome; only the first call has any effect
    ///
    /// Returns `false` if a result was already recorded.
    pub fn set_result(&self, result: Result<T>) -> bool {
        if self.inner.done.replace(true) {
            return false;
        }
        *self.inner.result.borrow_mut() = Some(result);
        self.inner.finished.fire();
        true
    }

    /// Wait for the outcome and take it
    ///
    /// # Errors
    ///
    /// - [`Error::TaskFailed`] if the closure failed or panicked
    /// - [`Error::ResultTaken`] if the result was already taken
    pub async fn wait_result(&self) -> Result<T> {
        if !self.is_done() {
            self.inner.finished.listen().await;
        }
        if self.inner.taken.replace(true) {
            return Err(Error::ResultTaken);
        }
        self.inner
            .result
            .borrow_mut()
            .take()
            .unwrap_or(Err(Error::ResultTaken))
    }

    /// Run the closure and record its outcome
    ///
    /// Errors and panics are captured into the result.
    pub(crate) async fn execute(&self) {
        let work = self.inner.work.borrow_mut().take();
        let Some(work) = work else {
            return;
        };

        let outcome = match AssertUnwindSafe(async move { work().await })
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome.map_err(|e| Error::TaskFailed {
                source: share_error(e),
            }),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!("task panicked: {}", message);
                Err(Error::TaskFailed {
                    source: share_error(anyhow::anyhow!("task panicked: {message}")),
                })
            }
        };
        self.set_result(outcome);
    }

    /// Job that executes this task on a worker
    pub(crate) fn job(&self) -> Job {
        let task = self.clone();
        Box::new(move || async move { task.execute().await }.boxed_local())
    }
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("sync", &self.inner.sync)
            .field("done", &self.inner.done.get())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

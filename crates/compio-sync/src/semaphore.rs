//! Weighted async semaphore for compio runtime
//!
//! Each acquire asks for a number of tokens out of a fixed capacity. Blocked
//! acquirers are served strictly in arrival order: a later request never
//! overtakes an earlier one, even when it is small enough to fit. This
//! head-of-line policy keeps large requests from starving behind a stream of
//! small ones.
//!
//! # Example
//!
//! ```rust,no_run
//! use compio_sync::WeightedSemaphore;
//! use std::time::Duration;
//!
//! # async fn example() -> compio_sync::Result<()> {
//! let semaphore = WeightedSemaphore::new(10)?;
//!
//! // Take 4 tokens, waiting at most one second for them
//! semaphore.acquire(4, Some(Duration::from_secs(1))).await?;
//! // Do work while holding the tokens
//! // ...
//! semaphore.release(4)?;
//!
//! // Or let a permit hand the tokens back when dropped
//! let permit = semaphore.acquire_permit(2, None).await?;
//! drop(permit);
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, SyncError};
use crate::signal::wait_for;
use crate::wait_queue::{NodeHandle, WaitQueue};
use futures::channel::oneshot;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{error, trace};

/// Semaphore with per-acquire weights and FIFO fairness
///
/// Cloning is cheap and every clone shares the same tokens.
#[derive(Clone)]
pub struct WeightedSemaphore {
    inner: Arc<SemaphoreInner>,
}

struct SemaphoreInner {
    /// Total tokens
    capacity: usize,
    state: Mutex<SemaphoreState>,
}

struct SemaphoreState {
    /// Tokens currently held, `0 <= current <= capacity`
    current: usize,
    /// Blocked acquirers in arrival order
    waiters: WaitQueue<Waiter>,
}

/// A blocked acquire: its request and its private resume signal
struct Waiter {
    tokens: usize,
    ready: oneshot::Sender<()>,
}

impl WeightedSemaphore {
    /// Create a semaphore with `capacity` tokens
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidArgument`] if `capacity` is 0.
    ///
    /// # Example
    ///
    /// ```rust
    /// use compio_sync::WeightedSemaphore;
    ///
    /// let sem = WeightedSemaphore::new(1024).unwrap();
    /// assert_eq!(sem.available(), 1024);
    /// ```
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(SyncError::InvalidArgument(
                "Semaphore must have at least one token".to_string(),
            ));
        }
        Ok(Self {
            inner: Arc::new(SemaphoreInner {
                capacity,
                state: Mutex::new(SemaphoreState {
                    current: 0,
                    waiters: WaitQueue::new(),
                }),
            }),
        })
    }

    /// Acquire `tokens`, waiting behind earlier requests if needed
    ///
    /// The request is granted once it reaches the head of the queue and
    /// enough tokens are free. Tokens are debited by the releaser before this
    /// call resumes, so nothing can slip in between.
    ///
    /// Dropping the returned future before it completes withdraws the
    /// request; tokens granted to it in the meantime are handed back.
    ///
    /// # Errors
    ///
    /// - [`SyncError::InvalidArgument`] if `tokens` is 0 or exceeds capacity
    /// - [`SyncError::SemaphoreTimeout`] if `timeout` elapsed first
    pub async fn acquire(&self, tokens: usize, timeout: Option<Duration>) -> Result<()> {
        self.validate(tokens)?;

        let (handle, rx) = {
            let mut state = self.inner.lock();
            if self.inner.capacity - state.current >= tokens && state.waiters.is_empty() {
                state.current += tokens;
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            let handle = state.waiters.push_back(Waiter { tokens, ready: tx });
            trace!(
                tokens,
                queued = state.waiters.len(),
                "semaphore acquire queued"
            );
            (handle, rx)
        };

        let mut pending = PendingAcquire {
            inner: &self.inner,
            handle,
            tokens,
            rx,
            settled: false,
        };
        let start = Instant::now();
        if let Some(Ok(())) = wait_for(timeout, &mut pending.rx).await {
            pending.settled = true;
            return Ok(());
        }

        if pending.withdraw() {
            // Granted in the same tick the timer fired
            return Ok(());
        }
        trace!(tokens, "semaphore acquire timed out");
        Err(SyncError::SemaphoreTimeout {
            waited: start.elapsed(),
            tokens,
            held: self.held(),
            capacity: self.inner.capacity,
        })
    }

    /// Acquire `tokens` and wrap them in a permit that releases on drop
    ///
    /// # Errors
    ///
    /// Same as [`acquire`](Self::acquire).
    pub async fn acquire_permit(
        &self,
        tokens: usize,
        timeout: Option<Duration>,
    ) -> Result<SemaphorePermit> {
        self.acquire(tokens, timeout).await?;
        Ok(SemaphorePermit {
            semaphore: self.clone(),
            tokens,
        })
    }

    /// Take `tokens` only if that needs no waiting
    ///
    /// Fails when anyone is already queued, even if the tokens are free, so
    /// that a non-blocking caller never jumps the queue.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidArgument`] if `tokens` is 0 or exceeds
    /// capacity.
    ///
    /// # Example
    ///
    /// ```rust
    /// use compio_sync::WeightedSemaphore;
    ///
    /// let sem = WeightedSemaphore::new(2).unwrap();
    /// assert!(sem.try_acquire(2).unwrap());
    /// assert!(!sem.try_acquire(1).unwrap());
    /// ```
    pub fn try_acquire(&self, tokens: usize) -> Result<bool> {
        self.validate(tokens)?;
        let mut state = self.inner.lock();
        if self.inner.capacity - state.current >= tokens && state.waiters.is_empty() {
            state.current += tokens;
            return Ok(true);
        }
        Ok(false)
    }

    /// Non-blocking variant of [`acquire_permit`](Self::acquire_permit)
    ///
    /// # Errors
    ///
    /// Same as [`try_acquire`](Self::try_acquire).
    pub fn try_acquire_permit(&self, tokens: usize) -> Result<Option<SemaphorePermit>> {
        Ok(self.try_acquire(tokens)?.then(|| SemaphorePermit {
            semaphore: self.clone(),
            tokens,
        }))
    }

    /// Return `tokens` and grant queued waiters in arrival order
    ///
    /// Granting stops at the first waiter whose request does not fit.
    ///
    /// # Errors
    ///
    /// - [`SyncError::InvalidArgument`] if `tokens` is 0 or exceeds capacity
    /// - [`SyncError::OverRelease`] if fewer than `tokens` are held; nothing
    ///   is changed in that case
    pub fn release(&self, tokens: usize) -> Result<()> {
        self.validate(tokens)?;
        let mut state = self.inner.lock();
        if tokens > state.current {
            return Err(SyncError::OverRelease {
                tokens,
                held: state.current,
            });
        }
        state.current -= tokens;
        self.inner.notify_waiters(&mut state);
        Ok(())
    }

    /// Total tokens
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Tokens currently held
    #[must_use]
    pub fn held(&self) -> usize {
        self.inner.lock().current
    }

    /// Tokens currently free
    ///
    /// Useful for monitoring; free tokens may still be reserved for the
    /// head of the queue.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.capacity - self.held()
    }

    /// Number of blocked acquirers
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    fn validate(&self, tokens: usize) -> Result<()> {
        if tokens < 1 {
            return Err(SyncError::InvalidArgument(
                "The number of tokens must be greater than or equal to 1".to_string(),
            ));
        }
        if tokens > self.inner.capacity {
            return Err(SyncError::InvalidArgument(format!(
                "The number of tokens requested ({tokens}) exceeds the semaphore size ({})",
                self.inner.capacity
            )));
        }
        Ok(())
    }
}

impl SemaphoreInner {
    fn lock(&self) -> MutexGuard<'_, SemaphoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Grant waiters from the head while their request fits
    fn notify_waiters(&self, state: &mut SemaphoreState) {
        while let Some(front) = state.waiters.front() {
            match state.waiters.get(front) {
                Some(waiter) if self.capacity - state.current >= waiter.tokens => {}
                _ => break,
            }
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            state.current += waiter.tokens;
            if waiter.ready.send(()).is_err() {
                // Acquirer vanished without withdrawing; take the tokens back
                state.current -= waiter.tokens;
            }
        }
    }
}

impl std::fmt::Debug for WeightedSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("WeightedSemaphore")
            .field("capacity", &self.inner.capacity)
            .field("current", &state.current)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// A queued acquire that cleans up after itself
///
/// Withdrawal runs on timeout and, through `Drop`, when the acquire future
/// is cancelled.
struct PendingAcquire<'a> {
    inner: &'a SemaphoreInner,
    handle: NodeHandle,
    tokens: usize,
    rx: oneshot::Receiver<()>,
    settled: bool,
}

impl PendingAcquire<'_> {
    /// Leave the queue; returns `true` if the tokens were granted anyway
    fn withdraw(&mut self) -> bool {
        self.settled = true;
        let mut state = self.inner.lock();
        let was_head = state.waiters.front() == Some(self.handle);
        if state.waiters.remove(self.handle).is_some() {
            // A departing head may have been blocking requests that now fit
            if was_head {
                self.inner.notify_waiters(&mut state);
            }
            return false;
        }
        matches!(self.rx.try_recv(), Ok(Some(())))
    }
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if self.withdraw() {
            let mut state = self.inner.lock();
            state.current -= self.tokens;
            self.inner.notify_waiters(&mut state);
        }
    }
}

/// RAII guard that returns its tokens on drop
///
/// Returned by [`WeightedSemaphore::acquire_permit`] and
/// [`WeightedSemaphore::try_acquire_permit`].
///
/// # Example
///
/// ```rust,no_run
/// use compio_sync::WeightedSemaphore;
///
/// # async fn example() {
/// let sem = WeightedSemaphore::new(10).unwrap();
///
/// {
///     let permit = sem.acquire_permit(3, None).await.unwrap();
///     assert_eq!(permit.tokens(), 3);
/// } // Tokens released automatically when scope ends
///
/// assert_eq!(sem.available(), 10);
/// # }
/// ```
pub struct SemaphorePermit {
    semaphore: WeightedSemaphore,
    tokens: usize,
}

impl SemaphorePermit {
    /// Tokens held by this permit
    #[must_use]
    pub fn tokens(&self) -> usize {
        self.tokens
    }
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        if let Err(e) = self.semaphore.release(self.tokens) {
            error!("Failed to return permit tokens: {}", e);
        }
    }
}

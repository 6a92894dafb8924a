//! Single-round counting barrier
//!
//! A [`CounterBarrier`] releases exactly `parties` callers at once. Once the
//! last party arrives the barrier is *broken*: every blocked caller resumes
//! together and the instance cannot be awaited again. Repeated rounds under
//! one name are handled by a registry that swaps in a fresh barrier.
//!
//! # Example
//!
//! ```rust,no_run
//! use compio_sync::CounterBarrier;
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let barrier = Arc::new(CounterBarrier::new(3).unwrap());
//! for _ in 0..3 {
//!     let barrier = barrier.clone();
//!     compio::runtime::spawn(async move {
//!         barrier.wait(None).await.unwrap();
//!     })
//!     .detach();
//! }
//! # }
//! ```

use crate::error::{Result, SyncError};
use crate::signal::{wait_for, Signal};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct BarrierState {
    waiters: usize,
    broken: bool,
}

/// One-shot rendezvous for a fixed number of parties
pub struct CounterBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    release: Signal,
}

impl CounterBarrier {
    /// Create a barrier for `parties` callers
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidArgument`] if `parties` is 0.
    pub fn new(parties: usize) -> Result<Self> {
        if parties < 1 {
            return Err(SyncError::InvalidArgument(
                "CounterBarrier parties must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            parties,
            state: Mutex::new(BarrierState::default()),
            release: Signal::new(),
        })
    }

    /// Block until `parties` callers have arrived, or `timeout` elapses
    ///
    /// A timed out caller leaves the round; the remaining waiters are not
    /// affected and still need `parties` arrivals in total.
    ///
    /// # Errors
    ///
    /// - [`SyncError::BarrierBroken`] if this round already released
    /// - [`SyncError::BarrierTimeout`] if `timeout` elapsed first
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        {
            let mut state = self.lock();
            if state.broken {
                return Err(SyncError::BarrierBroken {
                    parties: self.parties,
                });
            }
            state.waiters += 1;
            trace!(waiters = state.waiters, parties = self.parties, "barrier arrival");
            if state.waiters == self.parties {
                state.broken = true;
                self.release.fire();
                debug!(parties = self.parties, "barrier released");
            }
        }

        let arrival = Arrival { barrier: self };
        let start = Instant::now();
        let released = wait_for(timeout, self.release.listen()).await.is_some();
        drop(arrival);

        let state = self.lock();
        // A release that raced the timer still counts as released
        if released || state.broken {
            return Ok(());
        }
        Err(SyncError::BarrierTimeout {
            waited: start.elapsed(),
            waiters: state.waiters,
            parties: self.parties,
        })
    }

    /// Parties needed to release the round
    #[must_use]
    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Callers currently inside [`wait`](Self::wait)
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.lock().waiters
    }

    /// Whether the round has released
    #[must_use]
    pub fn broken(&self) -> bool {
        self.lock().broken
    }

    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A counted party; leaves the round when dropped
///
/// Dropping the `wait` future before release withdraws the arrival so the
/// round still needs `parties` live callers.
struct Arrival<'a> {
    barrier: &'a CounterBarrier,
}

impl Drop for Arrival<'_> {
    fn drop(&mut self) {
        let mut state = self.barrier.lock();
        state.waiters -= 1;
        if !state.broken {
            trace!(waiters = state.waiters, "barrier arrival withdrawn");
        }
    }
}

impl std::fmt::Debug for CounterBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("CounterBarrier")
            .field("parties", &self.parties)
            .field("waiters", &state.waiters)
            .field("broken", &state.broken)
            .finish()
    }
}

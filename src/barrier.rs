//! Keyed barrier rounds
//!
//! [`BarrierRegistry`] maps a batch key, the logical key plus its party
//! count, to the barrier currently accepting arrivals. A barrier only ever
//! serves one round; once it is broken the registry swaps in a fresh one so
//! the same key can be used back to back. Released barriers are tracked
//! weakly and the entry disappears as soon as no round for it is alive.

use crate::error::{Error, Result, SyncError};
use compio_sync::{CounterBarrier, Result as SyncResult};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, trace};

type BatchKey = (String, usize);

struct Rounds {
    /// Barrier accepting new arrivals
    current: Arc<CounterBarrier>,
    /// Earlier rounds that may still be draining
    retired: Vec<Weak<CounterBarrier>>,
}

/// Registry of reusable, keyed barrier rounds
///
/// # Example
///
/// ```rust,no_run
/// use cosync::BarrierRegistry;
/// use std::rc::Rc;
///
/// # async fn example() {
/// let registry = Rc::new(BarrierRegistry::new());
/// for i in 0..4 {
///     let registry = registry.clone();
///     compio::runtime::spawn(async move {
///         // Pairs of callers are released together
///         registry.wait("ingest", 2, None).await.unwrap();
///         println!("released {i}");
///     })
///     .detach();
/// }
/// # }
/// ```
#[derive(Default)]
pub struct BarrierRegistry {
    rounds: Mutex<HashMap<BatchKey, Rounds>>,
}

impl BarrierRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the current round for `(key, parties)` and wait for it to fill
    ///
    /// Dropping the future before release withdraws this caller from the
    /// round.
    ///
    /// # Errors
    ///
    /// [`Error::Barrier`] naming the key, wrapping
    /// - [`SyncError::InvalidArgument`] if `parties <= 1`, before any state
    ///   is touched
    /// - [`SyncError::BarrierTimeout`] if `timeout` elapsed first; the round
    ///   keeps going for the other callers
    pub async fn wait(&self, key: &str, parties: usize, timeout: Option<Duration>) -> Result<()> {
        let tag = |source| Error::Barrier {
            key: key.to_owned(),
            parties,
            source,
        };
        let round = Round {
            registry: self,
            key,
            parties,
            barrier: Some(self.join(key, parties).map_err(tag)?),
        };
        let outcome = round.wait(timeout).await;
        drop(round);

        if let Err(e) = &outcome {
            debug!(key, parties, "barrier wait failed: {}", e);
        }
        outcome.map_err(tag)
    }

    /// Wait for the round, then run `f`
    ///
    /// # Errors
    ///
    /// Same as [`wait`](Self::wait); `f` is not run on error.
    pub async fn counter_call<F, Fut, T>(
        &self,
        key: &str,
        parties: usize,
        timeout: Option<Duration>,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.wait(key, parties, timeout).await?;
        Ok(f().await)
    }

    /// Number of batch keys with a live round
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no round is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Batch keys with a live round
    #[must_use]
    pub fn keys(&self) -> Vec<(String, usize)> {
        self.lock().keys().cloned().collect()
    }

    /// Resolve the barrier accepting arrivals, replacing a released one
    fn join(&self, key: &str, parties: usize) -> SyncResult<Arc<CounterBarrier>> {
        if parties <= 1 {
            return Err(SyncError::InvalidArgument(format!(
                "Parties must be greater than 1, got: {parties}"
            )));
        }

        let mut rounds = self.lock();
        let batch = (key.to_owned(), parties);
        if let Some(entry) = rounds.get_mut(&batch) {
            let current = &entry.current;
            if current.broken() || current.waiters() == parties {
                let fresh = Arc::new(CounterBarrier::new(parties)?);
                let released = std::mem::replace(&mut entry.current, fresh);
                entry.retired.retain(|round| round.strong_count() > 0);
                entry.retired.push(Arc::downgrade(&released));
                trace!(key, parties, "barrier round recycled");
            }
            return Ok(entry.current.clone());
        }

        let barrier = Arc::new(CounterBarrier::new(parties)?);
        rounds.insert(
            batch,
            Rounds {
                current: barrier.clone(),
                retired: Vec::new(),
            },
        );
        trace!(key, parties, "barrier round created");
        Ok(barrier)
    }

    /// Drop the entry once no caller holds any of its rounds
    fn sweep(&self, key: &str, parties: usize) {
        let mut rounds = self.lock();
        let batch = (key.to_owned(), parties);
        let drained = match rounds.get_mut(&batch) {
            Some(entry) => {
                entry.retired.retain(|round| round.strong_count() > 0);
                entry.retired.is_empty() && Arc::strong_count(&entry.current) == 1
            }
            None => false,
        };
        if drained {
            rounds.remove(&batch);
            trace!(key, parties, "barrier entry removed");
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<BatchKey, Rounds>> {
        self.rounds.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One caller's hold on a round; sweeps the entry when dropped
///
/// Dropping also covers a cancelled `wait`, so an abandoned round does not
/// pin its entry.
struct Round<'a> {
    registry: &'a BarrierRegistry,
    key: &'a str,
    parties: usize,
    barrier: Option<Arc<CounterBarrier>>,
}

impl Round<'_> {
    async fn wait(&self, timeout: Option<Duration>) -> SyncResult<()> {
        match &self.barrier {
            Some(barrier) => barrier.wait(timeout).await,
            None => Ok(()),
        }
    }
}

impl Drop for Round<'_> {
    fn drop(&mut self) {
        // Our reference must be gone before the entry can look drained
        self.barrier = None;
        self.registry.sweep(self.key, self.parties);
    }
}

impl std::fmt::Debug for BarrierRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarrierRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}

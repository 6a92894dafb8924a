//! Single-flight call deduplication
//!
//! Concurrent calls that share a flight key are collapsed into one
//! execution. The first caller becomes the leader and runs the closure;
//! everybody else arriving while it runs waits for the leader's outcome,
//! value or error, and receives a clone of it.
//!
//! A flight can be *forgotten*: the key is evicted so the next call starts a
//! fresh execution, and callers still waiting on the old flight are woken.
//! [`SingleFlightGroup::run`] transparently moves those callers onto the
//! next flight, while [`Caller::wait`] reports [`Error::Forgotten`].
//!
//! # Example
//!
//! ```rust,no_run
//! use cosync::SingleFlightGroup;
//! use std::rc::Rc;
//!
//! # async fn example() {
//! let group: Rc<SingleFlightGroup<String>> = Rc::new(SingleFlightGroup::new());
//! for _ in 0..100 {
//!     let group = group.clone();
//!     compio::runtime::spawn(async move {
//!         // Only one of the hundred calls reaches the backend
//!         let profile = group
//!             .run("user:42", || async { Ok("Ada".to_string()) }, None)
//!             .await
//!             .unwrap();
//!         assert_eq!(profile, "Ada");
//!     })
//!     .detach();
//! }
//! # }
//! ```

use crate::error::{share_error, Error, Result};
use compio_sync::{wait_for, Signal};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

struct CallerState<T> {
    outcome: Option<Result<T>>,
    forgotten: bool,
    waiters: usize,
}

/// One in-flight execution and the callers waiting on it
pub struct Caller<T> {
    key: String,
    state: Mutex<CallerState<T>>,
    finished: Signal,
}

impl<T: Clone> Caller<T> {
    /// Create a pending flight for `key`
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            state: Mutex::new(CallerState {
                outcome: None,
                forgotten: false,
                waiters: 0,
            }),
            finished: Signal::new(),
        }
    }

    /// Flight key
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Run `f` and publish its outcome to every waiter
    ///
    /// Only the first call executes anything; later calls return the
    /// recorded outcome. If `f` panics or this future is dropped before `f`
    /// completes, the flight is forgotten so waiters are not left hanging.
    ///
    /// # Errors
    ///
    /// [`Error::SharedExecution`] wrapping the error returned by `f`.
    pub async fn share<F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if let Some(outcome) = &self.lock().outcome {
            return outcome.clone();
        }

        let mut abandoned = Abandoned {
            caller: self,
            armed: true,
        };
        let outcome = f().await.map_err(|e| Error::SharedExecution {
            key: self.key.clone(),
            source: share_error(e),
        });
        abandoned.armed = false;
        self.complete(outcome)
    }

    /// Wait for the shared outcome
    ///
    /// Returns immediately once the flight is done. A timeout only affects
    /// this waiter.
    ///
    /// # Errors
    ///
    /// - [`Error::SharedExecution`] if the executor failed
    /// - [`Error::FlightTimeout`] if `timeout` elapsed first
    /// - [`Error::Forgotten`] if the flight was forgotten before it finished
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<T> {
        {
            let mut state = self.lock();
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            if state.forgotten {
                return Err(self.forgotten());
            }
            state.waiters += 1;
        }

        let waiting = Waiting { caller: self };
        let start = Instant::now();
        let woken = wait_for(timeout, self.finished.listen()).await.is_some();
        drop(waiting);

        let state = self.lock();
        if let Some(outcome) = &state.outcome {
            return outcome.clone();
        }
        if woken || state.forgotten {
            return Err(self.forgotten());
        }
        Err(Error::FlightTimeout {
            key: self.key.clone(),
            waited: start.elapsed(),
        })
    }

    /// Wake current waiters with [`Error::Forgotten`]
    ///
    /// Idempotent. The executor may still finish and record its outcome.
    pub fn forget(&self) {
        let waiters = {
            let mut state = self.lock();
            state.forgotten = true;
            state.waiters
        };
        if self.finished.fire() {
            debug!(key = %self.key, waiters, "flight forgotten");
        }
    }

    /// Callers blocked in [`wait`](Self::wait)
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.lock().waiters
    }

    /// Whether an outcome has been recorded
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.lock().outcome.is_some()
    }

    /// Whether [`forget`](Self::forget) has been called
    #[must_use]
    pub fn is_forgotten(&self) -> bool {
        self.lock().forgotten
    }

    /// Record the first outcome and wake everyone
    fn complete(&self, outcome: Result<T>) -> Result<T> {
        let recorded = {
            let mut state = self.lock();
            state.outcome.get_or_insert(outcome).clone()
        };
        self.finished.fire();
        recorded
    }

    fn forgotten(&self) -> Error {
        Error::Forgotten {
            key: self.key.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CallerState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> std::fmt::Debug for Caller<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Caller").field("key", &self.key).finish()
    }
}

/// Forgets the flight if the executor never got to record an outcome
struct Abandoned<'a, T: Clone> {
    caller: &'a Caller<T>,
    armed: bool,
}

impl<T: Clone> Drop for Abandoned<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.caller.forget();
        }
    }
}

/// Counts a caller blocked in [`Caller::wait`] until it returns or is dropped
struct Waiting<'a, T: Clone> {
    caller: &'a Caller<T>,
}

impl<T: Clone> Drop for Waiting<'_, T> {
    fn drop(&mut self) {
        self.caller.lock().waiters -= 1;
    }
}

/// Deduplicates concurrent calls by key
pub struct SingleFlightGroup<T> {
    flights: Mutex<HashMap<String, Arc<Caller<T>>>>,
}

enum Role<T> {
    Leader(Arc<Caller<T>>),
    Follower(Arc<Caller<T>>),
}

impl<T: Clone> SingleFlightGroup<T> {
    /// Create an empty group
    #[must_use]
    pub fn new() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` once for all concurrent callers of `key`
    ///
    /// The leader is never subject to `timeout`; it always finishes `f`.
    /// Followers wait at most `timeout` in total, and follow the next flight
    /// if theirs is forgotten.
    ///
    /// # Errors
    ///
    /// - [`Error::SharedExecution`] if the leader's `f` failed
    /// - [`Error::FlightTimeout`] if a follower's `timeout` elapsed first
    pub async fn run<F, Fut>(&self, key: &str, f: F, timeout: Option<Duration>) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let deadline = timeout
            .filter(|limit| !limit.is_zero())
            .map(|limit| (Instant::now() + limit, limit));

        loop {
            match self.join(key) {
                Role::Leader(caller) => {
                    trace!(key, "flight started");
                    let _landing = Landing {
                        group: self,
                        caller: &caller,
                    };
                    return caller.share(f).await;
                }
                Role::Follower(caller) => {
                    let remaining = match deadline {
                        Some((at, limit)) => {
                            let left = at.saturating_duration_since(Instant::now());
                            if left.is_zero() {
                                return Err(Error::FlightTimeout {
                                    key: key.to_owned(),
                                    waited: limit,
                                });
                            }
                            Some(left)
                        }
                        None => None,
                    };
                    match caller.wait(remaining).await {
                        Err(Error::Forgotten { .. }) => {
                            trace!(key, "flight forgotten, rejoining");
                        }
                        outcome => return outcome,
                    }
                }
            }
        }
    }

    /// Evict the in-flight call for `key` and wake its waiters
    ///
    /// A no-op when nothing is in flight.
    pub fn forget(&self, key: &str) {
        let caller = self.lock().remove(key);
        if let Some(caller) = caller {
            caller.forget();
        }
    }

    /// Number of keys in flight
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is in flight
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Keys in flight
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn join(&self, key: &str) -> Role<T> {
        let mut flights = self.lock();
        if let Some(caller) = flights.get(key) {
            return Role::Follower(caller.clone());
        }
        let caller = Arc::new(Caller::new(key));
        flights.insert(key.to_owned(), caller.clone());
        Role::Leader(caller)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Caller<T>>>> {
        self.flights.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> Default for SingleFlightGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for SingleFlightGroup<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("SingleFlightGroup")
            .field("keys", &flights.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Removes the leader's flight from the group when the leader is done
struct Landing<'a, T: Clone> {
    group: &'a SingleFlightGroup<T>,
    caller: &'a Arc<Caller<T>>,
}

impl<T: Clone> Drop for Landing<'_, T> {
    fn drop(&mut self) {
        let mut flights = self.group.lock();
        // A forget may already have replaced this flight with a newer one
        if flights
            .get(self.caller.key())
            .is_some_and(|current| Arc::ptr_eq(current, self.caller))
        {
            flights.remove(self.caller.key());
        }
        trace!(key = self.caller.key(), "flight finished");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::error::Error as _;
    use std::rc::Rc;

    #[compio::test]
    async fn test_share_returns_value() {
        let caller = Caller::new("k");
        let shared = caller.share(|| async { Ok("share_foo".to_string()) }).await;
        assert_eq!(shared.unwrap(), "share_foo");
        assert!(caller.is_done());
        assert_eq!(caller.wait(None).await.unwrap(), "share_foo");
    }

    #[compio::test]
    async fn test_share_wraps_error() {
        let caller: Caller<()> = Caller::new("orders");
        let err = caller
            .share(|| async { Err(anyhow::anyhow!("foo message")) })
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "An exception occurred while sharing the result on orders"
        );
        assert_eq!(err.source().unwrap().to_string(), "foo message");

        let again = caller.wait(None).await.unwrap_err();
        assert_eq!(again.to_string(), err.to_string());
    }

    #[compio::test]
    async fn test_second_share_returns_cached_outcome() {
        let caller = Caller::new("k");
        caller.share(|| async { Ok(1) }).await.unwrap();
        let second = caller.share(|| async { Ok(2) }).await.unwrap();
        assert_eq!(second, 1);
    }

    #[compio::test]
    async fn test_wait_receives_shared_value() {
        let caller = Rc::new(Caller::new("k"));
        let sharer = caller.clone();
        compio::runtime::spawn(async move {
            compio::time::sleep(Duration::from_millis(5)).await;
            sharer.share(|| async { Ok(7) }).await
        })
        .detach();

        assert_eq!(caller.wait(None).await.unwrap(), 7);
        assert_eq!(caller.waiters(), 0);
    }

    #[compio::test]
    async fn test_wait_timeout() {
        let caller: Caller<u32> = Caller::new("slow");
        let err = caller
            .wait(Some(Duration::from_millis(2)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(err
            .to_string()
            .starts_with("Exceeded maximum waiting time for result on slow"));
        assert!(!caller.is_done());
        assert_eq!(caller.waiters(), 0);
    }

    #[compio::test]
    async fn test_forget_wakes_waiters() {
        let caller: Rc<Caller<u32>> = Rc::new(Caller::new("gone"));
        let forgetter = caller.clone();
        compio::runtime::spawn(async move {
            compio::time::sleep(Duration::from_millis(1)).await;
            forgetter.forget();
        })
        .detach();

        let err = caller.wait(None).await.unwrap_err();
        assert!(err.is_forgotten());
        assert_eq!(
            err.to_string(),
            "SingleFlight gone has been forgotten while waiting for the result"
        );
        assert!(caller.is_forgotten());

        // The executor may still deliver afterwards
        assert_eq!(caller.share(|| async { Ok(3) }).await.unwrap(), 3);
        assert_eq!(caller.wait(None).await.unwrap(), 3);
    }

    #[compio::test]
    async fn test_waiter_count_drops_on_return() {
        let caller: Rc<Caller<u32>> = Rc::new(Caller::new("k"));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let caller = caller.clone();
            handles.push(compio::runtime::spawn(async move { caller.wait(None).await }));
        }
        compio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(caller.waiters(), 5);

        caller.share(|| async { Ok(9) }).await.unwrap();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 9);
        }
        assert_eq!(caller.waiters(), 0);
    }

    #[compio::test]
    async fn test_cancelled_wait_drops_waiter() {
        let caller: Rc<Caller<u32>> = Rc::new(Caller::new("k"));
        let waiter = caller.clone();
        let waiter = compio::runtime::spawn(async move { waiter.wait(None).await });
        compio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(caller.waiters(), 1);

        drop(waiter);
        compio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(caller.waiters(), 0);
        assert!(!caller.is_done());
    }

    #[compio::test]
    async fn test_dropped_leader_forgets_flight() {
        let group: Rc<SingleFlightGroup<u32>> = Rc::new(SingleFlightGroup::new());

        let leader_group = group.clone();
        let leader = compio::runtime::spawn(async move {
            leader_group
                .run(
                    "k",
                    || async {
                        compio::time::sleep(Duration::from_secs(60)).await;
                        Ok(1)
                    },
                    None,
                )
                .await
        });
        compio::time::sleep(Duration::from_millis(5)).await;

        let follower_group = group.clone();
        let follower = compio::runtime::spawn(async move {
            follower_group.run("k", || async { Ok(2) }, None).await
        });
        compio::time::sleep(Duration::from_millis(5)).await;

        drop(leader);
        assert_eq!(follower.await.unwrap().unwrap(), 2);
        assert!(group.is_empty());
    }

    #[compio::test]
    async fn test_forget_without_flight_is_noop() {
        let group: SingleFlightGroup<u32> = SingleFlightGroup::new();
        group.forget("nothing");
        assert_eq!(group.run("nothing", || async { Ok(5) }, None).await.unwrap(), 5);
        assert!(group.is_empty());
    }
}

//! One-shot broadcast signal and timeout helper
//!
//! A [`Signal`] wakes every listener exactly once. It is a `oneshot`
//! channel whose receiver is shared between listeners: firing the signal
//! (or dropping it) completes the channel, and every clone of the shared
//! receiver observes that completion.

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

/// Wake-all, fire-once signal
pub struct Signal {
    tx: Mutex<Option<oneshot::Sender<()>>>,
    rx: Shared<oneshot::Receiver<()>>,
}

impl Signal {
    /// Create an unfired signal
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: rx.shared(),
        }
    }

    /// Fire the signal, waking all current and future listeners
    ///
    /// Returns `false` if the signal had already fired.
    pub fn fire(&self) -> bool {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        match tx {
            Some(tx) => {
                // A closed receiver only means nobody is listening yet
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    /// Whether [`fire`](Self::fire) has been called
    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }

    /// Future that resolves once the signal fires
    #[must_use]
    pub fn listen(&self) -> Listener {
        Listener(self.rx.clone())
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by [`Signal::listen`]
///
/// Resolves when the signal fires or is dropped.
#[derive(Clone)]
#[must_use = "futures do nothing unless polled"]
pub struct Listener(Shared<oneshot::Receiver<()>>);

impl Future for Listener {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|_| ())
    }
}

/// Await `fut`, giving up after `timeout`
///
/// `None` and a zero duration both mean "wait forever". Returns `None` when
/// the timeout elapsed first.
pub async fn wait_for<F: Future>(timeout: Option<Duration>, fut: F) -> Option<F::Output> {
    match timeout {
        Some(limit) if !limit.is_zero() => compio::time::timeout(limit, fut).await.ok(),
        _ => Some(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[compio::test]
    async fn test_signal_wakes_all_listeners() {
        let signal = Arc::new(Signal::new());
        let mut handles = Vec::new();
        for i in 0..5 {
            let listener = signal.listen();
            handles.push(compio::runtime::spawn(async move {
                listener.await;
                i
            }));
        }

        assert!(!signal.is_fired());
        assert!(signal.fire());
        assert!(!signal.fire());
        assert!(signal.is_fired());

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        assert_eq!(results, vec![0, 1, 2, 3, 4]);
    }

    #[compio::test]
    async fn test_listen_after_fire_is_ready() {
        let signal = Signal::new();
        signal.fire();
        assert_eq!(wait_for(Some(Duration::from_millis(10)), signal.listen()).await, Some(()));
    }

    #[compio::test]
    async fn test_dropped_signal_releases_listeners() {
        let signal = Signal::new();
        let listener = signal.listen();
        drop(signal);
        listener.await;
    }

    #[compio::test]
    async fn test_wait_for_times_out() {
        let signal = Signal::new();
        let start = Instant::now();
        let result = wait_for(Some(Duration::from_millis(20)), signal.listen()).await;
        assert_eq!(result, None);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[compio::test]
    async fn test_wait_for_zero_means_no_timeout() {
        let result = wait_for(Some(Duration::ZERO), async { 7 }).await;
        assert_eq!(result, Some(7));
        let result = wait_for(None, async { 8 }).await;
        assert_eq!(result, Some(8));
    }
}

//! Keyed, reference-counted semaphores
//!
//! Each `(key, tokens)` pair owns one [`WeightedSemaphore`]. Lookups bump a
//! reference count and [`SemaphoreRegistry::release`] drops it again; the
//! entry is removed only when nobody references it any more.

use crate::error::{Error, Result};
use compio_sync::WeightedSemaphore;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::trace;

type BatchKey = (String, usize);

struct Entry {
    semaphore: WeightedSemaphore,
    refs: usize,
}

/// Registry of shared semaphores keyed by name and capacity
#[derive(Default)]
pub struct SemaphoreRegistry {
    entries: Mutex<HashMap<BatchKey, Entry>>,
}

impl SemaphoreRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Semaphore for `(key, tokens)`, created on first use
    ///
    /// Every successful call must be paired with a [`release`](Self::release).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Semaphore`] wrapping an invalid argument error if
    /// `tokens` is 0.
    pub fn get_sema(&self, key: &str, tokens: usize) -> Result<WeightedSemaphore> {
        let mut entries = self.lock();
        let batch = (key.to_owned(), tokens);
        if let Some(entry) = entries.get_mut(&batch) {
            entry.refs += 1;
            return Ok(entry.semaphore.clone());
        }

        let semaphore = WeightedSemaphore::new(tokens).map_err(|source| Error::Semaphore {
            key: key.to_owned(),
            tokens,
            source,
        })?;
        entries.insert(
            batch,
            Entry {
                semaphore: semaphore.clone(),
                refs: 1,
            },
        );
        trace!(key, tokens, "semaphore created");
        Ok(semaphore)
    }

    /// Drop one reference to `(key, tokens)`
    ///
    /// Returns `true` if that was the last reference and the entry is gone.
    pub fn release(&self, key: &str, tokens: usize) -> bool {
        let mut entries = self.lock();
        let batch = (key.to_owned(), tokens);
        let Some(entry) = entries.get_mut(&batch) else {
            return false;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return false;
        }
        entries.remove(&batch);
        trace!(key, tokens, "semaphore removed");
        true
    }

    /// Run `f` while holding `acquire` tokens of the `(key, tokens)` semaphore
    ///
    /// The tokens and the registry reference are given back when `f`
    /// finishes, or when this future is dropped.
    ///
    /// # Errors
    ///
    /// [`Error::Semaphore`] naming the key, wrapping validation and timeout
    /// errors from the acquire; `f` is not run then.
    pub async fn call<F, Fut, T>(
        &self,
        key: &str,
        tokens: usize,
        acquire: usize,
        timeout: Option<Duration>,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let semaphore = self.get_sema(key, tokens)?;
        let _lease = Lease {
            registry: self,
            key,
            tokens,
        };
        let _permit = semaphore
            .acquire_permit(acquire, timeout)
            .await
            .map_err(|source| Error::Semaphore {
                key: key.to_owned(),
                tokens,
                source,
            })?;
        Ok(f().await)
    }

    /// Live references to `(key, tokens)`
    #[must_use]
    pub fn refs(&self, key: &str, tokens: usize) -> usize {
        self.lock()
            .get(&(key.to_owned(), tokens))
            .map_or(0, |entry| entry.refs)
    }

    /// Number of live entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no entry is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<BatchKey, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SemaphoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemaphoreRegistry")
            .field("entries", &self.len())
            .finish()
    }
}

/// Registry reference held for the duration of [`SemaphoreRegistry::call`]
struct Lease<'a> {
    registry: &'a SemaphoreRegistry,
    key: &'a str,
    tokens: usize,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.registry.release(self.key, self.tokens);
    }
}

//! Named worker pools

use super::{PoolConfig, WorkerPool};
use crate::error::{Error, Result};
use std::cell::RefCell;
use std::collections::HashMap;
use tracing::debug;

/// Registry of worker pools by name
///
/// Pools are `!Send`, so a manager belongs to one runtime thread.
#[derive(Default)]
pub struct WorkerPoolManager {
    pools: RefCell<HashMap<String, WorkerPool>>,
}

impl WorkerPoolManager {
    /// Create an empty manager
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `pool` under `name`
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicatePool`] if the name is taken.
    pub fn set_pool(&self, name: &str, pool: WorkerPool) -> Result<()> {
        let mut pools = self.pools.borrow_mut();
        if pools.contains_key(name) {
            return Err(Error::DuplicatePool(name.to_owned()));
        }
        pools.insert(name.to_owned(), pool);
        debug!(pool = name, "worker pool registered");
        Ok(())
    }

    /// Build a pool from `config` and register it under `name`
    ///
    /// # Errors
    ///
    /// [`Error::DuplicatePool`] if the name is taken (checked first), or
    /// [`Error::InvalidConfig`] from the pool.
    pub fn create_pool(&self, name: &str, config: PoolConfig) -> Result<WorkerPool> {
        if self.contains(name) {
            return Err(Error::DuplicatePool(name.to_owned()));
        }
        let pool = WorkerPool::new(config)?;
        self.set_pool(name, pool.clone())?;
        Ok(pool)
    }

    /// Pool registered under `name`
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownPool`] if there is none.
    pub fn get_pool(&self, name: &str) -> Result<WorkerPool> {
        self.pools
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownPool(name.to_owned()))
    }

    /// Whether a pool is registered under `name`
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.pools.borrow().contains_key(name)
    }

    /// Stop and unregister the pool under `name`
    ///
    /// Returns `false` if there was none.
    pub fn remove(&self, name: &str) -> bool {
        let removed = self.pools.borrow_mut().remove(name);
        match removed {
            Some(pool) => {
                pool.stop();
                true
            }
            None => false,
        }
    }

    /// Stop and unregister every pool
    pub fn remove_all(&self) {
        let pools: Vec<WorkerPool> = self.pools.borrow_mut().drain().map(|(_, p)| p).collect();
        for pool in &pools {
            pool.stop();
        }
    }

    /// Registered pool names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.borrow().keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for WorkerPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPoolManager")
            .field("pools", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[compio::test]
    async fn test_set_and_get() {
        let manager = WorkerPoolManager::new();
        let pool = WorkerPool::new(PoolConfig::new()).unwrap();
        manager.set_pool("io", pool).unwrap();

        let err = manager
            .set_pool("io", WorkerPool::new(PoolConfig::new()).unwrap())
            .unwrap_err();
        assert_eq!(err.to_string(), "Duplicate pool named io found");

        let found = manager.get_pool("io").unwrap();
        assert_eq!(
            found.submit(|| async { Ok(1) }, None, true).await.unwrap(),
            Some(1)
        );

        let err = manager.get_pool("cpu").unwrap_err();
        assert_eq!(err.to_string(), "No pool named cpu found");
        manager.remove_all();
    }

    #[compio::test]
    async fn test_remove_stops_pool() {
        let manager = WorkerPoolManager::new();
        let pool = manager.create_pool("io", PoolConfig::new()).unwrap();
        assert!(manager.create_pool("io", PoolConfig::new()).is_err());

        assert!(manager.remove("io"));
        assert!(!pool.is_running());
        assert!(!manager.remove("io"));
        assert!(manager.names().is_empty());
    }

    #[compio::test]
    async fn test_remove_all() {
        let manager = WorkerPoolManager::new();
        let a = manager.create_pool("a", PoolConfig::new()).unwrap();
        let b = manager.create_pool("b", PoolConfig::new()).unwrap();
        assert_eq!(manager.names(), vec!["a", "b"]);

        manager.remove_all();
        assert!(!a.is_running());
        assert!(!b.is_running());
        assert!(manager.names().is_empty());
    }
}

//! cosync: coroutine-level coordination for the compio runtime
//!
//! This library layers keyed, self-cleaning registries and a bounded worker
//! pool on top of the leaf primitives in [`compio_sync`]:
//!
//! - [`BarrierRegistry`] - repeated barrier rounds under one key
//! - [`SemaphoreRegistry`] - reference-counted weighted semaphores by key
//! - [`SingleFlightGroup`] - collapse concurrent identical calls into one
//! - [`pool::WorkerPool`] - fixed-capacity workers with backpressure and
//!   idle collection, plus [`pool::WorkerPoolManager`] for named pools
//!
//! Every blocking operation takes an `Option<Duration>` timeout where `None`
//! (or zero) waits forever, and is cancellation-safe: dropping the future
//! removes the caller's wait state.

pub mod barrier;
pub mod error;
pub mod pool;
pub mod semaphore;
pub mod single_flight;

// Re-export commonly used types
pub use barrier::BarrierRegistry;
pub use compio_sync::{CounterBarrier, SemaphorePermit, WeightedSemaphore};
pub use error::{Error, ErrorKind, Result, SharedError, SyncError};
pub use pool::{PoolConfig, PoolType, Task, WorkerPool, WorkerPoolManager};
pub use semaphore::SemaphoreRegistry;
pub use single_flight::{Caller, SingleFlightGroup};

//! Error handling and types

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use compio_sync::{ErrorKind, SyncError};

/// A captured closure error, shared by every caller that observes it
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Coordination errors raised by the keyed registries and the worker pool
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Failure reported by a leaf primitive (barrier, semaphore)
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Barrier round failure, tagged with its batch key
    #[error("Barrier {key} with {parties} parties failed: {source}")]
    Barrier {
        /// Barrier key
        key: String,
        /// Parties of the round
        parties: usize,
        /// Failure reported by the barrier
        #[source]
        source: SyncError,
    },

    /// Keyed semaphore failure, tagged with its batch key
    #[error("Semaphore {key} with {tokens} tokens failed: {source}")]
    Semaphore {
        /// Semaphore key
        key: String,
        /// Semaphore capacity
        tokens: usize,
        /// Failure reported by the semaphore
        #[source]
        source: SyncError,
    },

    /// Invalid pool configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A single-flight waiter gave up before the result was shared
    #[error("Exceeded maximum waiting time for result on {key} after {waited:?}")]
    FlightTimeout {
        /// Flight key
        key: String,
        /// How long the waiter waited
        waited: Duration,
    },

    /// The executing caller of a single flight failed
    #[error("An exception occurred while sharing the result on {key}")]
    SharedExecution {
        /// Flight key
        key: String,
        /// Error raised by the executor
        #[source]
        source: SharedError,
    },

    /// The flight was forgotten before its result was shared
    #[error("SingleFlight {key} has been forgotten while waiting for the result")]
    Forgotten {
        /// Flight key
        key: String,
    },

    /// No worker was released in time
    #[error("Waiting for available worker timeout after {waited:?}")]
    WorkerTimeout {
        /// How long the caller waited
        waited: Duration,
    },

    /// Every worker is busy and no more callers may block
    #[error("WorkerPool exhausted: {live} of {capacity} workers busy, {blocked} callers blocked")]
    PoolExhausted {
        /// Pool capacity
        capacity: usize,
        /// Live workers
        live: usize,
        /// Callers already blocked in `get`
        blocked: usize,
    },

    /// The pool has been stopped
    #[error("WorkerPool closed")]
    PoolClosed,

    /// The worker's task channel is closed
    #[error("Worker already stopped")]
    WorkerStopped,

    /// A task submitted to a pool failed or panicked
    #[error("Exception occurred during task execution")]
    TaskFailed {
        /// Error raised by the task
        #[source]
        source: SharedError,
    },

    /// Manager lookup miss
    #[error("No pool named {0} found")]
    UnknownPool(String),

    /// Manager already holds a pool under this name
    #[error("Duplicate pool named {0} found")]
    DuplicatePool(String),

    /// The task's result was already handed out
    #[error("Task result already taken")]
    ResultTaken,
}

impl Error {
    /// Map to the shared error taxonomy
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Sync(source) | Self::Barrier { source, .. } | Self::Semaphore { source, .. } => {
                source.kind()
            }
            Self::InvalidConfig(_) | Self::UnknownPool(_) | Self::DuplicatePool(_) => {
                ErrorKind::Validation
            }
            Self::FlightTimeout { .. } | Self::WorkerTimeout { .. } => ErrorKind::Timeout,
            Self::SharedExecution { .. } | Self::TaskFailed { .. } => ErrorKind::SharedExecution,
            Self::Forgotten { .. } => ErrorKind::Forgotten,
            Self::PoolExhausted { .. } => ErrorKind::Exhausted,
            Self::PoolClosed | Self::WorkerStopped | Self::ResultTaken => ErrorKind::State,
        }
    }

    /// Check if error is a timed out wait
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    /// Check if error is an early release by `forget`
    #[must_use]
    pub fn is_forgotten(&self) -> bool {
        self.kind() == ErrorKind::Forgotten
    }

    /// Check if error is pool exhaustion
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.kind() == ErrorKind::Exhausted
    }
}

/// Convert a closure error into its shareable form
pub(crate) fn share_error(err: anyhow::Error) -> SharedError {
    Arc::from(Box::<dyn std::error::Error + Send + Sync>::from(err))
}

pub type Result<T> = std::result::Result<T, Error>;

//! Error types for compio-sync primitives

use std::time::Duration;
use thiserror::Error;

/// Result type for compio-sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Coarse classification shared by every coordination error
///
/// Callers usually only need to know whether an error is worth retrying
/// (`Timeout`, `Exhausted`) or indicates misuse (`Validation`, `State`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad parameters supplied by the caller, raised before any mutation
    Validation,
    /// A bounded wait elapsed; the caller's wait state has been removed
    Timeout,
    /// Lifecycle misuse such as awaiting a broken barrier
    State,
    /// A bounded resource had no room and blocking was not allowed
    Exhausted,
    /// The shared executor of a deduplicated call failed
    SharedExecution,
    /// A waiter was released early because its key was evicted
    Forgotten,
}

/// Leaf primitive errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Invalid parameters
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Barrier round did not fill up in time
    #[error(
        "Barrier await timed out after {waited:?}, current waiters: {waiters}, expected parties: {parties}"
    )]
    BarrierTimeout {
        /// How long the caller waited
        waited: Duration,
        /// Waiters still blocked on the round after this caller left
        waiters: usize,
        /// Parties the round needs
        parties: usize,
    },

    /// Barrier instance already released its round
    #[error("CounterBarrier already broken ({parties} parties)")]
    BarrierBroken {
        /// Parties of the broken round
        parties: usize,
    },

    /// Semaphore acquire did not get its tokens in time
    #[error(
        "Acquire for semaphore timed out after {waited:?} for {tokens} tokens ({held} of {capacity} held)"
    )]
    SemaphoreTimeout {
        /// How long the caller waited
        waited: Duration,
        /// Tokens requested
        tokens: usize,
        /// Tokens held by others when the wait ended
        held: usize,
        /// Semaphore capacity
        capacity: usize,
    },

    /// More tokens returned than are currently held
    #[error("Semaphore released more than held: releasing {tokens}, holding {held}")]
    OverRelease {
        /// Tokens the caller tried to return
        tokens: usize,
        /// Tokens held at the time
        held: usize,
    },
}

impl SyncError {
    /// Map to the shared error taxonomy
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::Validation,
            Self::BarrierTimeout { .. } | Self::SemaphoreTimeout { .. } => ErrorKind::Timeout,
            Self::BarrierBroken { .. } | Self::OverRelease { .. } => ErrorKind::State,
        }
    }

    /// Check if error is a timed out wait
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}

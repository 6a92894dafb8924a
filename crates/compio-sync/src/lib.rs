//! Async synchronization primitives for compio runtime
//!
//! This crate provides the leaf coordination primitives used by `cosync`.
//! They are compatible with the [compio](https://github.com/compio-rs/compio)
//! async runtime, and every blocking operation takes an optional timeout
//! where `None` (or a zero duration) means wait forever.
//!
//! # Primitives
//!
//! - [`WeightedSemaphore`] - FIFO-fair semaphore where each acquire asks for
//!   a number of tokens
//! - [`CounterBarrier`] - single-round rendezvous for a fixed number of parties
//! - [`Signal`] - fire-once broadcast wakeup
//!
//! # Containers
//!
//! - [`WaitQueue`] - doubly linked queue with stable handles for O(1) removal
//! - [`MinHeap`] - binary min-heap addressable by key
//!
//! # Example
//!
//! ```rust,no_run
//! use compio_sync::WeightedSemaphore;
//!
//! #[compio::main]
//! async fn main() {
//!     let sem = WeightedSemaphore::new(100).unwrap();
//!
//!     // Spawn many tasks, but at most 100 tokens are in use at once
//!     for i in 0..1000 {
//!         let sem = sem.clone();
//!         compio::runtime::spawn(async move {
//!             let _permit = sem.acquire_permit(1 + i % 4, None).await.unwrap();
//!             println!("Task {}", i);
//!         })
//!         .detach();
//!     }
//! }
//! ```

mod barrier;
mod error;
mod heap;
mod semaphore;
mod signal;
mod wait_queue;

pub use barrier::CounterBarrier;
pub use error::{ErrorKind, Result, SyncError};
pub use heap::MinHeap;
pub use semaphore::{SemaphorePermit, WeightedSemaphore};
pub use signal::{wait_for, Listener, Signal};
pub use wait_queue::{Iter, NodeHandle, WaitQueue};

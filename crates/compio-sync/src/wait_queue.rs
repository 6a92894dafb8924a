//! Arena-backed doubly linked FIFO/LIFO queue
//!
//! `WaitQueue` is the backbone of the semaphore waiter list and the worker
//! pool free list. Nodes live in a slab owned by the queue and are addressed
//! through [`NodeHandle`]s, which makes removal of an arbitrary known node
//! O(1) without shared pointers between nodes.
//!
//! A handle carries the id of the queue that issued it and the generation of
//! its slot. Every structural operation validates both before touching the
//! links, so a handle that was already removed, or that belongs to another
//! queue, is rejected instead of corrupting the list.
//!
//! # Example
//!
//! ```rust
//! use compio_sync::WaitQueue;
//!
//! let mut queue = WaitQueue::new();
//! let first = queue.push_back("first");
//! queue.push_back("second");
//!
//! assert_eq!(queue.remove(first), Some("first"));
//! assert_eq!(queue.remove(first), None); // stale handle
//! assert_eq!(queue.pop_front(), Some("second"));
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of unique queue ids (0 is never issued)
static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Stable reference to a node inside a specific [`WaitQueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    owner: u64,
    index: usize,
    generation: u64,
}

struct Slot<T> {
    value: Option<T>,
    prev: Option<usize>,
    next: Option<usize>,
    generation: u64,
}

/// Doubly linked list over a slab of nodes
pub struct WaitQueue<T> {
    id: u64,
    slots: Vec<Slot<T>>,
    vacant: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<T> WaitQueue<T> {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            slots: Vec::new(),
            vacant: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Number of linked values
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the queue holds no values
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Handle of the first node
    #[must_use]
    pub fn front(&self) -> Option<NodeHandle> {
        self.head.map(|idx| self.handle(idx))
    }

    /// Handle of the last node
    #[must_use]
    pub fn back(&self) -> Option<NodeHandle> {
        self.tail.map(|idx| self.handle(idx))
    }

    /// Whether `handle` refers to a live node of this queue
    #[must_use]
    pub fn contains(&self, handle: NodeHandle) -> bool {
        self.resolve(handle).is_some()
    }

    /// Borrow the value behind `handle`
    #[must_use]
    pub fn get(&self, handle: NodeHandle) -> Option<&T> {
        let idx = self.resolve(handle)?;
        self.slots[idx].value.as_ref()
    }

    /// Mutably borrow the value behind `handle`
    pub fn get_mut(&mut self, handle: NodeHandle) -> Option<&mut T> {
        let idx = self.resolve(handle)?;
        self.slots[idx].value.as_mut()
    }

    /// Append a value at the back
    pub fn push_back(&mut self, value: T) -> NodeHandle {
        let idx = self.alloc(value);
        self.link(idx, self.tail, None);
        self.handle(idx)
    }

    /// Prepend a value at the front
    pub fn push_front(&mut self, value: T) -> NodeHandle {
        let idx = self.alloc(value);
        self.link(idx, None, self.head);
        self.handle(idx)
    }

    /// Insert a value right after `mark`
    ///
    /// Returns `None` and drops `value` if `mark` is not a live node of this
    /// queue.
    pub fn insert_after(&mut self, value: T, mark: NodeHandle) -> Option<NodeHandle> {
        let at = self.resolve(mark)?;
        let idx = self.alloc(value);
        let next = self.slots[at].next;
        self.link(idx, Some(at), next);
        Some(self.handle(idx))
    }

    /// Insert a value right before `mark`
    pub fn insert_before(&mut self, value: T, mark: NodeHandle) -> Option<NodeHandle> {
        let at = self.resolve(mark)?;
        let idx = self.alloc(value);
        let prev = self.slots[at].prev;
        self.link(idx, prev, Some(at));
        Some(self.handle(idx))
    }

    /// Remove and return the first value
    pub fn pop_front(&mut self) -> Option<T> {
        let idx = self.head?;
        self.release(idx)
    }

    /// Remove and return the last value
    pub fn pop_back(&mut self) -> Option<T> {
        let idx = self.tail?;
        self.release(idx)
    }

    /// Remove the node behind `handle`
    ///
    /// Returns `None` if the handle is stale or belongs to another queue.
    pub fn remove(&mut self, handle: NodeHandle) -> Option<T> {
        let idx = self.resolve(handle)?;
        self.release(idx)
    }

    /// Move a node to the front; `false` if invalid or already there
    pub fn move_to_front(&mut self, handle: NodeHandle) -> bool {
        match self.resolve(handle) {
            Some(idx) if self.head != Some(idx) => {
                self.unlink(idx);
                self.link(idx, None, self.head);
                true
            }
            _ => false,
        }
    }

    /// Move a node to the back; `false` if invalid or already there
    pub fn move_to_back(&mut self, handle: NodeHandle) -> bool {
        match self.resolve(handle) {
            Some(idx) if self.tail != Some(idx) => {
                self.unlink(idx);
                self.link(idx, self.tail, None);
                true
            }
            _ => false,
        }
    }

    /// Move `handle` right after `mark`
    pub fn move_after(&mut self, handle: NodeHandle, mark: NodeHandle) -> bool {
        let (Some(idx), Some(at)) = (self.resolve(handle), self.resolve(mark)) else {
            return false;
        };
        if idx == at {
            return false;
        }
        self.unlink(idx);
        let next = self.slots[at].next;
        self.link(idx, Some(at), next);
        true
    }

    /// Move `handle` right before `mark`
    pub fn move_before(&mut self, handle: NodeHandle, mark: NodeHandle) -> bool {
        let (Some(idx), Some(at)) = (self.resolve(handle), self.resolve(mark)) else {
            return false;
        };
        if idx == at {
            return false;
        }
        self.unlink(idx);
        let prev = self.slots[at].prev;
        self.link(idx, prev, Some(at));
        true
    }

    /// Splice all of `other` onto the back of this queue, emptying `other`
    ///
    /// Values keep their relative order. Handles issued by `other` are
    /// invalidated; the moved values get fresh slots here.
    pub fn append(&mut self, other: &mut Self) {
        while let Some(value) = other.pop_front() {
            self.push_back(value);
        }
    }

    /// Splice all of `other` onto the front of this queue, emptying `other`
    pub fn prepend(&mut self, other: &mut Self) {
        while let Some(value) = other.pop_back() {
            self.push_front(value);
        }
    }

    /// Drop every value, invalidating all outstanding handles
    pub fn clear(&mut self) {
        while self.pop_front().is_some() {}
    }

    /// Iterate values front to back
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            queue: self,
            cursor: self.head,
        }
    }

    fn handle(&self, index: usize) -> NodeHandle {
        NodeHandle {
            owner: self.id,
            index,
            generation: self.slots[index].generation,
        }
    }

    fn resolve(&self, handle: NodeHandle) -> Option<usize> {
        if handle.owner != self.id {
            return None;
        }
        let slot = self.slots.get(handle.index)?;
        (slot.generation == handle.generation && slot.value.is_some()).then_some(handle.index)
    }

    fn alloc(&mut self, value: T) -> usize {
        self.len += 1;
        if let Some(idx) = self.vacant.pop() {
            self.slots[idx].value = Some(value);
            idx
        } else {
            self.slots.push(Slot {
                value: Some(value),
                prev: None,
                next: None,
                generation: 0,
            });
            self.slots.len() - 1
        }
    }

    fn release(&mut self, idx: usize) -> Option<T> {
        self.unlink(idx);
        let slot = &mut self.slots[idx];
        slot.generation = slot.generation.wrapping_add(1);
        let value = slot.value.take();
        self.vacant.push(idx);
        self.len -= 1;
        value
    }

    fn link(&mut self, idx: usize, prev: Option<usize>, next: Option<usize>) {
        self.slots[idx].prev = prev;
        self.slots[idx].next = next;
        match prev {
            Some(p) => self.slots[p].next = Some(idx),
            None => self.head = Some(idx),
        }
        match next {
            Some(n) => self.slots[n].prev = Some(idx),
            None => self.tail = Some(idx),
        }
    }

    fn unlink(&mut self, idx: usize) {
        let prev = self.slots[idx].prev.take();
        let next = self.slots[idx].next.take();
        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }
    }
}

impl<T> Default for WaitQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for WaitQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Front-to-back iterator over a [`WaitQueue`]
pub struct Iter<'a, T> {
    queue: &'a WaitQueue<T>,
    cursor: Option<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cursor?;
        let slot = &self.queue.slots[idx];
        self.cursor = slot.next;
        slot.value.as_ref()
    }
}

impl<'a, T> IntoIterator for &'a WaitQueue<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

//! Indexed binary min-heap
//!
//! Entries are `(key, priority)` pairs ordered by priority. A side map from
//! key to heap slot is kept in step with every swap, so removing or
//! re-prioritising an entry by key is O(log n) instead of a linear search.
//! The worker pool uses it to find the worker that has been idle longest.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

/// Binary min-heap addressable by key
pub struct MinHeap<K, P> {
    items: Vec<(K, P)>,
    index: HashMap<K, usize>,
}

impl<K, P> MinHeap<K, P>
where
    K: Copy + Eq + Hash,
    P: Ord,
{
    /// Create an empty heap
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the heap is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether `key` has an entry
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Current priority of `key`
    #[must_use]
    pub fn priority(&self, key: &K) -> Option<&P> {
        self.index.get(key).map(|&i| &self.items[i].1)
    }

    /// Entry with the smallest priority
    #[must_use]
    pub fn peek(&self) -> Option<(K, &P)> {
        self.items.first().map(|(k, p)| (*k, p))
    }

    /// Insert `key`, or re-prioritise it if already present
    ///
    /// Returns the previous priority when the key was already in the heap.
    pub fn insert(&mut self, key: K, priority: P) -> Option<P> {
        if let Some(&i) = self.index.get(&key) {
            let old = std::mem::replace(&mut self.items[i].1, priority);
            self.fix(i);
            return Some(old);
        }
        self.items.push((key, priority));
        let last = self.items.len() - 1;
        self.index.insert(key, last);
        self.up(last);
        None
    }

    /// Remove and return the entry with the smallest priority
    pub fn pop(&mut self) -> Option<(K, P)> {
        if self.items.is_empty() {
            return None;
        }
        let last = self.items.len() - 1;
        self.swap(0, last);
        let (key, priority) = self.items.pop()?;
        self.index.remove(&key);
        if !self.items.is_empty() {
            self.down(0, self.items.len());
        }
        Some((key, priority))
    }

    /// Remove `key` wherever it sits, returning its priority
    pub fn remove(&mut self, key: &K) -> Option<P> {
        let i = *self.index.get(key)?;
        let last = self.items.len() - 1;
        self.swap(i, last);
        let (removed, priority) = self.items.pop()?;
        self.index.remove(&removed);
        if i < self.items.len() {
            self.fix(i);
        }
        Some(priority)
    }

    /// Replace the priority of an existing key; `false` if absent
    pub fn update(&mut self, key: &K, priority: P) -> bool {
        match self.index.get(key) {
            Some(&i) => {
                self.items[i].1 = priority;
                self.fix(i);
                true
            }
            None => false,
        }
    }

    /// Restore heap order after the entry at slot `i` changed
    pub fn fix(&mut self, i: usize) {
        if i >= self.items.len() {
            return;
        }
        if !self.down(i, self.items.len()) {
            self.up(i);
        }
    }

    /// Iterate keys in heap (not priority) order
    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.items.iter().map(|(k, _)| k)
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.items.clear();
        self.index.clear();
    }

    fn less(&self, i: usize, j: usize) -> bool {
        self.items[i].1 < self.items[j].1
    }

    fn swap(&mut self, i: usize, j: usize) {
        if i == j {
            return;
        }
        self.items.swap(i, j);
        self.index.insert(self.items[i].0, i);
        self.index.insert(self.items[j].0, j);
    }

    fn up(&mut self, mut j: usize) {
        while j > 0 {
            let i = (j - 1) / 2;
            if !self.less(j, i) {
                break;
            }
            self.swap(i, j);
            j = i;
        }
    }

    fn down(&mut self, i0: usize, n: usize) -> bool {
        let mut i = i0;
        loop {
            let j1 = 2 * i + 1;
            if j1 >= n {
                break;
            }
            let mut j = j1;
            let j2 = j1 + 1;
            if j2 < n && self.less(j2, j1) {
                j = j2;
            }
            if !self.less(j, i) {
                break;
            }
            self.swap(i, j);
            i = j;
        }
        i > i0
    }
}

impl<K, P> Default for MinHeap<K, P>
where
    K: Copy + Eq + Hash,
    P: Ord,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, P> FromIterator<(K, P)> for MinHeap<K, P>
where
    K: Copy + Eq + Hash,
    P: Ord,
{
    fn from_iter<I: IntoIterator<Item = (K, P)>>(iter: I) -> Self {
        let mut heap = Self::new();
        for (key, priority) in iter {
            heap.insert(key, priority);
        }
        heap
    }
}

impl<K: fmt::Debug, P: fmt::Debug> fmt::Debug for MinHeap<K, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.items.iter()).finish()
    }
}
